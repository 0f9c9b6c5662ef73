//! Checks that run before llama-server is spawned.

use std::net::TcpListener;
use std::path::Path;

use tracing::{debug, warn};

use crate::error::LocalAIError;
use crate::model_config::ServerConfig;
use crate::system_info::HostFacts;

/// Fixed allowance for the server's own allocations.
const RUNTIME_OVERHEAD_BYTES: u64 = 512 * 1024 * 1024;

/// Rough KV-cache cost per context token.
const KV_BYTES_PER_TOKEN: u64 = 64 * 1024;

/// Validate a config against the host before spawning.
///
/// Fails with the first precondition that does not hold: missing model,
/// occupied port, or a model that cannot fit in physical memory.
pub fn run_prechecks(config: &ServerConfig, host: &HostFacts) -> Result<(), LocalAIError> {
    let model_len = model_file_len(&config.model_path)?;

    if !port_is_free(&config.host, config.port) {
        return Err(LocalAIError::PortInUse(config.port));
    }

    let required = estimate_required_memory(model_len, config.context_size);
    if host.total_memory_bytes > 0 && required > host.total_memory_bytes {
        return Err(LocalAIError::InsufficientMemory {
            required,
            available: host.total_memory_bytes,
        });
    }
    if required > host.available_memory_bytes {
        warn!(
            "Model needs ~{} MiB but only {} MiB is currently free; the OS will page",
            required / (1024 * 1024),
            host.available_memory_bytes / (1024 * 1024)
        );
    }

    debug!(
        "Prechecks passed for {} (estimated {} MiB)",
        config.model_path.display(),
        required / (1024 * 1024)
    );
    Ok(())
}

/// Whether a TCP listener can currently bind `host:port`.
pub fn port_is_free(host: &str, port: u16) -> bool {
    TcpListener::bind((host, port)).is_ok()
}

/// Estimated resident memory for a model of `model_len` bytes.
pub fn estimate_required_memory(model_len: u64, context_size: u32) -> u64 {
    model_len
        .saturating_add(u64::from(context_size).saturating_mul(KV_BYTES_PER_TOKEN))
        .saturating_add(RUNTIME_OVERHEAD_BYTES)
}

fn model_file_len(path: &Path) -> Result<u64, LocalAIError> {
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_file() => Ok(meta.len()),
        _ => Err(LocalAIError::ModelNotFound(path.display().to_string())),
    }
}
