//! Launch parameters for llama-server, derived from the model filename.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::system_info::HostFacts;
use crate::{DEFAULT_HOST, DEFAULT_PORT};

/// Context size used when the filename matches no known size fragment.
pub const FALLBACK_CONTEXT_SIZE: u32 = 8192;

/// GPU layers offloaded when the filename matches no known size fragment.
pub const FALLBACK_GPU_LAYERS: u32 = 20;

/// Parameters for a single llama-server run.
///
/// Built fresh for every load and never modified once handed to the launcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerConfig {
    pub model_path: PathBuf,
    /// Context window in tokens.
    pub context_size: u32,
    /// Layers offloaded to the GPU.
    pub gpu_layers: u32,
    /// Inference threads, always at least 1.
    pub thread_count: u32,
    pub port: u16,
    pub host: String,
    pub flash_attention: bool,
    pub warmup_enabled: bool,
}

impl ServerConfig {
    /// Base URL of the server's HTTP API.
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    /// Command-line arguments for llama-server.
    pub fn args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "--model".into(),
            self.model_path.clone().into_os_string(),
            "--threads".into(),
            self.thread_count.to_string().into(),
            "--ctx-size".into(),
            self.context_size.to_string().into(),
            "--n-gpu-layers".into(),
            self.gpu_layers.to_string().into(),
            "--port".into(),
            self.port.to_string().into(),
            "--host".into(),
            self.host.clone().into(),
        ];
        if self.flash_attention {
            args.push("--flash-attn".into());
            args.push("on".into());
        }
        if !self.warmup_enabled {
            args.push("--no-warmup".into());
        }
        args
    }
}

/// A row of the size table: filename fragments and the profile they select.
struct SizeProfile {
    fragments: &'static [&'static str],
    context_size: u32,
    gpu_layers: u32,
}

const SIZE_PROFILES: &[SizeProfile] = &[
    SizeProfile {
        fragments: &["0.5b", "0.6b", "1b", "1.5b", "1.7b", "2b", "3b", "4b"],
        context_size: 16384,
        gpu_layers: 99,
    },
    SizeProfile {
        fragments: &["7b", "8b", "9b"],
        context_size: 8192,
        gpu_layers: 33,
    },
    SizeProfile {
        fragments: &["12b", "13b", "14b"],
        context_size: 8192,
        gpu_layers: 41,
    },
    SizeProfile {
        fragments: &["24b", "27b", "30b", "32b", "34b"],
        context_size: 4096,
        gpu_layers: 48,
    },
    SizeProfile {
        fragments: &["70b", "72b"],
        context_size: 4096,
        gpu_layers: 20,
    },
];

/// Derive launch parameters from a model path and the host's capacity.
///
/// Pure: the same inputs always produce the same config, and nothing is read
/// from disk. Unknown filenames get the fallback profile.
pub fn resolve(model_path: &Path, host: &HostFacts) -> ServerConfig {
    let name = model_path
        .file_name()
        .map(|n| n.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();

    // The leading size token names the model; later ones are suffixes such
    // as the active-parameter count of `30B-A3B`.
    let (context_size, gpu_layers) = SIZE_PROFILES
        .iter()
        .filter_map(|profile| {
            profile
                .fragments
                .iter()
                .filter_map(|f| fragment_position(&name, f))
                .min()
                .map(|position| (position, profile))
        })
        .min_by_key(|(position, _)| *position)
        .map(|(_, profile)| (profile.context_size, profile.gpu_layers))
        .unwrap_or((FALLBACK_CONTEXT_SIZE, FALLBACK_GPU_LAYERS));

    ServerConfig {
        model_path: model_path.to_path_buf(),
        context_size,
        gpu_layers,
        thread_count: thread_count_for(host),
        port: DEFAULT_PORT,
        host: DEFAULT_HOST.to_string(),
        flash_attention: true,
        warmup_enabled: true,
    }
}

/// Performance cores minus one for the supervisor, floored at 1.
pub fn thread_count_for(host: &HostFacts) -> u32 {
    host.performance_core_estimate.saturating_sub(1).max(1) as u32
}

/// Offset of the first standalone occurrence of the size token `fragment`.
///
/// `7b` matches `model-7B-Q4` and `8x7b`, but not `17b` or `7bit`.
fn fragment_position(name: &str, fragment: &str) -> Option<usize> {
    let bytes = name.as_bytes();
    name.match_indices(fragment).map(|(start, _)| start).find(|&start| {
        let end = start + fragment.len();
        let before_ok = start == 0 || {
            let b = bytes[start - 1];
            !b.is_ascii_digit() && b != b'.'
        };
        let after_ok = end == bytes.len() || !bytes[end].is_ascii_alphanumeric();
        before_ok && after_ok
    })
}
