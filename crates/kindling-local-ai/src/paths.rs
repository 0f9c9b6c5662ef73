//! Path utilities for Kindling data directories.

use std::path::{Path, PathBuf};

/// Environment variable that relocates the data directory.
pub const HOME_ENV: &str = "KINDLING_HOME";

/// File name of the llama-server binary on this platform.
pub const SERVER_BINARY_NAME: &str = if cfg!(target_os = "windows") {
    "llama-server.exe"
} else {
    "llama-server"
};

/// Get the Kindling data directory (`$KINDLING_HOME` or ~/.kindling/).
pub fn kindling_data_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(HOME_ENV) {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".kindling")
}

/// Get the models directory (~/.kindling/models/).
pub fn models_dir() -> PathBuf {
    kindling_data_dir().join("models")
}

/// Get the bin directory (~/.kindling/bin/).
pub fn bin_dir() -> PathBuf {
    kindling_data_dir().join("bin")
}

/// Get the path of the persisted server settings.
pub fn settings_path() -> PathBuf {
    kindling_data_dir().join("server.json")
}

/// Get the path to the bundled llama-server binary.
pub fn llama_server_path() -> PathBuf {
    bin_dir().join(SERVER_BINARY_NAME)
}

/// Candidate locations for the llama-server binary, in search order.
///
/// An explicit override always comes first. `PATH` entries come last so a
/// binary installed next to Kindling wins over a system-wide one.
pub fn server_binary_candidates(explicit: Option<&Path>) -> Vec<PathBuf> {
    let mut candidates = Vec::new();

    if let Some(path) = explicit {
        candidates.push(path.to_path_buf());
    }

    candidates.push(llama_server_path());

    if let Some(exe_dir) = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
    {
        candidates.push(exe_dir.join(SERVER_BINARY_NAME));
    }

    #[cfg(unix)]
    for dir in ["/opt/homebrew/bin", "/usr/local/bin", "/usr/bin"] {
        candidates.push(Path::new(dir).join(SERVER_BINARY_NAME));
    }

    if let Some(path_var) = std::env::var_os("PATH") {
        for dir in std::env::split_paths(&path_var) {
            let candidate = dir.join(SERVER_BINARY_NAME);
            if !candidates.contains(&candidate) {
                candidates.push(candidate);
            }
        }
    }

    candidates
}

/// Ensure the Kindling data directories exist.
pub fn ensure_dirs() -> std::io::Result<()> {
    std::fs::create_dir_all(kindling_data_dir())?;
    std::fs::create_dir_all(models_dir())?;
    std::fs::create_dir_all(bin_dir())?;
    Ok(())
}
