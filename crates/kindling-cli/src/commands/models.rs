//! Model management commands.

use kindling_local_ai::{paths, ModelManager};
use std::path::Path;

/// List installed models.
pub(crate) fn list() -> miette::Result<()> {
    let manager = ModelManager::new();
    let models = manager
        .list_installed()
        .map_err(|e| miette::miette!("Failed to list models: {}", e))?;

    if models.is_empty() {
        println!("No models installed.");
        println!();
        println!("To install a model, run:");
        println!("  kindling models install <path/to/model.gguf>");
        return Ok(());
    }

    println!("Installed models:");
    for model in models {
        println!("  - {:<40} {}", model.name, format_size(model.size_bytes));
    }

    println!();
    println!("Models directory: {}", manager.dir().display());

    Ok(())
}

/// Copy a local model file into the models directory.
pub(crate) fn install(source: &Path) -> miette::Result<()> {
    paths::ensure_dirs()
        .map_err(|e| miette::miette!("Failed to create data directories: {}", e))?;

    if !source.exists() {
        return Err(miette::miette!("File not found: {}", source.display()));
    }

    println!("Installing model from: {}", source.display());
    let dest = ModelManager::new()
        .install_from_path(source)
        .map_err(|e| miette::miette!("Failed to install model: {}", e))?;
    println!("Model installed to: {}", dest.display());

    Ok(())
}

/// Remove an installed model.
pub(crate) fn remove(name: &str) -> miette::Result<()> {
    ModelManager::new()
        .remove(name)
        .map_err(|e| miette::miette!("Failed to remove model: {}", e))?;
    println!("Removed {}", name);
    Ok(())
}

fn format_size(bytes: u64) -> String {
    const GIB: f64 = (1u64 << 30) as f64;
    const MIB: f64 = (1u64 << 20) as f64;
    let bytes = bytes as f64;
    if bytes >= GIB {
        format!("{:.1} GiB", bytes / GIB)
    } else {
        format!("{:.1} MiB", bytes / MIB)
    }
}
