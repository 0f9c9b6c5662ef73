//! Local model discovery and management.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::info;

use crate::error::LocalAIError;
use crate::paths::models_dir;

/// File extension of llama.cpp model files.
const MODEL_EXTENSION: &str = "gguf";

/// An installed model file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstalledModel {
    /// File name without the extension.
    pub name: String,
    pub path: PathBuf,
    pub size_bytes: u64,
}

/// Manager for the models directory.
pub struct ModelManager {
    dir: PathBuf,
}

impl ModelManager {
    /// Manager for the default models directory (~/.kindling/models/).
    pub fn new() -> Self {
        Self::with_dir(models_dir())
    }

    /// Manager for a custom directory.
    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// List all installed models, sorted by name.
    pub fn list_installed(&self) -> Result<Vec<InstalledModel>, LocalAIError> {
        if !self.dir.exists() {
            return Ok(vec![]);
        }

        let mut models: Vec<InstalledModel> = fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok())
            .filter(|entry| is_model_file(&entry.path()))
            .filter_map(|entry| {
                let path = entry.path();
                let name = path.file_stem()?.to_str()?.to_string();
                let size_bytes = entry.metadata().map(|m| m.len()).unwrap_or(0);
                Some(InstalledModel {
                    name,
                    path,
                    size_bytes,
                })
            })
            .collect();

        models.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(models)
    }

    /// Resolve a model reference to a file.
    ///
    /// Accepts a path to an existing file, or the name of an installed model
    /// with or without the `.gguf` extension.
    pub fn find(&self, reference: &str) -> Result<PathBuf, LocalAIError> {
        let direct = Path::new(reference);
        if direct.is_file() {
            return Ok(direct.to_path_buf());
        }

        let filename = if reference.ends_with(&format!(".{}", MODEL_EXTENSION)) {
            reference.to_string()
        } else {
            format!("{}.{}", reference, MODEL_EXTENSION)
        };
        let installed = self.dir.join(filename);
        if installed.is_file() {
            Ok(installed)
        } else {
            Err(LocalAIError::ModelNotFound(reference.to_string()))
        }
    }

    /// Copy a model file into the models directory.
    pub fn install_from_path(&self, source: &Path) -> Result<PathBuf, LocalAIError> {
        if !is_model_file(source) || !source.is_file() {
            return Err(LocalAIError::ModelNotFound(source.display().to_string()));
        }
        let filename = source
            .file_name()
            .ok_or_else(|| LocalAIError::ModelNotFound(source.display().to_string()))?;

        fs::create_dir_all(&self.dir)?;
        let dest_path = self.dir.join(filename);
        if dest_path == source {
            return Ok(dest_path);
        }

        info!("Installing model from {:?} to {:?}", source, dest_path);
        fs::copy(source, &dest_path)?;
        Ok(dest_path)
    }

    /// Remove an installed model.
    pub fn remove(&self, name: &str) -> Result<(), LocalAIError> {
        let path = self.find(name)?;
        if !path.starts_with(&self.dir) {
            return Err(LocalAIError::ModelNotFound(name.to_string()));
        }
        fs::remove_file(&path)?;
        info!("Removed model: {}", name);
        Ok(())
    }
}

impl Default for ModelManager {
    fn default() -> Self {
        Self::new()
    }
}

fn is_model_file(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.eq_ignore_ascii_case(MODEL_EXTENSION))
        .unwrap_or(false)
}
