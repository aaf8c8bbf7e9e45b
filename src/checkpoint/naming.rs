//! Per-candidate checkpoint file naming

use std::path::{Path, PathBuf};

use crate::config::WideResNetConfig;
use crate::error::{NasError, Result};

/// Resolves `{root}/{model}_{loss}_{n}.{ext}` checkpoint paths
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointNaming {
    root: PathBuf,
    model_name: String,
    loss_name: String,
    extension: String,
}

impl CheckpointNaming {
    pub fn new(root: impl Into<PathBuf>, model_name: &str, loss_name: &str, extension: &str) -> Self {
        Self {
            root: root.into(),
            model_name: model_name.to_string(),
            loss_name: loss_name.to_string(),
            extension: extension.to_string(),
        }
    }

    /// Naming from a config; fails when no weight root is configured
    pub fn from_config(config: &WideResNetConfig) -> Result<Self> {
        let root = config.weight_root.as_ref().ok_or_else(|| {
            NasError::ConfigError("weight_root is not set".to_string())
        })?;
        Ok(Self::new(
            root,
            &config.model_name,
            &config.loss_name,
            &config.checkpoint_extension,
        ))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn file_name(&self, number: usize) -> String {
        format!(
            "{}_{}_{}.{}",
            self.model_name, self.loss_name, number, self.extension
        )
    }

    /// Path of checkpoint `number` (candidate id + 1, or the baseline)
    pub fn path_for(&self, number: usize) -> PathBuf {
        self.root.join(self.file_name(number))
    }
}
