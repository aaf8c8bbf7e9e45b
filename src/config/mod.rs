//! Model, search and training configuration
//!
//! Configurations are plain serde structs with `with_*` builders and a
//! `validate` pass. They can be stored as JSON next to the checkpoints.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{NasError, Result};

/// Number of searchable blocks (`layer1`, `layer2`, `layer3`, `fc`)
pub const NUM_SEARCH_BLOCKS: usize = 4;

/// Default number of candidate operations per block
pub const DEFAULT_NUM_OPS: usize = 350;

/// Wide ResNet + architecture search configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WideResNetConfig {
    /// Network depth, must satisfy `(depth - 2) % 6 == 0`
    pub depth: usize,
    /// Widening factor
    pub width: usize,
    /// Number of output classes
    pub num_classes: usize,
    /// Logit temperature; logits are divided by it
    pub temp: f64,
    /// Gumbel-Softmax temperature
    pub tau: f64,
    /// Candidate operations per searchable block
    pub num_ops: usize,
    /// Directory holding the per-candidate checkpoints
    pub weight_root: Option<PathBuf>,
    /// Model name used in checkpoint file names
    pub model_name: String,
    /// Loss name used in checkpoint file names
    pub loss_name: String,
    /// Checkpoint file extension
    pub checkpoint_extension: String,
    /// Candidate table mapping a search index to a candidate id (identity when unset)
    pub candidate_ops: Option<Vec<usize>>,
    /// Straight-through hard Gumbel-Softmax
    pub hard_gumbel: bool,
    /// Seed for alpha init and Gumbel noise
    pub seed: Option<u64>,
}

impl Default for WideResNetConfig {
    fn default() -> Self {
        Self {
            depth: 26,
            width: 10,
            num_classes: 10,
            temp: 1.0,
            tau: 0.1,
            num_ops: DEFAULT_NUM_OPS,
            weight_root: None,
            model_name: "wide_resnet".to_string(),
            loss_name: "cross_entropy".to_string(),
            checkpoint_extension: "model".to_string(),
            candidate_ops: None,
            hard_gumbel: false,
            seed: None,
        }
    }
}

impl WideResNetConfig {
    pub fn new(depth: usize, width: usize) -> Self {
        Self {
            depth,
            width,
            ..Default::default()
        }
    }

    pub fn with_num_classes(mut self, num_classes: usize) -> Self {
        self.num_classes = num_classes;
        self
    }

    pub fn with_temp(mut self, temp: f64) -> Self {
        self.temp = temp;
        self
    }

    pub fn with_tau(mut self, tau: f64) -> Self {
        self.tau = tau;
        self
    }

    pub fn with_num_ops(mut self, num_ops: usize) -> Self {
        self.num_ops = num_ops;
        self
    }

    pub fn with_weight_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.weight_root = Some(root.into());
        self
    }

    pub fn with_model_name(mut self, name: impl Into<String>) -> Self {
        self.model_name = name.into();
        self
    }

    pub fn with_candidate_ops(mut self, ops: Vec<usize>) -> Self {
        self.candidate_ops = Some(ops);
        self
    }

    pub fn with_hard_gumbel(mut self, hard: bool) -> Self {
        self.hard_gumbel = hard;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Residual blocks per stage (0 for depths below 8)
    pub fn blocks_per_stage(&self) -> usize {
        self.depth.saturating_sub(2) / 6
    }

    /// Output planes of the three stages
    pub fn stage_planes(&self) -> [usize; 3] {
        [16 * self.width, 32 * self.width, 64 * self.width]
    }

    pub fn validate(&self) -> Result<()> {
        if self.depth < 8 || (self.depth - 2) % 6 != 0 {
            return Err(NasError::invalid(
                "depth",
                self.depth,
                "must be of the form 6n + 2 with n >= 1",
            ));
        }
        if self.width == 0 {
            return Err(NasError::invalid("width", self.width, "must be positive"));
        }
        if self.num_classes == 0 {
            return Err(NasError::invalid("num_classes", self.num_classes, "must be positive"));
        }
        if !(self.temp > 0.0) {
            return Err(NasError::invalid("temp", self.temp, "must be positive"));
        }
        if !(self.tau > 0.0) {
            return Err(NasError::invalid("tau", self.tau, "must be positive"));
        }
        if self.num_ops == 0 {
            return Err(NasError::invalid("num_ops", self.num_ops, "must be positive"));
        }
        if let Some(ops) = &self.candidate_ops {
            if ops.len() != self.num_ops {
                return Err(NasError::invalid(
                    "candidate_ops",
                    ops.len(),
                    "length must equal num_ops",
                ));
            }
        }
        Ok(())
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            NasError::ConfigError(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }
}

/// Training configuration for network weights and architecture parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Weight learning rate (SGD)
    pub learning_rate: f64,
    /// Number of epochs
    pub epochs: usize,
    /// Mini-batch size
    pub batch_size: usize,
    /// Architecture learning rate
    pub arch_learning_rate: f64,
    /// Architecture weight decay
    pub arch_weight_decay: f64,
    /// Shuffle seed
    pub seed: Option<u64>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.1,
            epochs: 1,
            batch_size: 128,
            arch_learning_rate: 3e-4,
            arch_weight_decay: 1e-3,
            seed: Some(42),
        }
    }
}

impl TrainingConfig {
    pub fn with_learning_rate(mut self, lr: f64) -> Self {
        self.learning_rate = lr;
        self
    }

    pub fn with_epochs(mut self, epochs: usize) -> Self {
        self.epochs = epochs;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_arch_learning_rate(mut self, lr: f64) -> Self {
        self.arch_learning_rate = lr;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.learning_rate > 0.0) {
            return Err(NasError::invalid("learning_rate", self.learning_rate, "must be positive"));
        }
        if self.batch_size == 0 {
            return Err(NasError::invalid("batch_size", self.batch_size, "must be positive"));
        }
        if !(self.arch_learning_rate > 0.0) {
            return Err(NasError::invalid(
                "arch_learning_rate",
                self.arch_learning_rate,
                "must be positive",
            ));
        }
        Ok(())
    }
}
