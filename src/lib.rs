//! Wide ResNet NAS - Gumbel-Softmax architecture search over a CIFAR Wide ResNet
//!
//! A Wide Residual Network whose searchable blocks (`layer1`, `layer2`,
//! `layer3`, `fc`) receive pretrained weights from per-candidate checkpoints.
//! The candidate of each block comes either from an explicit combination or
//! from the arg-max of Gumbel-Softmax sampled architecture weights.
//!
//! # Modules
//!
//! ## Network and search
//! - [`model`] - Wide ResNet, residual blocks, weight-loading operations
//! - [`search`] - architecture parameters, Gumbel-Softmax, arch optimizer
//! - [`checkpoint`] - state dicts, checkpoint naming and formats
//!
//! ## Training
//! - [`data`] - CIFAR-10 binary batches
//! - [`training`] - cross-entropy training and evaluation
//!
//! ## Services
//! - [`cli`] - Command-line interface
//!
//! Tensors, autograd, convolution and batch normalization come from
//! `candle-core` / `candle-nn`.

// Core error handling
pub mod error;
pub mod config;

// Network and search
pub mod checkpoint;
pub mod model;
pub mod search;

// Training
pub mod data;
pub mod training;

// Services
pub mod cli;

pub use error::{NasError, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::error::{NasError, Result};

    pub use crate::config::{TrainingConfig, WideResNetConfig};

    pub use crate::model::{WideResNet, BLOCK_NAMES};
    pub use crate::search::{expected_loss, ArchitectureOptimizer, ArchitectureParameters};
    pub use crate::checkpoint::{CheckpointNaming, LoadReport, StateDict};

    pub use crate::data::Dataset;
    pub use crate::training::{evaluate, EpochMetrics, Trainer};
}
