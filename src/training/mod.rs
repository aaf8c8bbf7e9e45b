//! Network weight training
//!
//! Trains the plain Wide ResNet with cross-entropy so the resulting weights can
//! be saved as candidate checkpoints, and evaluates a loaded combination.

mod trainer;

pub use trainer::{evaluate, EpochMetrics, Trainer};
