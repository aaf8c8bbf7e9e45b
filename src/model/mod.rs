//! Network definition
//!
//! - [`layers`] - convolution helpers, `BasicBlock`, projection shortcut, stages
//! - [`wide_resnet`] - the searched Wide ResNet and its weight-loading operations

pub mod layers;
pub mod wide_resnet;

pub use layers::{BasicBlock, Downsample, Stage};
pub use wide_resnet::{WideResNet, BLOCK_NAMES};
