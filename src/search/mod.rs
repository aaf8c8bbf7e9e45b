//! Differentiable architecture search
//!
//! Architecture logits (alphas) hold one row per searchable block and one
//! column per candidate operation. A fixed Gumbel sample turns them into
//! architecture weights through the Gumbel-Softmax relaxation; the arg-max of
//! each row selects the candidate whose pretrained weights a block receives.

mod arch;
mod gumbel;
mod optimizer;

pub use arch::ArchitectureParameters;
pub use gumbel::{gumbel_like, gumbel_softmax, sample_gumbel};
pub use optimizer::{expected_loss, ArchitectureOptimizer};
