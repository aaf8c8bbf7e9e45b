//! Checkpoints and state dicts
//!
//! Candidate checkpoints are whole-network state dicts. A block receives a
//! candidate's weights by selecting the entries under its name and loading them
//! with the block prefix removed.

mod format;
mod loader;
mod naming;

pub use format::{read_state_dict, write_state_dict, CheckpointFormat, StateDict};
pub use loader::{load_into, select_block, state_dict, LoadReport};
pub use naming::CheckpointNaming;
