//! Checkpoint file formats

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::Read;
use std::path::Path;

use candle_core::{Device, Tensor};
use tracing::debug;

use crate::error::{NasError, Result};

/// Parameter name -> tensor, ordered by name
pub type StateDict = BTreeMap<String, Tensor>;

/// Prefix added by data-parallel wrappers
const DATA_PARALLEL_PREFIX: &str = "module.";

/// On-disk checkpoint format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointFormat {
    /// Zip archive written by `torch.save`
    PyTorch,
    /// safetensors
    SafeTensors,
}

impl CheckpointFormat {
    /// Detect the format from the leading bytes of the file
    pub fn detect(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut file = File::open(path).map_err(|e| {
            NasError::CheckpointError(format!("Failed to open {}: {}", path.display(), e))
        })?;
        let mut head = [0u8; 9];
        let mut filled = 0;
        while filled < head.len() {
            let n = file.read(&mut head[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }

        if filled >= 4 && head[..4] == *b"PK\x03\x04" {
            return Ok(Self::PyTorch);
        }
        if filled == head.len() && head[8] == b'{' {
            return Ok(Self::SafeTensors);
        }
        Err(NasError::CheckpointError(format!(
            "Unrecognized checkpoint format: {}",
            path.display()
        )))
    }
}

/// Read a checkpoint into a state dict on `device`
pub fn read_state_dict(path: impl AsRef<Path>, device: &Device) -> Result<StateDict> {
    let path = path.as_ref();
    let format = CheckpointFormat::detect(path)?;
    let entries: Vec<(String, Tensor)> = match format {
        CheckpointFormat::PyTorch => candle_core::pickle::read_all(path)?,
        CheckpointFormat::SafeTensors => candle_core::safetensors::load(path, device)?
            .into_iter()
            .collect(),
    };

    let mut dict = StateDict::new();
    for (name, tensor) in entries {
        let name = name
            .strip_prefix(DATA_PARALLEL_PREFIX)
            .map(str::to_string)
            .unwrap_or(name);
        dict.insert(name, tensor.to_device(device)?);
    }
    debug!(path = %path.display(), ?format, tensors = dict.len(), "Read checkpoint");
    Ok(dict)
}

/// Write a state dict as safetensors
pub fn write_state_dict(dict: &StateDict, path: impl AsRef<Path>) -> Result<()> {
    let tensors: HashMap<String, Tensor> = dict
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    candle_core::safetensors::save(&tensors, path.as_ref())?;
    Ok(())
}
