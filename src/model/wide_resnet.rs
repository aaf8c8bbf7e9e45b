//! Wide ResNet for CIFAR with Gumbel-Softmax selected block weights
//!
//! Reference: S. Zagoruyko and N. Komodakis, *Wide Residual Networks*,
//! arXiv:1605.07146, 2016.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Module, ModuleT, Result as CandleResult, Tensor, Var};
use candle_nn::{BatchNorm, Conv2d, Linear, VarBuilder, VarMap};
use tracing::{debug, info, warn};

use super::layers::{batch_norm2d, conv3x3, Stage};
use crate::checkpoint::{
    load_into, read_state_dict, select_block, state_dict, write_state_dict, CheckpointNaming,
    LoadReport, StateDict,
};
use crate::config::{WideResNetConfig, NUM_SEARCH_BLOCKS};
use crate::error::{NasError, Result};
use crate::search::ArchitectureParameters;

/// Searchable blocks, in architecture-row order
pub const BLOCK_NAMES: [&str; NUM_SEARCH_BLOCKS] = ["layer1", "layer2", "layer3", "fc"];

const STEM_PLANES: usize = 16;
const POOL_KERNEL: usize = 8;

/// CIFAR Wide ResNet with one row of architecture logits per searchable block
pub struct WideResNet {
    config: WideResNetConfig,
    device: Device,
    varmap: VarMap,
    conv1: Conv2d,
    bn1: BatchNorm,
    layer1: Stage,
    layer2: Stage,
    layer3: Stage,
    fc: Linear,
    arch: ArchitectureParameters,
    ops: Vec<usize>,
    weight_root: Option<PathBuf>,
}

impl WideResNet {
    pub fn new(config: WideResNetConfig, device: &Device) -> Result<Self> {
        config.validate()?;

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);

        let n = config.blocks_per_stage();
        let [planes1, planes2, planes3] = config.stage_planes();

        let conv1 = conv3x3(3, STEM_PLANES, 1, vb.pp("conv1"))?;
        let bn1 = batch_norm2d(STEM_PLANES, vb.pp("bn1"))?;
        let (layer1, in_planes) = Stage::new(STEM_PLANES, planes1, n, 1, vb.pp("layer1"))?;
        let (layer2, in_planes) = Stage::new(in_planes, planes2, n, 2, vb.pp("layer2"))?;
        let (layer3, in_planes) = Stage::new(in_planes, planes3, n, 2, vb.pp("layer3"))?;
        let fc = candle_nn::linear(in_planes, config.num_classes, vb.pp("fc"))?;

        let arch = ArchitectureParameters::new(
            NUM_SEARCH_BLOCKS,
            config.num_ops,
            config.tau,
            config.hard_gumbel,
            config.seed,
            device,
        )?;
        let ops = config
            .candidate_ops
            .clone()
            .unwrap_or_else(|| (0..config.num_ops).collect());
        let weight_root = config.weight_root.clone();

        info!(
            depth = config.depth,
            width = config.width,
            num_classes = config.num_classes,
            num_ops = config.num_ops,
            "Built wide resnet"
        );

        Ok(Self {
            config,
            device: device.clone(),
            varmap,
            conv1,
            bn1,
            layer1,
            layer2,
            layer3,
            fc,
            arch,
            ops,
            weight_root,
        })
    }

    pub fn config(&self) -> &WideResNetConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Variables updated by gradient descent (running statistics excluded)
    pub fn trainable_vars(&self) -> Result<Vec<Var>> {
        let vars = self
            .varmap
            .data()
            .lock()
            .map_err(|_| NasError::TrainingError("variable map lock poisoned".to_string()))?;
        let mut named: Vec<(&String, &Var)> = vars
            .iter()
            .filter(|(name, _)| !is_running_stat(name))
            .collect();
        named.sort_by(|a, b| a.0.cmp(b.0));
        Ok(named.into_iter().map(|(_, var)| var.clone()).collect())
    }

    pub fn num_parameters(&self) -> Result<usize> {
        Ok(self.trainable_vars()?.iter().map(|v| v.elem_count()).sum())
    }

    pub fn architecture(&self) -> &ArchitectureParameters {
        &self.arch
    }

    pub fn architecture_mut(&mut self) -> &mut ArchitectureParameters {
        &mut self.arch
    }

    /// Gumbel-Softmax architecture weights, concatenated into one vector when `cat`
    pub fn arch_weights(&self, cat: bool) -> Result<Tensor> {
        self.arch.arch_weights(cat)
    }

    pub fn arch_parameters(&self) -> Vec<Var> {
        self.arch.arch_parameters()
    }

    pub fn candidate_ops(&self) -> &[usize] {
        &self.ops
    }

    /// Replace the candidate table; it needs one entry per architecture column
    pub fn set_candidate_ops(&mut self, ops: Vec<usize>) -> Result<()> {
        if ops.len() != self.config.num_ops {
            return Err(NasError::invalid(
                "candidate_ops",
                ops.len(),
                "length must equal num_ops",
            ));
        }
        self.ops = ops;
        Ok(())
    }

    pub fn weight_root(&self) -> Option<&Path> {
        self.weight_root.as_deref()
    }

    fn naming(&self) -> Result<CheckpointNaming> {
        let root = self
            .weight_root
            .as_ref()
            .ok_or_else(|| NasError::ConfigError("weight_root is not set".to_string()))?;
        Ok(CheckpointNaming::new(
            root,
            &self.config.model_name,
            &self.config.loss_name,
            &self.config.checkpoint_extension,
        ))
    }

    /// Checkpoint number of the baseline network
    fn baseline_number(&self) -> usize {
        self.config.num_ops
    }

    /// Load `dict` into the whole network
    pub fn load_state_dict(&self, dict: &StateDict, strict: bool) -> Result<LoadReport> {
        load_into(&self.varmap, dict, None, strict)
    }

    /// Load `dict` (keys relative to the block) into a single block
    pub fn load_block_state_dict(&self, block: &str, dict: &StateDict, strict: bool) -> Result<LoadReport> {
        if !BLOCK_NAMES.contains(&block) {
            return Err(NasError::invalid("block", block, "unknown block name"));
        }
        load_into(&self.varmap, dict, Some(block), strict)
    }

    pub fn state_dict(&self) -> Result<StateDict> {
        state_dict(&self.varmap)
    }

    /// Write the network weights (not the alphas) as safetensors
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        write_state_dict(&self.state_dict()?, path.as_ref())?;
        info!(path = %path.as_ref().display(), "Saved model weights");
        Ok(())
    }

    /// Save the weights as the checkpoint of candidate `candidate` under the weight root
    pub fn save_candidate(&self, candidate: usize) -> Result<PathBuf> {
        let path = self.naming()?.path_for(checkpoint_number(candidate)?);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        self.save(&path)?;
        Ok(path)
    }

    /// Load the baseline weights, then each block from candidate `ops[index[i]]`.
    ///
    /// Returns the selected candidate ids.
    pub fn load_combination(&self, index: &[usize]) -> Result<Vec<usize>> {
        check_len(index, "index")?;
        let candidates = index
            .iter()
            .map(|&i| {
                self.ops.get(i).copied().ok_or_else(|| NasError::IndexOutOfRange {
                    what: "candidate index",
                    index: i,
                    len: self.ops.len(),
                })
            })
            .collect::<Result<Vec<usize>>>()?;

        let naming = self.naming()?;
        let cache = self.read_checkpoints(&naming, self.baseline_number(), &candidates)?;
        self.load_baseline(&cache, self.baseline_number(), false)?;
        self.load_blocks(&cache, &candidates)?;

        info!(?candidates, "Loaded combination");
        Ok(candidates)
    }

    /// Switch the weight root to `weight_folder`, load the baseline weights, then
    /// each block from its candidate in `combination`.
    ///
    /// A single-element combination applies one candidate to every block.
    /// Every candidate must be below `num_ops`; all checkpoints are read
    /// before any weight is written.
    pub fn load_combination_weight(
        &mut self,
        combination: &[usize],
        weight_folder: impl Into<PathBuf>,
    ) -> Result<()> {
        let candidates: Vec<usize> = match combination {
            [single] => vec![*single; NUM_SEARCH_BLOCKS],
            _ => {
                check_len(combination, "combination")?;
                combination.to_vec()
            }
        };
        for &candidate in &candidates {
            if candidate >= self.config.num_ops {
                return Err(NasError::IndexOutOfRange {
                    what: "candidate",
                    index: candidate,
                    len: self.config.num_ops,
                });
            }
        }
        self.weight_root = Some(weight_folder.into());

        let naming = self.naming()?;
        let cache = self.read_checkpoints(&naming, self.baseline_number(), &candidates)?;
        self.load_baseline(&cache, self.baseline_number(), false)?;
        self.load_blocks(&cache, &candidates)?;

        info!(?candidates, root = %naming.root().display(), "Loaded combination weights");
        Ok(())
    }

    /// Arg-max combination of the sampled architecture weights: the first
    /// block's candidate is loaded strictly into the whole network, then each
    /// block receives its own candidate. Returns the combination.
    pub fn load_gumbel_weight(&self) -> Result<Vec<usize>> {
        let combination = self.arch.combination()?;

        let whole = checkpoint_number(combination[0])?;
        let naming = self.naming()?;
        let cache = self.read_checkpoints(&naming, whole, &combination)?;
        self.load_baseline(&cache, whole, true)?;
        self.load_blocks(&cache, &combination)?;

        info!(?combination, "Loaded gumbel-selected weights");
        Ok(combination)
    }

    /// Read the whole-network checkpoint and every block checkpoint up front
    fn read_checkpoints(
        &self,
        naming: &CheckpointNaming,
        whole: usize,
        candidates: &[usize],
    ) -> Result<CheckpointCache> {
        let mut numbers = vec![whole];
        for &candidate in candidates {
            numbers.push(checkpoint_number(candidate)?);
        }
        CheckpointCache::read(naming, &numbers, &self.device)
    }

    fn load_baseline(&self, cache: &CheckpointCache, number: usize, strict: bool) -> Result<()> {
        let dict = cache.get(number)?;
        let report = self.load_state_dict(dict, strict)?;
        if !report.is_complete() {
            warn!(
                number,
                missing = ?report.missing,
                unexpected = ?report.unexpected,
                "Checkpoint does not match the network"
            );
        }
        debug!(number, strict, loaded = report.loaded.len(), "Loaded whole-network checkpoint");
        Ok(())
    }

    fn load_blocks(&self, cache: &CheckpointCache, candidates: &[usize]) -> Result<()> {
        for (block, &candidate) in BLOCK_NAMES.iter().zip(candidates) {
            let block_dict = select_block(cache.get(checkpoint_number(candidate)?)?, block);
            let report = self.load_block_state_dict(block, &block_dict, false)?;
            debug!(
                block,
                candidate,
                loaded = report.loaded.len(),
                missing = report.missing.len(),
                "Loaded block weights"
            );
        }
        Ok(())
    }
}

impl ModuleT for WideResNet {
    fn forward_t(&self, xs: &Tensor, train: bool) -> CandleResult<Tensor> {
        let xs = self.conv1.forward(xs)?;
        let xs = self.bn1.forward_t(&xs, train)?.relu()?;

        let xs = self.layer1.forward_t(&xs, train)?;
        let xs = self.layer2.forward_t(&xs, train)?;
        let xs = self.layer3.forward_t(&xs, train)?;

        let xs = xs.avg_pool2d_with_stride(POOL_KERNEL, 1)?.flatten_from(1)?;
        let logits = self.fc.forward(&xs)?;
        logits.affine(1.0 / self.config.temp, 0.0)
    }
}

fn is_running_stat(name: &str) -> bool {
    name.ends_with("running_mean") || name.ends_with("running_var")
}

/// Checkpoint files are numbered from 1; candidate `c` lives in file `c + 1`
fn checkpoint_number(candidate: usize) -> Result<usize> {
    candidate
        .checked_add(1)
        .ok_or_else(|| NasError::invalid("candidate", candidate, "has no checkpoint number"))
}

fn check_len(values: &[usize], what: &str) -> Result<()> {
    if values.len() != NUM_SEARCH_BLOCKS {
        return Err(NasError::invalid(
            what,
            format!("{:?}", values),
            "needs one entry per searchable block",
        ));
    }
    Ok(())
}

/// Checkpoints of one load operation, each file read once
struct CheckpointCache {
    entries: HashMap<usize, StateDict>,
}

impl CheckpointCache {
    fn read(naming: &CheckpointNaming, numbers: &[usize], device: &Device) -> Result<Self> {
        let mut entries = HashMap::new();
        for &number in numbers {
            if !entries.contains_key(&number) {
                entries.insert(number, read_state_dict(naming.path_for(number), device)?);
            }
        }
        Ok(Self { entries })
    }

    fn get(&self, number: usize) -> Result<&StateDict> {
        self.entries
            .get(&number)
            .ok_or_else(|| NasError::CheckpointError(format!("checkpoint {} was not read", number)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_config() -> WideResNetConfig {
        WideResNetConfig::new(8, 1).with_num_ops(5).with_seed(42)
    }

    #[test]
    fn test_forward_shape() {
        let model = WideResNet::new(tiny_config(), &Device::Cpu).unwrap();
        let x = Tensor::randn(0f32, 1f32, (2, 3, 32, 32), &Device::Cpu).unwrap();
        let logits = model.forward_t(&x, false).unwrap();
        assert_eq!(logits.dims(), &[2, 10]);
    }

    #[test]
    fn test_temperature_scales_logits() {
        let model = WideResNet::new(tiny_config(), &Device::Cpu).unwrap();
        let hot = WideResNet::new(tiny_config().with_temp(2.0), &Device::Cpu).unwrap();
        hot.load_state_dict(&model.state_dict().unwrap(), true).unwrap();

        let x = Tensor::randn(0f32, 1f32, (1, 3, 32, 32), &Device::Cpu).unwrap();
        let a = model.forward_t(&x, false).unwrap().to_vec2::<f32>().unwrap();
        let b = hot.forward_t(&x, false).unwrap().to_vec2::<f32>().unwrap();
        for (x, y) in a[0].iter().zip(b[0].iter()) {
            assert!((x / 2.0 - y).abs() < 1e-4);
        }
    }

    #[test]
    fn test_parameter_names_follow_reference_layout() {
        let model = WideResNet::new(tiny_config(), &Device::Cpu).unwrap();
        let dict = model.state_dict().unwrap();
        for key in [
            "conv1.weight",
            "bn1.running_mean",
            "layer1.0.conv1.weight",
            "layer2.0.downsample.0.weight",
            "layer3.0.downsample.1.bias",
            "fc.weight",
            "fc.bias",
        ] {
            assert!(dict.contains_key(key), "missing {}", key);
        }
        assert!(!dict.contains_key("layer1.0.downsample.0.weight"));
        assert_eq!(dict["fc.weight"].dims(), &[10, 64]);
    }

    #[test]
    fn test_trainable_vars_exclude_running_stats() {
        let model = WideResNet::new(tiny_config(), &Device::Cpu).unwrap();
        let total: usize = model
            .state_dict()
            .unwrap()
            .values()
            .map(|t| t.elem_count())
            .sum();
        let trainable = model.num_parameters().unwrap();
        assert!(trainable < total);
        assert!(trainable > 0);
    }

    #[test]
    fn test_arch_weights_shapes() {
        let model = WideResNet::new(tiny_config(), &Device::Cpu).unwrap();
        assert_eq!(model.arch_weights(false).unwrap().dims(), &[4, 5]);
        assert_eq!(model.arch_weights(true).unwrap().dims(), &[20]);
        assert_eq!(model.arch_parameters().len(), 1);
        assert_eq!(model.candidate_ops(), &[0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_load_without_weight_root_fails() {
        let model = WideResNet::new(tiny_config(), &Device::Cpu).unwrap();
        assert!(matches!(
            model.load_gumbel_weight(),
            Err(NasError::ConfigError(_))
        ));
        assert!(matches!(
            model.load_combination(&[0, 0, 0, 0]),
            Err(NasError::ConfigError(_))
        ));
    }

    #[test]
    fn test_load_combination_validates_index() {
        let model = WideResNet::new(tiny_config().with_weight_root("/tmp"), &Device::Cpu).unwrap();
        assert!(model.load_combination(&[0, 1]).is_err());
        assert!(matches!(
            model.load_combination(&[0, 1, 2, 9]),
            Err(NasError::IndexOutOfRange { index: 9, .. })
        ));
    }

    #[test]
    fn test_set_candidate_ops_checks_length() {
        let mut model = WideResNet::new(tiny_config(), &Device::Cpu).unwrap();
        assert!(model.set_candidate_ops(vec![4, 3]).is_err());
        assert_eq!(model.candidate_ops(), &[0, 1, 2, 3, 4]);

        model.set_candidate_ops(vec![4, 3, 2, 1, 0]).unwrap();
        assert_eq!(model.candidate_ops(), &[4, 3, 2, 1, 0]);
    }

    #[test]
    fn test_save_candidate_rejects_overflow() {
        let dir = tempfile::tempdir().unwrap();
        let model = WideResNet::new(tiny_config().with_weight_root(dir.path()), &Device::Cpu).unwrap();
        assert!(matches!(
            model.save_candidate(usize::MAX),
            Err(NasError::InvalidParameter { .. })
        ));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_unknown_block_rejected() {
        let model = WideResNet::new(tiny_config(), &Device::Cpu).unwrap();
        let result = model.load_block_state_dict("layer4", &StateDict::new(), false);
        assert!(result.is_err());
    }
}
