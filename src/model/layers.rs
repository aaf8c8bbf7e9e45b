//! Residual building blocks

use candle_core::{Module, ModuleT, Result as CandleResult, Tensor};
use candle_nn::{BatchNorm, BatchNormConfig, Conv2d, Conv2dConfig, Init, VarBuilder};

/// Convolution without bias, weights drawn from `N(0, sqrt(2 / (k * k * out)))`
pub fn conv2d_he(
    in_planes: usize,
    out_planes: usize,
    kernel: usize,
    stride: usize,
    padding: usize,
    vb: VarBuilder,
) -> CandleResult<Conv2d> {
    let fan_out = kernel * kernel * out_planes;
    let init = Init::Randn {
        mean: 0.0,
        stdev: (2.0 / fan_out as f64).sqrt(),
    };
    let weight = vb.get_with_hints((out_planes, in_planes, kernel, kernel), "weight", init)?;
    let config = Conv2dConfig {
        padding,
        stride,
        ..Default::default()
    };
    Ok(Conv2d::new(weight, None, config))
}

/// 3x3 convolution with padding
pub fn conv3x3(in_planes: usize, out_planes: usize, stride: usize, vb: VarBuilder) -> CandleResult<Conv2d> {
    conv2d_he(in_planes, out_planes, 3, stride, 1, vb)
}

/// Batch norm with weight 1, bias 0, running mean 0 and running var 1
pub fn batch_norm2d(planes: usize, vb: VarBuilder) -> CandleResult<BatchNorm> {
    candle_nn::batch_norm(planes, BatchNormConfig::default(), vb)
}

/// 1x1 projection shortcut: `downsample.0` conv, `downsample.1` batch norm
#[derive(Debug, Clone)]
pub struct Downsample {
    conv: Conv2d,
    bn: BatchNorm,
}

impl Downsample {
    pub fn new(in_planes: usize, out_planes: usize, stride: usize, vb: VarBuilder) -> CandleResult<Self> {
        Ok(Self {
            conv: conv2d_he(in_planes, out_planes, 1, stride, 0, vb.pp("0"))?,
            bn: batch_norm2d(out_planes, vb.pp("1"))?,
        })
    }
}

impl ModuleT for Downsample {
    fn forward_t(&self, xs: &Tensor, train: bool) -> CandleResult<Tensor> {
        self.bn.forward_t(&self.conv.forward(xs)?, train)
    }
}

/// Two 3x3 conv/bn pairs around an identity or projection shortcut
#[derive(Debug, Clone)]
pub struct BasicBlock {
    conv1: Conv2d,
    bn1: BatchNorm,
    conv2: Conv2d,
    bn2: BatchNorm,
    downsample: Option<Downsample>,
    stride: usize,
}

impl BasicBlock {
    pub const EXPANSION: usize = 1;

    pub fn new(in_planes: usize, planes: usize, stride: usize, vb: VarBuilder) -> CandleResult<Self> {
        let downsample = if stride != 1 || in_planes != planes * Self::EXPANSION {
            Some(Downsample::new(
                in_planes,
                planes * Self::EXPANSION,
                stride,
                vb.pp("downsample"),
            )?)
        } else {
            None
        };

        Ok(Self {
            conv1: conv3x3(in_planes, planes, stride, vb.pp("conv1"))?,
            bn1: batch_norm2d(planes, vb.pp("bn1"))?,
            conv2: conv3x3(planes, planes, 1, vb.pp("conv2"))?,
            bn2: batch_norm2d(planes, vb.pp("bn2"))?,
            downsample,
            stride,
        })
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn has_downsample(&self) -> bool {
        self.downsample.is_some()
    }
}

impl ModuleT for BasicBlock {
    fn forward_t(&self, xs: &Tensor, train: bool) -> CandleResult<Tensor> {
        let out = self.conv1.forward(xs)?;
        let out = self.bn1.forward_t(&out, train)?.relu()?;

        let out = self.conv2.forward(&out)?;
        let out = self.bn2.forward_t(&out, train)?;

        let residual = match &self.downsample {
            Some(downsample) => downsample.forward_t(xs, train)?,
            None => xs.clone(),
        };

        (out + residual)?.relu()
    }
}

/// A stage of residual blocks, named `0`, `1`, ... under the stage prefix
#[derive(Debug, Clone)]
pub struct Stage {
    blocks: Vec<BasicBlock>,
}

impl Stage {
    /// Returns the stage and its output planes
    pub fn new(
        in_planes: usize,
        planes: usize,
        num_blocks: usize,
        stride: usize,
        vb: VarBuilder,
    ) -> CandleResult<(Self, usize)> {
        let mut blocks = Vec::with_capacity(num_blocks);
        blocks.push(BasicBlock::new(in_planes, planes, stride, vb.pp("0"))?);
        let out_planes = planes * BasicBlock::EXPANSION;
        for i in 1..num_blocks {
            blocks.push(BasicBlock::new(out_planes, planes, 1, vb.pp(i.to_string()))?);
        }
        Ok((Self { blocks }, out_planes))
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

impl ModuleT for Stage {
    fn forward_t(&self, xs: &Tensor, train: bool) -> CandleResult<Tensor> {
        let mut xs = xs.clone();
        for block in &self.blocks {
            xs = block.forward_t(&xs, train)?;
        }
        Ok(xs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn names(varmap: &VarMap) -> Vec<String> {
        let mut names: Vec<String> = varmap.data().lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    #[test]
    fn test_identity_block_has_no_downsample() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let block = BasicBlock::new(16, 16, 1, vb).unwrap();
        assert!(!block.has_downsample());

        let x = Tensor::randn(0f32, 1f32, (2, 16, 8, 8), &Device::Cpu).unwrap();
        let y = block.forward_t(&x, false).unwrap();
        assert_eq!(y.dims(), &[2, 16, 8, 8]);
        let min = y.min_all().unwrap().to_scalar::<f32>().unwrap();
        assert!(min >= 0.0);
    }

    #[test]
    fn test_strided_block_downsamples() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let block = BasicBlock::new(16, 32, 2, vb).unwrap();
        assert!(block.has_downsample());
        assert_eq!(block.stride(), 2);

        let x = Tensor::randn(0f32, 1f32, (1, 16, 8, 8), &Device::Cpu).unwrap();
        let y = block.forward_t(&x, true).unwrap();
        assert_eq!(y.dims(), &[1, 32, 4, 4]);

        let names = names(&varmap);
        assert!(names.contains(&"downsample.0.weight".to_string()));
        assert!(names.contains(&"downsample.1.running_var".to_string()));
        assert!(names.contains(&"bn2.bias".to_string()));
    }

    #[test]
    fn test_stage_block_names() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let (stage, out_planes) = Stage::new(16, 32, 3, 2, vb.pp("layer2")).unwrap();
        assert_eq!(stage.len(), 3);
        assert_eq!(out_planes, 32);

        let names = names(&varmap);
        assert!(names.contains(&"layer2.0.downsample.0.weight".to_string()));
        assert!(names.contains(&"layer2.2.conv2.weight".to_string()));
        assert!(!names.contains(&"layer2.1.downsample.0.weight".to_string()));
    }
}
