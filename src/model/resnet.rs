//! ResNet backbones with train-mode batch norm
//!
//! Parameter names follow the torchvision layout (`conv1`, `bn1`,
//! `layer{1..4}.{i}.*`, `downsample.{0,1}`, `fc`), so pre-trained weights
//! exported from torchvision or `candle-transformers` load unchanged.
//! Batch norm normalizes with batch statistics and updates its running
//! statistics when `train` is set.

use candle_core::{Module, Tensor, D};
use candle_nn::{BatchNorm, Conv2d, Conv2dConfig, Linear, VarBuilder};

use crate::error::Result;

const BN_EPS: f64 = 1e-5;

fn conv2d(c_in: usize, c_out: usize, ksize: usize, padding: usize, stride: usize, vb: VarBuilder) -> Result<Conv2d> {
    let config = Conv2dConfig {
        stride,
        padding,
        ..Default::default()
    };
    Ok(candle_nn::conv2d_no_bias(c_in, c_out, ksize, config, vb)?)
}

fn batch_norm(channels: usize, vb: VarBuilder) -> Result<BatchNorm> {
    Ok(candle_nn::batch_norm(channels, BN_EPS, vb)?)
}

/// 1x1 projection on the skip path when the block changes shape
struct Downsample {
    conv: Conv2d,
    bn: BatchNorm,
}

impl Downsample {
    fn new(c_in: usize, c_out: usize, stride: usize, vb: VarBuilder) -> Result<Option<Self>> {
        if stride == 1 && c_in == c_out {
            return Ok(None);
        }
        Ok(Some(Self {
            conv: conv2d(c_in, c_out, 1, 0, stride, vb.pp(0))?,
            bn: batch_norm(c_out, vb.pp(1))?,
        }))
    }

    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        Ok(xs.apply(&self.conv)?.apply_t(&self.bn, train)?)
    }
}

/// Either residual block flavour
enum Block {
    Basic {
        conv1: Conv2d,
        bn1: BatchNorm,
        conv2: Conv2d,
        bn2: BatchNorm,
        downsample: Option<Downsample>,
    },
    Bottleneck {
        conv1: Conv2d,
        bn1: BatchNorm,
        conv2: Conv2d,
        bn2: BatchNorm,
        conv3: Conv2d,
        bn3: BatchNorm,
        downsample: Option<Downsample>,
    },
}

impl Block {
    const BOTTLENECK_EXPANSION: usize = 4;

    fn basic(c_in: usize, c_out: usize, stride: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self::Basic {
            conv1: conv2d(c_in, c_out, 3, 1, stride, vb.pp("conv1"))?,
            bn1: batch_norm(c_out, vb.pp("bn1"))?,
            conv2: conv2d(c_out, c_out, 3, 1, 1, vb.pp("conv2"))?,
            bn2: batch_norm(c_out, vb.pp("bn2"))?,
            downsample: Downsample::new(c_in, c_out, stride, vb.pp("downsample"))?,
        })
    }

    fn bottleneck(c_in: usize, c_out: usize, stride: usize, vb: VarBuilder) -> Result<Self> {
        let expanded = c_out * Self::BOTTLENECK_EXPANSION;
        Ok(Self::Bottleneck {
            conv1: conv2d(c_in, c_out, 1, 0, 1, vb.pp("conv1"))?,
            bn1: batch_norm(c_out, vb.pp("bn1"))?,
            conv2: conv2d(c_out, c_out, 3, 1, stride, vb.pp("conv2"))?,
            bn2: batch_norm(c_out, vb.pp("bn2"))?,
            conv3: conv2d(c_out, expanded, 1, 0, 1, vb.pp("conv3"))?,
            bn3: batch_norm(expanded, vb.pp("bn3"))?,
            downsample: Downsample::new(c_in, expanded, stride, vb.pp("downsample"))?,
        })
    }

    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let (ys, downsample) = match self {
            Self::Basic {
                conv1,
                bn1,
                conv2,
                bn2,
                downsample,
            } => {
                let ys = xs
                    .apply(conv1)?
                    .apply_t(bn1, train)?
                    .relu()?
                    .apply(conv2)?
                    .apply_t(bn2, train)?;
                (ys, downsample)
            }
            Self::Bottleneck {
                conv1,
                bn1,
                conv2,
                bn2,
                conv3,
                bn3,
                downsample,
            } => {
                let ys = xs
                    .apply(conv1)?
                    .apply_t(bn1, train)?
                    .relu()?
                    .apply(conv2)?
                    .apply_t(bn2, train)?
                    .relu()?
                    .apply(conv3)?
                    .apply_t(bn3, train)?;
                (ys, downsample)
            }
        };
        let skip = match downsample {
            Some(downsample) => downsample.forward_t(xs, train)?,
            None => xs.clone(),
        };
        Ok((skip + ys)?.relu()?)
    }
}

/// Block flavour and per-stage depth
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResNetConfig {
    /// Bottleneck blocks (ResNet-50 and deeper) instead of basic blocks
    pub bottleneck: bool,
    /// Blocks in each of the four stages
    pub depths: [usize; 4],
}

impl ResNetConfig {
    /// ResNet-18
    pub fn resnet18() -> Self {
        Self {
            bottleneck: false,
            depths: [2, 2, 2, 2],
        }
    }

    /// ResNet-50
    pub fn resnet50() -> Self {
        Self {
            bottleneck: true,
            depths: [3, 4, 6, 3],
        }
    }

    fn expansion(&self) -> usize {
        if self.bottleneck {
            Block::BOTTLENECK_EXPANSION
        } else {
            1
        }
    }
}

/// Residual network with a linear classification head
pub struct ResNet {
    conv1: Conv2d,
    bn1: BatchNorm,
    stages: Vec<Vec<Block>>,
    fc: Linear,
}

impl ResNet {
    /// Build the network, registering its parameters through `vb`
    pub fn new(config: ResNetConfig, num_classes: usize, vb: VarBuilder) -> Result<Self> {
        let conv1 = conv2d(3, 64, 7, 3, 2, vb.pp("conv1"))?;
        let bn1 = batch_norm(64, vb.pp("bn1"))?;

        let expansion = config.expansion();
        let mut c_in = 64;
        let mut stages = Vec::with_capacity(4);
        for (stage, &depth) in config.depths.iter().enumerate() {
            let width = 64 << stage;
            let stride = if stage == 0 { 1 } else { 2 };
            let vb_stage = vb.pp(format!("layer{}", stage + 1));
            let mut blocks = Vec::with_capacity(depth);
            for index in 0..depth {
                let block_stride = if index == 0 { stride } else { 1 };
                let block = if config.bottleneck {
                    Block::bottleneck(c_in, width, block_stride, vb_stage.pp(index))?
                } else {
                    Block::basic(c_in, width, block_stride, vb_stage.pp(index))?
                };
                blocks.push(block);
                c_in = width * expansion;
            }
            stages.push(blocks);
        }

        let fc = candle_nn::linear(512 * expansion, num_classes, vb.pp("fc"))?;
        Ok(Self {
            conv1,
            bn1,
            stages,
            fc,
        })
    }

    /// Logits of shape `[batch, num_classes]`
    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let mut xs = xs
            .apply(&self.conv1)?
            .apply_t(&self.bn1, train)?
            .relu()?
            .pad_with_same(D::Minus1, 1, 1)?
            .pad_with_same(D::Minus2, 1, 1)?
            .max_pool2d_with_stride(3, 2)?;
        for block in self.stages.iter().flatten() {
            xs = block.forward_t(&xs, train)?;
        }
        let pooled = xs.mean(D::Minus1)?.mean(D::Minus1)?;
        Ok(self.fc.forward(&pooled)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn build(config: ResNetConfig) -> (VarMap, ResNet) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let net = ResNet::new(config, 3, vb).unwrap();
        (varmap, net)
    }

    fn var(varmap: &VarMap, name: &str) -> Vec<f32> {
        varmap.data().lock().unwrap()[name]
            .as_tensor()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap()
    }

    #[test]
    fn test_resnet18_names_and_shape() {
        let (varmap, net) = build(ResNetConfig::resnet18());
        {
            let data = varmap.data().lock().unwrap();
            for name in [
                "conv1.weight",
                "bn1.running_mean",
                "layer1.0.conv1.weight",
                "layer2.0.downsample.0.weight",
                "layer4.1.bn2.bias",
                "fc.weight",
            ] {
                assert!(data.contains_key(name), "missing {}", name);
            }
            assert!(!data.contains_key("layer1.0.downsample.0.weight"));
        }

        let images = Tensor::randn(0f32, 1.0, (2, 3, 32, 32), &Device::Cpu).unwrap();
        assert_eq!(net.forward_t(&images, false).unwrap().dims(), &[2, 3]);
    }

    #[test]
    fn test_resnet50_uses_bottlenecks() {
        let (varmap, _) = build(ResNetConfig::resnet50());
        let data = varmap.data().lock().unwrap();
        assert!(data.contains_key("layer1.0.conv3.weight"));
        assert!(data.contains_key("layer1.0.downsample.1.running_var"));
        assert_eq!(data["fc.weight"].as_tensor().dims(), &[3, 2048]);
    }

    #[test]
    fn test_running_stats_update_only_in_train_mode() {
        let (varmap, net) = build(ResNetConfig::resnet18());
        let images = Tensor::randn(1f32, 2.0, (2, 3, 32, 32), &Device::Cpu).unwrap();
        let initial = var(&varmap, "bn1.running_mean");

        net.forward_t(&images, false).unwrap();
        assert_eq!(var(&varmap, "bn1.running_mean"), initial);

        net.forward_t(&images, true).unwrap();
        assert_ne!(var(&varmap, "bn1.running_mean"), initial);
    }
}
