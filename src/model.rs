use candle_core::{D, Module, ModuleT, Result, Tensor};
use candle_nn::{BatchNorm, Conv2d, Conv2dConfig, VarBuilder, batch_norm, conv2d, conv2d_no_bias};

use crate::meta::ModelMeta;

/// Pooling applied after a convolution block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pool {
    /// No pooling.
    None,
    /// 2x2 max-pool halving the resolution.
    Halve,
    /// 2x2 max-pool with stride 1, padded to keep the resolution.
    Keep,
}

/// Layer widths of a tiny YOLOv2 backbone.
#[derive(Debug, Clone, PartialEq)]
pub struct TinyYoloV2Config {
    /// Output channels and pooling of each 3x3 conv-bn-leaky block.
    pub blocks: Vec<(usize, Pool)>,
}

impl TinyYoloV2Config {
    /// The tiny-yolo-voc backbone: 416x416 input down to a 13x13 grid.
    pub fn voc() -> Self {
        Self {
            blocks: vec![
                (16, Pool::Halve),
                (32, Pool::Halve),
                (64, Pool::Halve),
                (128, Pool::Halve),
                (256, Pool::Halve),
                (512, Pool::Keep),
                (1024, Pool::None),
                (1024, Pool::None),
            ],
        }
    }
}

#[derive(Debug)]
struct ConvBlock {
    conv: Conv2d,
    bn: BatchNorm,
    pool: Pool,
}

impl ConvBlock {
    fn load(vb: VarBuilder, c_in: usize, c_out: usize, pool: Pool) -> Result<Self> {
        let cfg = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let conv = conv2d_no_bias(c_in, c_out, 3, cfg, vb.pp("conv"))?;
        let bn = batch_norm(c_out, 1e-3, vb.pp("bn"))?;
        Ok(Self { conv, bn, pool })
    }
}

impl ModuleT for ConvBlock {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let xs = self.conv.forward(xs)?.apply_t(&self.bn, train)?;
        let xs = candle_nn::ops::leaky_relu(&xs, 0.1)?;
        match self.pool {
            Pool::None => Ok(xs),
            Pool::Halve => xs.max_pool2d(2),
            Pool::Keep => xs
                .pad_with_same(D::Minus1, 0, 1)?
                .pad_with_same(D::Minus2, 0, 1)?
                .max_pool2d_with_stride(2, 1),
        }
    }
}

/// Tiny YOLOv2 network.
///
/// Maps `[N, 3, height, width]` images to the flat `[N, H*W*B*(5+C)]` output consumed by
/// the loss, laid out cell-major then anchor then slot.
#[derive(Debug)]
pub struct TinyYoloV2 {
    blocks: Vec<ConvBlock>,
    head: Conv2d,
}

impl TinyYoloV2 {
    /// Build the network. Every variable is created through `vb`, so a `VarMap`-backed
    /// builder names them `block{i}.conv.weight`, `block{i}.bn.running_mean`, `head.weight`...
    pub fn load(vb: VarBuilder, config: &TinyYoloV2Config, meta: &ModelMeta) -> Result<Self> {
        let mut c_in = meta.inp_size[2];
        let mut blocks = Vec::with_capacity(config.blocks.len());
        for (i, &(c_out, pool)) in config.blocks.iter().enumerate() {
            blocks.push(ConvBlock::load(vb.pp(format!("block{i}")), c_in, c_out, pool)?);
            c_in = c_out;
        }
        let head = conv2d(
            c_in,
            meta.anchor_count * meta.slot_len(),
            1,
            Default::default(),
            vb.pp("head"),
        )?;
        Ok(Self { blocks, head })
    }
}

impl ModuleT for TinyYoloV2 {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let mut xs = xs.clone();
        for block in &self.blocks {
            xs = block.forward_t(&xs, train)?;
        }
        // NCHW -> NHWC so each cell's anchors are contiguous
        self.head
            .forward(&xs)?
            .permute((0, 2, 3, 1))?
            .contiguous()?
            .flatten_from(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::tests::tiny_meta;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn tiny_config() -> TinyYoloV2Config {
        TinyYoloV2Config {
            blocks: vec![(4, Pool::Halve), (8, Pool::Keep), (8, Pool::Halve)],
        }
    }

    #[test]
    fn test_output_matches_meta_layout() -> Result<()> {
        let meta = tiny_meta();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = TinyYoloV2::load(vb, &tiny_config(), &meta)?;
        let xs = Tensor::rand(0f32, 1., (3, 3, 8, 8), &Device::Cpu)?;
        let out = model.forward_t(&xs, false)?;
        assert_eq!(out.dims(), &[3, meta.output_len()]);
        Ok(())
    }

    #[test]
    fn test_variables_have_stable_names() -> Result<()> {
        let meta = tiny_meta();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        TinyYoloV2::load(vb, &tiny_config(), &meta)?;
        let data = varmap.data().lock().unwrap();
        assert!(data.contains_key("block0.conv.weight"));
        assert!(data.contains_key("block2.bn.running_var"));
        assert!(data.contains_key("head.bias"));
        Ok(())
    }

    #[test]
    fn test_voc_grid() {
        let halvings = TinyYoloV2Config::voc()
            .blocks
            .iter()
            .filter(|(_, pool)| *pool == Pool::Halve)
            .count();
        assert_eq!(416 >> halvings, 13);
    }
}
