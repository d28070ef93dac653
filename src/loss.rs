use std::sync::Once;

use candle_core::{D, Device, Tensor};

use crate::{
    box_match::{BoxMatcher, GroundTruthGeometry},
    error::{Result, YoloError},
    meta::ModelMeta,
};

/// Ground-truth tensors for one batch, all shaped `[N, H*W, B, ...]`.
///
/// Built once by the data pipeline and only read afterwards.
#[derive(Debug, Clone)]
pub struct LossTargets {
    /// One-hot class targets, `[N, HW, B, C]`.
    pub probs: Tensor,
    /// Objectness, 1 for every anchor of a cell holding an object, `[N, HW, B]`.
    pub confs: Tensor,
    /// Encoded ground-truth boxes `[x, y, sqrt(w), sqrt(h)]`, `[N, HW, B, 4]`.
    pub coord: Tensor,
    /// Ground-truth areas in cells, `[N, HW, B]`.
    pub areas: Tensor,
    /// Ground-truth upper-left corners, `[N, HW, B, 2]`.
    pub upleft: Tensor,
    /// Ground-truth bottom-right corners, `[N, HW, B, 2]`.
    pub botright: Tensor,
}

impl LossTargets {
    /// Number of examples in the batch.
    pub fn batch_size(&self) -> usize {
        self.confs.dims().first().copied().unwrap_or(0)
    }

    /// Corner geometry used by the IOU computation.
    pub fn geometry(&self) -> GroundTruthGeometry<'_> {
        GroundTruthGeometry {
            areas: &self.areas,
            upleft: &self.upleft,
            botright: &self.botright,
        }
    }

    /// Move every target tensor to `device`.
    pub fn to_device(&self, device: &Device) -> candle_core::Result<Self> {
        Ok(Self {
            probs: self.probs.to_device(device)?,
            confs: self.confs.to_device(device)?,
            coord: self.coord.to_device(device)?,
            areas: self.areas.to_device(device)?,
            upleft: self.upleft.to_device(device)?,
            botright: self.botright.to_device(device)?,
        })
    }
}

/// YOLOv2 region loss.
///
/// A weighted sum of squared errors over coordinates, confidence and class
/// probabilities. Classes are regressed with L2 towards their one-hot target.
pub struct YoloLoss {
    meta: ModelMeta,
    matcher: BoxMatcher,
    logged: Once,
}

impl YoloLoss {
    /// Create the loss for a model on a device.
    pub fn new(meta: ModelMeta, device: &Device) -> Result<Self> {
        meta.validate()?;
        let matcher = BoxMatcher::new(&meta, device)?;
        Ok(Self {
            meta,
            matcher,
            logged: Once::new(),
        })
    }

    /// The metadata the loss was built from.
    pub fn meta(&self) -> &ModelMeta {
        &self.meta
    }

    /// Reshape raw network output into `[N, H*W, B, 5 + C]`.
    ///
    /// Any output whose size is not a whole number of examples is a configuration error;
    /// nothing is truncated.
    pub fn reshape_output(&self, raw: &Tensor) -> Result<Tensor> {
        let m = &self.meta;
        let per_example = m.output_len();
        let total = raw.elem_count();
        if total == 0 || total % per_example != 0 {
            return Err(YoloError::Configuration(format!(
                "Input to reshape is a tensor with {total} values, but the requested shape \
                 [-1, {}, {}, {}, {}] requires a multiple of {per_example}",
                m.grid_height,
                m.grid_width,
                m.anchor_count,
                m.slot_len()
            )));
        }
        Ok(raw.reshape((total / per_example, m.cells(), m.anchor_count, m.slot_len()))?)
    }

    /// Scalar loss for a batch of raw network output.
    pub fn compute(&self, raw: &Tensor, targets: &LossTargets) -> Result<Tensor> {
        self.logged.call_once(|| self.meta.log_loss_hyper_parameters());

        let m = &self.meta;
        let out = self.reshape_output(raw)?;
        let (n, hw, b, _) = out.dims4()?;
        if n != targets.batch_size() {
            return Err(YoloError::Configuration(format!(
                "network produced {n} examples for a batch of {}",
                targets.batch_size()
            )));
        }

        let decoded = self.matcher.decode_coords(&out.narrow(D::Minus1, 0, 4)?)?;
        let conf = candle_nn::ops::sigmoid(&out.narrow(D::Minus1, 4, 1)?)?;
        let probs = candle_nn::ops::softmax(&out.narrow(D::Minus1, 5, m.class_count)?, D::Minus1)?;
        let prediction = Tensor::cat(&[&decoded, &conf, &probs], D::Minus1)?;

        let resp = self
            .matcher
            .responsibility(&decoded, &targets.geometry(), &targets.confs)?;
        let resp4 = resp.unsqueeze(D::Minus1)?;

        // noobject * (1 - r) + object * r
        let conf_weight = resp4.affine(
            (m.object_scale - m.noobject_scale) as f64,
            m.noobject_scale as f64,
        )?;
        let coord_weight = resp4
            .affine(m.coord_scale as f64, 0.0)?
            .broadcast_as((n, hw, b, 4))?
            .contiguous()?;
        let class_weight = resp4
            .affine(m.class_scale as f64, 0.0)?
            .broadcast_as((n, hw, b, m.class_count))?
            .contiguous()?;
        let weight = Tensor::cat(&[&coord_weight, &conf_weight, &class_weight], D::Minus1)?;
        let truth = Tensor::cat(&[&targets.coord, &resp4, &targets.probs], D::Minus1)?;

        Ok(weighted_square_error(&prediction, &truth, &weight)?)
    }
}

/// `0.5 * mean_batch(sum(weight * (prediction - truth)^2))` over `[N, ...]` tensors.
pub fn weighted_square_error(
    prediction: &Tensor,
    truth: &Tensor,
    weight: &Tensor,
) -> candle_core::Result<Tensor> {
    let n = prediction.dim(0)?;
    let per_example = ((prediction - truth)?.sqr()? * weight)?
        .reshape((n, ()))?
        .sum(1)?;
    per_example.mean_all()? * 0.5
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Var};

    fn toy_meta() -> ModelMeta {
        ModelMeta {
            name: "toy".to_string(),
            grid_height: 2,
            grid_width: 2,
            anchor_count: 2,
            class_count: 3,
            anchors: vec![1.0, 1.0, 2.0, 1.5],
            ..ModelMeta::default()
        }
    }

    fn toy_targets(meta: &ModelMeta, n: usize, dev: &Device) -> candle_core::Result<LossTargets> {
        let (hw, b, c) = (meta.cells(), meta.anchor_count, meta.class_count);
        // one object in cell 0 of every example, class 1, centred, 1x1 cells
        let mut probs = vec![0f32; n * hw * b * c];
        let mut confs = vec![0f32; n * hw * b];
        let mut coord = vec![0f32; n * hw * b * 4];
        let mut areas = vec![0f32; n * hw * b];
        let upleft = vec![0f32; n * hw * b * 2];
        let mut botright = vec![0f32; n * hw * b * 2];
        for e in 0..n {
            for a in 0..b {
                let slot = e * hw * b + a;
                probs[slot * c + 1] = 1.0;
                confs[slot] = 1.0;
                coord[slot * 4..slot * 4 + 4].copy_from_slice(&[0.5, 0.5, 0.5f32.sqrt(), 0.5f32.sqrt()]);
                areas[slot] = 1.0;
                botright[slot * 2..slot * 2 + 2].copy_from_slice(&[1.0, 1.0]);
            }
        }
        Ok(LossTargets {
            probs: Tensor::from_vec(probs, (n, hw, b, c), dev)?,
            confs: Tensor::from_vec(confs, (n, hw, b), dev)?,
            coord: Tensor::from_vec(coord, (n, hw, b, 4), dev)?,
            areas: Tensor::from_vec(areas, (n, hw, b), dev)?,
            upleft: Tensor::from_vec(upleft, (n, hw, b, 2), dev)?,
            botright: Tensor::from_vec(botright, (n, hw, b, 2), dev)?,
        })
    }

    #[test]
    fn test_loss_is_non_negative() -> Result<()> {
        let dev = Device::Cpu;
        let meta = toy_meta();
        let loss = YoloLoss::new(meta.clone(), &dev)?;
        let targets = toy_targets(&meta, 3, &dev)?;
        for seed in 0..4 {
            let raw = Tensor::randn(seed as f32 * 0.1, 2.0, (3, meta.output_len()), &dev)?;
            let value = loss.compute(&raw, &targets)?.to_scalar::<f32>()?;
            assert!(value.is_finite());
            assert!(value >= 0.0);
        }
        Ok(())
    }

    #[test]
    fn test_exact_match_gives_zero() -> candle_core::Result<()> {
        let dev = Device::Cpu;
        let pred = Tensor::from_vec(vec![0.5f32, 0.25, 1.0, 0.0, 0.3, 0.7], (2, 3), &dev)?;
        let weight = Tensor::from_vec(vec![5f32, 1.0, 2.0, 0.5, 3.0, 1.0], (2, 3), &dev)?;
        let value = weighted_square_error(&pred, &pred, &weight)?.to_scalar::<f32>()?;
        assert_eq!(value, 0.0);
        Ok(())
    }

    #[test]
    fn test_weighted_square_error_averages_over_batch() -> candle_core::Result<()> {
        let dev = Device::Cpu;
        let pred = Tensor::from_vec(vec![1f32, 0.0, 0.0, 2.0], (2, 2), &dev)?;
        let truth = Tensor::zeros((2, 2), DType::F32, &dev)?;
        let weight = Tensor::ones((2, 2), DType::F32, &dev)?;
        // per example sums 1 and 4, mean 2.5, halved
        let value = weighted_square_error(&pred, &truth, &weight)?.to_scalar::<f32>()?;
        assert!((value - 1.25).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_only_noobject_term_without_objects() -> Result<()> {
        let dev = Device::Cpu;
        let meta = ModelMeta {
            noobject_scale: 0.0,
            ..toy_meta()
        };
        let loss = YoloLoss::new(meta.clone(), &dev)?;
        let mut targets = toy_targets(&meta, 2, &dev)?;
        targets.confs = targets.confs.zeros_like()?;
        let raw = Tensor::randn(0f32, 1.0, (2, meta.output_len()), &dev)?;
        let value = loss.compute(&raw, &targets)?.to_scalar::<f32>()?;
        assert_eq!(value, 0.0);
        Ok(())
    }

    #[test]
    fn test_shape_mismatch_is_configuration_error() -> Result<()> {
        let dev = Device::Cpu;
        let meta = toy_meta();
        let loss = YoloLoss::new(meta.clone(), &dev)?;
        let targets = toy_targets(&meta, 1, &dev)?;
        let raw = Tensor::zeros((1, meta.output_len() - 1), DType::F32, &dev)?;
        let err = loss.compute(&raw, &targets).unwrap_err();
        assert!(matches!(err, YoloError::Configuration(_)));
        assert!(err.to_string().contains("configuration"));
        Ok(())
    }

    #[test]
    fn test_gradient_reaches_raw_output() -> Result<()> {
        let dev = Device::Cpu;
        let meta = toy_meta();
        let loss = YoloLoss::new(meta.clone(), &dev)?;
        let targets = toy_targets(&meta, 1, &dev)?;
        let raw = Var::zeros((1, meta.output_len()), DType::F32, &dev)?;
        let value = loss.compute(raw.as_tensor(), &targets)?;
        let grads = value.backward()?;
        let grad = grads.get(raw.as_tensor()).expect("gradient for raw output");
        let norm = grad.sqr()?.sum_all()?.to_scalar::<f32>()?;
        assert!(norm > 0.0);
        Ok(())
    }
}
