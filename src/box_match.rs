use candle_core::{D, DType, Device, Tensor};

use crate::meta::ModelMeta;

/// Ground-truth corner geometry precomputed by the data pipeline.
#[derive(Debug, Clone)]
pub struct GroundTruthGeometry<'a> {
    /// Ground-truth box areas, `[N, HW, B]`.
    pub areas: &'a Tensor,
    /// Ground-truth upper-left corners, `[N, HW, B, 2]`.
    pub upleft: &'a Tensor,
    /// Ground-truth bottom-right corners, `[N, HW, B, 2]`.
    pub botright: &'a Tensor,
}

/// Decodes raw coordinate channels and assigns anchors to ground-truth objects.
///
/// Tensors are laid out as `[batch, H*W, B, ...]`. Box centres are offsets inside their
/// cell; widths and heights are measured in cells once the square-root encoding is undone.
#[derive(Debug, Clone)]
pub struct BoxMatcher {
    /// `[1, 1, B, 2]` anchor widths and heights in cells.
    anchors: Tensor,
    /// `[1, 1, 1, 2]` holding `[W, H]`.
    grid: Tensor,
}

impl BoxMatcher {
    /// Build the matcher constants for a model on a device.
    pub fn new(meta: &ModelMeta, device: &Device) -> candle_core::Result<Self> {
        let anchors = Tensor::from_vec(meta.anchors.clone(), (1, 1, meta.anchor_count, 2), device)?;
        let grid = Tensor::from_vec(
            vec![meta.grid_width as f32, meta.grid_height as f32],
            (1, 1, 1, 2),
            device,
        )?;
        Ok(Self { anchors, grid })
    }

    /// Decode raw `[N, HW, B, 4]` coordinates into `[σ(x), σ(y), sqrt(w), sqrt(h)]`.
    ///
    /// `sqrt(w) = sqrt(exp(raw_w) * anchor_w / W)`; the square root keeps gradients of
    /// small boxes from vanishing next to large ones.
    pub fn decode_coords(&self, raw: &Tensor) -> candle_core::Result<Tensor> {
        let xy = candle_nn::ops::sigmoid(&raw.narrow(D::Minus1, 0, 2)?)?;
        let wh = raw
            .narrow(D::Minus1, 2, 2)?
            .exp()?
            .broadcast_mul(&self.anchors)?
            .broadcast_div(&self.grid)?
            .sqrt()?;
        Tensor::cat(&[&xy, &wh], D::Minus1)
    }

    /// Corner form of decoded boxes: `(upleft, botright, area)` in cell units.
    pub fn corners(&self, decoded: &Tensor) -> candle_core::Result<(Tensor, Tensor, Tensor)> {
        let wh = decoded
            .narrow(D::Minus1, 2, 2)?
            .sqr()?
            .broadcast_mul(&self.grid)?;
        let area = (wh.narrow(D::Minus1, 0, 1)? * wh.narrow(D::Minus1, 1, 1)?)?.squeeze(D::Minus1)?;
        let centers = decoded.narrow(D::Minus1, 0, 2)?;
        let half = (&wh * 0.5)?;
        let upleft = (&centers - &half)?;
        let botright = (&centers + &half)?;
        Ok((upleft, botright, area))
    }

    /// IOU of every decoded prediction against its cell's ground truth, `[N, HW, B]`.
    pub fn iou(
        &self,
        decoded: &Tensor,
        truth: &GroundTruthGeometry<'_>,
    ) -> candle_core::Result<Tensor> {
        let (upleft, botright, area) = self.corners(decoded)?;
        intersection_over_union(&upleft, &botright, &area, truth)
    }

    /// Responsibility mask `[N, HW, B]`: best-IOU anchors of cells holding an object.
    ///
    /// The match is computed on detached predictions, no gradient flows through it.
    pub fn responsibility(
        &self,
        decoded: &Tensor,
        truth: &GroundTruthGeometry<'_>,
        confs: &Tensor,
    ) -> candle_core::Result<Tensor> {
        let iou = self.iou(&decoded.detach(), truth)?;
        best_boxes(&iou)? * confs
    }
}

/// `intersection / (truth_area + pred_area - intersection)` with a zero union giving 0.
pub fn intersection_over_union(
    upleft: &Tensor,
    botright: &Tensor,
    area: &Tensor,
    truth: &GroundTruthGeometry<'_>,
) -> candle_core::Result<Tensor> {
    let inter_upleft = upleft.maximum(truth.upleft)?;
    let inter_botright = botright.minimum(truth.botright)?;
    // disjoint boxes have a negative extent on at least one axis
    let inter_wh = (inter_botright - inter_upleft)?.maximum(0f32)?;
    let intersect = (inter_wh.narrow(D::Minus1, 0, 1)? * inter_wh.narrow(D::Minus1, 1, 1)?)?
        .squeeze(D::Minus1)?;
    let union = ((truth.areas + area)? - &intersect)?;
    let empty = union.le(0f32)?;
    let zeros = union.zeros_like()?;
    let safe_union = empty.where_cond(&union.ones_like()?, &union)?;
    empty.where_cond(&zeros, &(intersect / safe_union)?)
}

/// Marks, per cell, every anchor whose IOU equals the cell maximum.
///
/// Exact float equality: anchors tying on the maximum are all marked.
pub fn best_boxes(iou: &Tensor) -> candle_core::Result<Tensor> {
    let row_max = iou.max_keepdim(D::Minus1)?.broadcast_as(iou.shape())?;
    iou.eq(&row_max)?.to_dtype(DType::F32)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(cx: f32, cy: f32, side: f32) -> ([f32; 2], [f32; 2], f32) {
        let h = side / 2.0;
        ([cx - h, cy - h], [cx + h, cy + h], side * side)
    }

    fn single(
        pred: ([f32; 2], [f32; 2], f32),
        gt: ([f32; 2], [f32; 2], f32),
    ) -> candle_core::Result<f32> {
        let dev = Device::Cpu;
        let t2 = |v: [f32; 2]| Tensor::from_vec(v.to_vec(), (1, 1, 1, 2), &dev);
        let t1 = |v: f32| Tensor::from_vec(vec![v], (1, 1, 1), &dev);
        let (gt_ul, gt_br, gt_area) = (t2(gt.0)?, t2(gt.1)?, t1(gt.2)?);
        let truth = GroundTruthGeometry {
            areas: &gt_area,
            upleft: &gt_ul,
            botright: &gt_br,
        };
        let iou = intersection_over_union(&t2(pred.0)?, &t2(pred.1)?, &t1(pred.2)?, &truth)?;
        iou.flatten_all()?.to_vec1::<f32>().map(|v| v[0])
    }

    #[test]
    fn test_disjoint_boxes_have_zero_iou() -> candle_core::Result<()> {
        for (a, b) in [((0.0, 0.0), (5.0, 5.0)), ((0.0, 0.0), (1.0, 0.0)), ((2.0, 1.0), (-3.0, 1.0))] {
            let iou = single(square(a.0, a.1, 1.0), square(b.0, b.1, 1.0))?;
            assert_eq!(iou, 0.0);
        }
        Ok(())
    }

    #[test]
    fn test_identical_boxes_have_unit_iou() -> candle_core::Result<()> {
        let iou = single(square(0.3, 0.7, 2.0), square(0.3, 0.7, 2.0))?;
        assert!((iou - 1.0).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_half_overlap() -> candle_core::Result<()> {
        // two unit squares sharing half their area: 0.5 / 1.5
        let iou = single(square(0.0, 0.0, 1.0), square(0.5, 0.0, 1.0))?;
        assert!((iou - 1.0 / 3.0).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_degenerate_boxes_are_zero_not_nan() -> candle_core::Result<()> {
        let iou = single(([0.0, 0.0], [0.0, 0.0], 0.0), ([0.0, 0.0], [0.0, 0.0], 0.0))?;
        assert_eq!(iou, 0.0);
        Ok(())
    }

    #[test]
    fn test_best_boxes_include_ties() -> candle_core::Result<()> {
        let iou = Tensor::from_vec(vec![0.2f32, 0.2, 0.1, 0.0, 0.7, 0.3], (1, 2, 3), &Device::Cpu)?;
        let best = best_boxes(&iou)?.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(best, vec![1.0, 1.0, 0.0, 0.0, 1.0, 0.0]);
        Ok(())
    }

    #[test]
    fn test_decode_coords_uses_anchor_and_grid() -> candle_core::Result<()> {
        let meta = ModelMeta {
            grid_height: 2,
            grid_width: 4,
            anchor_count: 1,
            anchors: vec![2.0, 8.0],
            ..ModelMeta::default()
        };
        let matcher = BoxMatcher::new(&meta, &Device::Cpu)?;
        let raw = Tensor::zeros((1, 1, 1, 4), DType::F32, &Device::Cpu)?;
        let decoded = matcher.decode_coords(&raw)?.flatten_all()?.to_vec1::<f32>()?;
        assert!((decoded[0] - 0.5).abs() < 1e-6);
        assert!((decoded[1] - 0.5).abs() < 1e-6);
        // sqrt(2 / 4) and sqrt(8 / 2)
        assert!((decoded[2] - 0.5f32.sqrt()).abs() < 1e-6);
        assert!((decoded[3] - 2.0).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_responsibility_masks_cells_without_objects() -> candle_core::Result<()> {
        let meta = ModelMeta {
            grid_height: 1,
            grid_width: 2,
            anchor_count: 2,
            anchors: vec![1.0, 1.0, 2.0, 2.0],
            ..ModelMeta::default()
        };
        let dev = Device::Cpu;
        let matcher = BoxMatcher::new(&meta, &dev)?;
        // both cells predict the raw anchors centred in the cell
        let raw = Tensor::zeros((1, 2, 2, 4), DType::F32, &dev)?;
        let decoded = matcher.decode_coords(&raw)?;
        // cell 0 holds a 1x1 box at the cell centre, cell 1 is empty
        let upleft = Tensor::from_vec(vec![0f32, 0., 0., 0., 0., 0., 0., 0.], (1, 2, 2, 2), &dev)?;
        let botright = Tensor::from_vec(vec![1f32, 1., 1., 1., 0., 0., 0., 0.], (1, 2, 2, 2), &dev)?;
        let areas = Tensor::from_vec(vec![1f32, 1., 0., 0.], (1, 2, 2), &dev)?;
        let confs = Tensor::from_vec(vec![1f32, 1., 0., 0.], (1, 2, 2), &dev)?;
        let truth = GroundTruthGeometry {
            areas: &areas,
            upleft: &upleft,
            botright: &botright,
        };
        let resp = matcher.responsibility(&decoded, &truth, &confs)?;
        assert_eq!(resp.flatten_all()?.to_vec1::<f32>()?, vec![1.0, 0.0, 0.0, 0.0]);
        Ok(())
    }
}
