use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::{error::Result, loss::LossTargets, meta::ModelMeta};

/// One labelled object in image pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    /// Class index.
    pub class: usize,
    /// Left edge.
    pub xmin: f32,
    /// Top edge.
    pub ymin: f32,
    /// Right edge.
    pub xmax: f32,
    /// Bottom edge.
    pub ymax: f32,
}

/// Targets for a single example, flattened in `[H*W, B, ...]` order.
#[derive(Debug, Clone, PartialEq)]
pub struct ExampleTargets {
    /// `[HW, B, C]`
    pub probs: Vec<f32>,
    /// `[HW, B]`
    pub confs: Vec<f32>,
    /// `[HW, B, 4]`
    pub coord: Vec<f32>,
    /// `[HW, B]`
    pub areas: Vec<f32>,
    /// `[HW, B, 2]`
    pub upleft: Vec<f32>,
    /// `[HW, B, 2]`
    pub botright: Vec<f32>,
}

impl ExampleTargets {
    fn empty(meta: &ModelMeta) -> Self {
        let slots = meta.cells() * meta.anchor_count;
        Self {
            probs: vec![0.; slots * meta.class_count],
            confs: vec![0.; slots],
            coord: vec![0.; slots * 4],
            areas: vec![0.; slots],
            upleft: vec![0.; slots * 2],
            botright: vec![0.; slots * 2],
        }
    }
}

/// Encode the annotations of a `width x height` image.
///
/// Each object is assigned to the cell holding its centre and written to every anchor
/// slot of that cell; later objects overwrite earlier ones in the same cell. Objects whose
/// centre falls outside the grid are skipped.
pub fn encode_example(
    meta: &ModelMeta,
    width: usize,
    height: usize,
    objects: &[Annotation],
) -> ExampleTargets {
    let (grid_w, grid_h) = (meta.grid_width as f32, meta.grid_height as f32);
    let (b, c) = (meta.anchor_count, meta.class_count);
    let cell_w = width as f32 / grid_w;
    let cell_h = height as f32 / grid_h;
    let mut out = ExampleTargets::empty(meta);

    for obj in objects {
        if obj.class >= c {
            tracing::warn!("skipping object with class {} (model has {c})", obj.class);
            continue;
        }
        let cx = 0.5 * (obj.xmin + obj.xmax) / cell_w;
        let cy = 0.5 * (obj.ymin + obj.ymax) / cell_h;
        if !(0. ..grid_w).contains(&cx) || !(0. ..grid_h).contains(&cy) {
            tracing::debug!("skipping object centred outside the grid at ({cx}, {cy})");
            continue;
        }
        let sqrt_w = ((obj.xmax - obj.xmin).max(0.) / width as f32).sqrt();
        let sqrt_h = ((obj.ymax - obj.ymin).max(0.) / height as f32).sqrt();
        let x = cx - cx.floor();
        let y = cy - cy.floor();
        let cell = cy.floor() as usize * meta.grid_width + cx.floor() as usize;

        let half_w = sqrt_w * sqrt_w * 0.5 * grid_w;
        let half_h = sqrt_h * sqrt_h * 0.5 * grid_h;
        let corners = [x - half_w, y - half_h, x + half_w, y + half_h];
        let area = (corners[2] - corners[0]) * (corners[3] - corners[1]);

        for anchor in 0..b {
            let slot = cell * b + anchor;
            let probs = &mut out.probs[slot * c..(slot + 1) * c];
            probs.fill(0.);
            probs[obj.class] = 1.;
            out.confs[slot] = 1.;
            out.coord[slot * 4..slot * 4 + 4].copy_from_slice(&[x, y, sqrt_w, sqrt_h]);
            out.areas[slot] = area;
            out.upleft[slot * 2..slot * 2 + 2].copy_from_slice(&corners[..2]);
            out.botright[slot * 2..slot * 2 + 2].copy_from_slice(&corners[2..]);
        }
    }
    out
}

/// Stack per-example targets into batch tensors.
pub fn stack_targets(
    meta: &ModelMeta,
    examples: &[ExampleTargets],
    device: &Device,
) -> Result<LossTargets> {
    let n = examples.len();
    let (hw, b, c) = (meta.cells(), meta.anchor_count, meta.class_count);
    Ok(LossTargets {
        probs: Tensor::from_vec(gather(examples, |e| e.probs.as_slice()), (n, hw, b, c), device)?,
        confs: Tensor::from_vec(gather(examples, |e| e.confs.as_slice()), (n, hw, b), device)?,
        coord: Tensor::from_vec(gather(examples, |e| e.coord.as_slice()), (n, hw, b, 4), device)?,
        areas: Tensor::from_vec(gather(examples, |e| e.areas.as_slice()), (n, hw, b), device)?,
        upleft: Tensor::from_vec(gather(examples, |e| e.upleft.as_slice()), (n, hw, b, 2), device)?,
        botright: Tensor::from_vec(gather(examples, |e| e.botright.as_slice()), (n, hw, b, 2), device)?,
    })
}

fn gather(examples: &[ExampleTargets], field: impl Fn(&ExampleTargets) -> &[f32]) -> Vec<f32> {
    examples.iter().flat_map(|e| field(e).iter().copied()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> ModelMeta {
        ModelMeta {
            grid_height: 2,
            grid_width: 2,
            anchor_count: 2,
            class_count: 3,
            anchors: vec![1.0, 1.0, 2.0, 2.0],
            ..ModelMeta::default()
        }
    }

    #[test]
    fn test_object_lands_in_its_cell() {
        let meta = meta();
        // 100x100 image, 50px cells; box centred at (75, 25) spanning 50x50 px
        let obj = Annotation {
            class: 2,
            xmin: 50.,
            ymin: 0.,
            xmax: 100.,
            ymax: 50.,
        };
        let t = encode_example(&meta, 100, 100, &[obj]);
        // cell index 1 (row 0, col 1), both anchors
        assert_eq!(t.confs, vec![0., 0., 1., 1., 0., 0., 0., 0.]);
        assert_eq!(&t.probs[6..9], &[0., 0., 1.]);
        assert_eq!(&t.coord[8..12], &[0.5, 0.5, 0.5f32.sqrt(), 0.5f32.sqrt()]);
        // half the image is one cell wide: corners at centre +- 0.5 cell
        assert!((t.upleft[4] - 0.0).abs() < 1e-6);
        assert!((t.botright[5] - 1.0).abs() < 1e-6);
        assert!((t.areas[2] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_out_of_grid_and_unknown_class_are_skipped() {
        let meta = meta();
        let outside = Annotation {
            class: 0,
            xmin: 150.,
            ymin: 10.,
            xmax: 170.,
            ymax: 20.,
        };
        let unknown = Annotation {
            class: 7,
            xmin: 0.,
            ymin: 0.,
            xmax: 10.,
            ymax: 10.,
        };
        let t = encode_example(&meta, 100, 100, &[outside, unknown]);
        assert!(t.confs.iter().all(|v| *v == 0.));
    }

    #[test]
    fn test_stack_shapes() -> Result<()> {
        let meta = meta();
        let ex = encode_example(&meta, 64, 64, &[]);
        let targets = stack_targets(&meta, &[ex.clone(), ex], &Device::Cpu)?;
        assert_eq!(targets.probs.dims(), &[2, 4, 2, 3]);
        assert_eq!(targets.upleft.dims(), &[2, 4, 2, 2]);
        assert_eq!(targets.batch_size(), 2);
        Ok(())
    }
}
