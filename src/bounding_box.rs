use serde::Serialize;

/// Axis-aligned detection box, in image fractions or pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BoundingBox {
    /// Minimum x coordinate of the bounding box.
    pub xmin: f32,
    /// Minimum y coordinate of the bounding box.
    pub ymin: f32,
    /// Maximum x coordinate of the bounding box.
    pub xmax: f32,
    /// Maximum y coordinate of the bounding box.
    pub ymax: f32,
    /// Class score: class probability times objectness.
    pub confidence: f32,
    /// Class index of the bounding box.
    pub class: u32,
}

impl BoundingBox {
    /// Build a box from its centre and size.
    pub fn from_center(cx: f32, cy: f32, w: f32, h: f32, confidence: f32, class: u32) -> Self {
        Self {
            xmin: cx - w * 0.5,
            ymin: cy - h * 0.5,
            xmax: cx + w * 0.5,
            ymax: cy + h * 0.5,
            confidence,
            class,
        }
    }

    /// Width of the box, never negative.
    pub fn width(&self) -> f32 {
        (self.xmax - self.xmin).max(0.)
    }

    /// Height of the box, never negative.
    pub fn height(&self) -> f32 {
        (self.ymax - self.ymin).max(0.)
    }

    /// Area of the box.
    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    /// Scale a box expressed in `[0, 1]` image fractions to pixels, clamped to the image.
    pub fn to_pixels(&self, width: usize, height: usize) -> Self {
        let (w, h) = (width as f32, height as f32);
        Self {
            xmin: (self.xmin * w).clamp(0., w - 1.),
            ymin: (self.ymin * h).clamp(0., h - 1.),
            xmax: (self.xmax * w).clamp(0., w - 1.),
            ymax: (self.ymax * h).clamp(0., h - 1.),
            ..*self
        }
    }
}

/// Intersection over union of two bounding boxes.
///
/// Disjoint or degenerate pairs give 0.
pub fn iou(b1: &BoundingBox, b2: &BoundingBox) -> f32 {
    let i_w = (b1.xmax.min(b2.xmax) - b1.xmin.max(b2.xmin)).max(0.);
    let i_h = (b1.ymax.min(b2.ymax) - b1.ymin.max(b2.ymin)).max(0.);
    let i_area = i_w * i_h;
    let union = b1.area() + b2.area() - i_area;
    if union <= 0. { 0. } else { i_area / union }
}

/// Non-maximum suppression for bounding boxes grouped by class.
///
/// Each group is sorted by confidence and boxes overlapping a kept box by more than
/// `threshold` are dropped.
pub fn non_maximum_suppression(bboxes: &mut [Vec<BoundingBox>], threshold: f32) {
    for bboxes_for_class in bboxes.iter_mut() {
        bboxes_for_class.sort_by(|b1, b2| b2.confidence.total_cmp(&b1.confidence));
        let mut current_index = 0;
        for index in 0..bboxes_for_class.len() {
            let drop = (0..current_index)
                .any(|prev| iou(&bboxes_for_class[prev], &bboxes_for_class[index]) > threshold);
            if !drop {
                bboxes_for_class.swap(current_index, index);
                current_index += 1;
            }
        }
        bboxes_for_class.truncate(current_index);
    }
}
