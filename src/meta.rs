use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, YoloError};

/// Model metadata describing the detection head and the loss hyper-parameters.
///
/// Loaded once per run and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMeta {
    /// Architecture family, e.g. `"yolov2"`.
    #[serde(default = "ModelMeta::default_model")]
    pub model: String,
    /// Name used for checkpoint files.
    pub name: String,
    /// Output grid height `H`.
    pub grid_height: usize,
    /// Output grid width `W`.
    pub grid_width: usize,
    /// Anchor boxes per cell `B`.
    pub anchor_count: usize,
    /// Number of classes `C`.
    pub class_count: usize,
    /// Flat `[w0, h0, w1, h1, ...]` anchor list in grid units.
    pub anchors: Vec<f32>,
    /// Weight of the class regression term.
    pub class_scale: f32,
    /// Weight of the confidence term for responsible anchors.
    pub object_scale: f32,
    /// Weight of the confidence term for unresponsible anchors.
    pub noobject_scale: f32,
    /// Weight of the coordinate term.
    pub coord_scale: f32,
    /// Network input size `[height, width, channels]`.
    #[serde(default = "ModelMeta::default_inp_size")]
    pub inp_size: [usize; 3],
    /// Class names, indexed by class id.
    #[serde(default)]
    pub labels: Vec<String>,
}

impl ModelMeta {
    fn default_model() -> String {
        "yolov2".to_string()
    }

    fn default_inp_size() -> [usize; 3] {
        [416, 416, 3]
    }

    /// Read and validate metadata from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let file = std::fs::File::open(path.as_ref())?;
        let meta: ModelMeta = serde_json::from_reader(std::io::BufReader::new(file))?;
        meta.validate()?;
        Ok(meta)
    }

    /// Write the metadata next to a built model.
    pub fn to_json_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let file = std::fs::File::create(path.as_ref())?;
        serde_json::to_writer_pretty(file, self)?;
        Ok(())
    }

    /// Check the invariants the loss and decoder rely on.
    pub fn validate(&self) -> Result<()> {
        if self.grid_height == 0 || self.grid_width == 0 {
            return Err(YoloError::InvalidMeta(format!(
                "grid must be non-empty, got {}x{}",
                self.grid_height, self.grid_width
            )));
        }
        if self.anchor_count == 0 || self.class_count == 0 {
            return Err(YoloError::InvalidMeta(format!(
                "anchor_count ({}) and class_count ({}) must be positive",
                self.anchor_count, self.class_count
            )));
        }
        if self.anchors.len() != 2 * self.anchor_count {
            return Err(YoloError::InvalidMeta(format!(
                "expected {} anchor values for {} anchors, got {}",
                2 * self.anchor_count,
                self.anchor_count,
                self.anchors.len()
            )));
        }
        if self.anchors.iter().any(|a| !a.is_finite() || *a <= 0.0) {
            return Err(YoloError::InvalidMeta(
                "anchors must be finite and positive".to_string(),
            ));
        }
        if !self.labels.is_empty() && self.labels.len() != self.class_count {
            return Err(YoloError::InvalidMeta(format!(
                "{} labels for {} classes",
                self.labels.len(),
                self.class_count
            )));
        }
        Ok(())
    }

    /// Number of grid cells `H * W`.
    pub fn cells(&self) -> usize {
        self.grid_height * self.grid_width
    }

    /// Values predicted per anchor slot, `5 + C`.
    pub fn slot_len(&self) -> usize {
        5 + self.class_count
    }

    /// Values the network emits per example, `H * W * B * (5 + C)`.
    pub fn output_len(&self) -> usize {
        self.cells() * self.anchor_count * self.slot_len()
    }

    /// Anchors as ordered `(width, height)` pairs.
    pub fn anchor_pairs(&self) -> Vec<(f32, f32)> {
        self.anchors.chunks_exact(2).map(|p| (p[0], p[1])).collect()
    }

    /// Label for a class id, falling back to the id itself.
    pub fn label(&self, class: usize) -> String {
        self.labels
            .get(class)
            .cloned()
            .unwrap_or_else(|| class.to_string())
    }

    pub(crate) fn log_loss_hyper_parameters(&self) {
        tracing::info!("{} loss hyper-parameters:", self.model);
        tracing::info!("\tH       = {}", self.grid_height);
        tracing::info!("\tW       = {}", self.grid_width);
        tracing::info!("\tbox     = {}", self.anchor_count);
        tracing::info!("\tclasses = {}", self.class_count);
        tracing::info!(
            "\tscales  = {:?}",
            [
                self.class_scale,
                self.object_scale,
                self.noobject_scale,
                self.coord_scale
            ]
        );
        tracing::info!("\tanchors = {:?}", self.anchor_pairs());
    }
}

/// Tiny YOLOv2 on VOC: 13x13 grid, 5 anchors, 20 classes.
impl Default for ModelMeta {
    fn default() -> Self {
        Self {
            model: Self::default_model(),
            name: "tiny-yolo-voc".to_string(),
            grid_height: 13,
            grid_width: 13,
            anchor_count: 5,
            class_count: 20,
            anchors: vec![
                1.08, 1.19, 3.42, 4.41, 6.63, 11.38, 9.42, 5.11, 16.62, 10.52,
            ],
            class_scale: 1.0,
            object_scale: 5.0,
            noobject_scale: 1.0,
            coord_scale: 1.0,
            inp_size: Self::default_inp_size(),
            labels: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_meta_is_valid() {
        let meta = ModelMeta::default();
        meta.validate().unwrap();
        assert_eq!(meta.output_len(), 13 * 13 * 5 * 25);
        assert_eq!(meta.anchor_pairs()[1], (3.42, 4.41));
    }

    #[test]
    fn test_anchor_count_mismatch_is_rejected() {
        let meta = ModelMeta {
            anchors: vec![1.0, 1.0, 2.0],
            anchor_count: 2,
            ..ModelMeta::default()
        };
        assert!(matches!(meta.validate(), Err(YoloError::InvalidMeta(_))));
    }

    #[test]
    fn test_json_round_trip_fills_defaults() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("meta.json");
        std::fs::write(
            &path,
            r#"{"name":"toy","grid_height":2,"grid_width":3,"anchor_count":1,
               "class_count":2,"anchors":[1.0,1.0],"class_scale":1.0,
               "object_scale":5.0,"noobject_scale":1.0,"coord_scale":1.0}"#,
        )?;
        let meta = ModelMeta::from_json_file(&path)?;
        assert_eq!(meta.model, "yolov2");
        assert_eq!(meta.inp_size, [416, 416, 3]);
        assert_eq!(meta.cells(), 6);
        assert_eq!(meta.label(1), "1");
        Ok(())
    }
}
