use std::path::Path;

use candle_core::{DType, Device, ModuleT, Tensor};
use candle_nn::{VarBuilder, VarMap};
use kornia_image::Image;

use super::{
    bounding_box::{BoundingBox, non_maximum_suppression},
    data::prepare_image,
    error::{Result, YoloError},
    meta::ModelMeta,
    model::{TinyYoloV2, TinyYoloV2Config},
};

/// YOLOv2 configuration struct.
pub struct YoloV2Config {
    /// Detection head and input size of the model
    pub meta: ModelMeta,
    /// Backbone layer widths
    pub backbone: TinyYoloV2Config,
    /// The confidence threshold for the model
    pub confidence_threshold: f32,
    /// The non-maximum suppression threshold for the model
    pub nms_threshold: f32,
    /// Whether to use the CPU or GPU
    pub use_cpu: bool,
}

/// Default configuration for tiny YOLOv2 on VOC.
impl Default for YoloV2Config {
    fn default() -> Self {
        Self {
            meta: ModelMeta::default(),
            backbone: TinyYoloV2Config::voc(),
            confidence_threshold: 0.25,
            nms_threshold: 0.45,
            use_cpu: true,
        }
    }
}

/// YOLOv2 high level interface.
pub struct YoloV2 {
    config: YoloV2Config,
    device: Device,
    model: TinyYoloV2,
}

impl YoloV2 {
    /// Load weights from a safetensors file, e.g. a training checkpoint.
    pub fn new(config: YoloV2Config, weights: impl AsRef<Path>) -> Result<Self> {
        config.meta.validate()?;
        let device = Self::device(&config)?;
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[weights.as_ref()], DType::F32, &device)?
        };
        let model = TinyYoloV2::load(vb, &config.backbone, &config.meta)?;
        Ok(Self {
            config,
            device,
            model,
        })
    }

    /// Download `file` from the Hugging Face model repository `repo` and load it.
    pub fn from_hub(config: YoloV2Config, repo: &str, file: &str) -> Result<Self> {
        // check if the model is already downloaded or download it
        let model_path = hf_hub::api::sync::Api::new()?
            .model(repo.to_string())
            .get(file)?;
        Self::new(config, model_path)
    }

    /// Build the model over the variables of a training `VarMap`.
    pub fn from_varmap(config: YoloV2Config, varmap: &VarMap) -> Result<Self> {
        config.meta.validate()?;
        let device = Self::device(&config)?;
        let vb = VarBuilder::from_varmap(varmap, DType::F32, &device);
        let model = TinyYoloV2::load(vb, &config.backbone, &config.meta)?;
        Ok(Self {
            config,
            device,
            model,
        })
    }

    fn device(config: &YoloV2Config) -> Result<Device> {
        if config.use_cpu {
            Ok(Device::Cpu)
        } else {
            Device::cuda_if_available(0)
                .map_err(|e| YoloError::Configuration(format!("cuda:0 error: {e}")))
        }
    }

    /// Perform inference on an rgb8 image
    pub fn inference(&self, image: &Image<u8, 3>) -> Result<Vec<BoundingBox>> {
        let [height, width, _] = self.config.meta.inp_size;
        let pixels = prepare_image(image, width, height)?;
        let image_t = Tensor::from_vec(pixels, (height, width, 3), &self.device)?
            .permute((2, 0, 1))?
            .unsqueeze(0)?;

        let raw = self.model.forward_t(&image_t, false)?.squeeze(0)?;
        let raw = raw.to_dtype(DType::F32)?.to_vec1::<f32>()?;

        let mut bboxes = decode_boxes(&self.config.meta, &raw, self.config.confidence_threshold)?;
        non_maximum_suppression(&mut bboxes, self.config.nms_threshold);

        Ok(bboxes
            .into_iter()
            .flatten()
            .map(|b| b.to_pixels(image.width(), image.height()))
            .collect())
    }
}

/// Decode the raw output of one example into boxes grouped by class.
///
/// Boxes are in `[0, 1]` image fractions; each anchor contributes at most one box, for
/// its best class, when `softmax(class) * sigmoid(confidence)` exceeds `threshold`.
pub fn decode_boxes(meta: &ModelMeta, raw: &[f32], threshold: f32) -> Result<Vec<Vec<BoundingBox>>> {
    if raw.len() != meta.output_len() {
        return Err(YoloError::Configuration(format!(
            "expected {} values per example, got {}",
            meta.output_len(),
            raw.len()
        )));
    }
    let (grid_w, grid_h) = (meta.grid_width as f32, meta.grid_height as f32);
    let anchors = meta.anchor_pairs();
    let mut bboxes: Vec<Vec<BoundingBox>> = vec![Vec::new(); meta.class_count];

    for (slot_index, slot) in raw.chunks_exact(meta.slot_len()).enumerate() {
        let cell = slot_index / meta.anchor_count;
        let (row, col) = (cell / meta.grid_width, cell % meta.grid_width);
        let (anchor_w, anchor_h) = anchors[slot_index % meta.anchor_count];

        let objectness = sigmoid(slot[4]);
        let logits = &slot[5..];
        let max_logit = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let denom: f32 = logits.iter().map(|l| (l - max_logit).exp()).sum();
        let (class_index, best) = logits
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, l)| (i, (l - max_logit).exp() / denom))
            .unwrap_or((0, 0.));
        let confidence = best * objectness;
        if confidence <= threshold {
            continue;
        }

        bboxes[class_index].push(BoundingBox::from_center(
            (col as f32 + sigmoid(slot[0])) / grid_w,
            (row as f32 + sigmoid(slot[1])) / grid_h,
            slot[2].exp() * anchor_w / grid_w,
            slot[3].exp() * anchor_h / grid_h,
            confidence,
            class_index as u32,
        ));
    }
    Ok(bboxes)
}

fn sigmoid(x: f32) -> f32 {
    1. / (1. + (-x).exp())
}
