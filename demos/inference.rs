use argh::FromArgs;
use std::path::PathBuf;

use kornia_io::functional as F;
use yolo2_train::{ModelMeta, YoloV2, YoloV2Config};

#[derive(FromArgs)]
/// YOLOv2 inference application arguments
struct Args {
    /// path to an input image
    #[argh(option)]
    image_path: PathBuf,

    /// path to a safetensors file, e.g. a training checkpoint
    #[argh(option)]
    weights: PathBuf,

    /// path to the model metadata json; defaults to tiny-yolo-voc
    #[argh(option)]
    meta: Option<PathBuf>,

    /// the confidence threshold for the model
    #[argh(option, default = "0.25")]
    confidence_threshold: f32,

    /// the nms threshold for the model
    #[argh(option, default = "0.45")]
    nms_threshold: f32,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();
    let args: Args = argh::from_env();

    let rec = rerun::RecordingStreamBuilder::new("YOLOv2 Inference App").spawn()?;

    let meta = match args.meta {
        Some(path) => ModelMeta::from_json_file(path)?,
        None => ModelMeta::default(),
    };
    let config = YoloV2Config {
        meta: meta.clone(),
        confidence_threshold: args.confidence_threshold,
        nms_threshold: args.nms_threshold,
        ..YoloV2Config::default()
    };

    let model = YoloV2::new(config, args.weights)?;

    // read the image as RGB8
    let image = F::read_image_any(args.image_path)?;

    // perform inference and get the detections
    let detections = model.inference(&image)?;

    rec.log(
        "image",
        &rerun::Image::from_elements(
            image.as_slice(),
            image.size().into(),
            rerun::ColorModel::RGB,
        ),
    )?;

    let mut boxes_mins = Vec::new();
    let mut boxes_sizes = Vec::new();
    let mut labels = Vec::new();
    for detection in detections {
        tracing::info!(
            "{} {:.2} at ({:.0}, {:.0}, {:.0}, {:.0})",
            meta.label(detection.class as usize),
            detection.confidence,
            detection.xmin,
            detection.ymin,
            detection.xmax,
            detection.ymax
        );
        boxes_mins.push((detection.xmin, detection.ymin));
        boxes_sizes.push((detection.width(), detection.height()));
        labels.push(meta.label(detection.class as usize));
    }

    rec.log(
        "boxes",
        &rerun::Boxes2D::from_mins_and_sizes(boxes_mins, boxes_sizes).with_labels(labels),
    )?;

    Ok(())
}
