use argh::FromArgs;
use std::path::PathBuf;

use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use kornia_image::{Image, ImageSize};
use kornia_io::functional as F;
use rand::Rng;
use serde::Deserialize;
use tracing_subscriber::EnvFilter;
use yolo2_train::{
    AnnotatedDataset, Annotation, Control, FlagFileSink, ModelMeta, OptimizerKind, Prefetcher,
    Sample, TinyYoloV2, TinyYoloV2Config, Trainer, TrainingConfig,
};

#[derive(FromArgs)]
/// YOLOv2 training application arguments
struct Args {
    /// path to the model metadata json; defaults to tiny-yolo-voc
    #[argh(option)]
    meta: Option<PathBuf>,

    /// json list of {"image": path, "objects": [...]}; random images when omitted
    #[argh(option)]
    annotations: Option<PathBuf>,

    /// number of random images to train on without annotations
    #[argh(option, default = "32")]
    synthetic: usize,

    /// optimizer: sgd, momentum, nesterov, rmsprop, adagrad, adadelta, adam
    #[argh(option, default = "\"rmsprop\".to_string()")]
    trainer: String,

    /// learning rate
    #[argh(option, default = "1e-5")]
    lr: f64,

    /// upper bound of the cyclic learning rate
    #[argh(option)]
    max_lr: Option<f64>,

    /// batch size
    #[argh(option, default = "16")]
    batch: usize,

    /// number of epochs
    #[argh(option, default = "1000")]
    epoch: usize,

    /// save a checkpoint every this many examples
    #[argh(option, default = "2000")]
    save: usize,

    /// checkpoint to resume from, -1 for the latest
    #[argh(option, default = "0")]
    load: i64,

    /// clip gradients to [-1, 1]
    #[argh(switch)]
    clip: bool,

    /// checkpoint directory
    #[argh(option, default = "PathBuf::from(\"./ckpt/\")")]
    backup: PathBuf,

    /// number of checkpoints to keep, 0 keeps all
    #[argh(option, default = "20")]
    keep: usize,

    /// batch preparation threads
    #[argh(option, default = "4")]
    workers: usize,

    /// flags file receiving the training status
    #[argh(option)]
    status_file: Option<PathBuf>,
}

#[derive(Deserialize)]
struct AnnotatedImage {
    image: PathBuf,
    objects: Vec<Annotation>,
}

fn load_samples(args: &Args, meta: &ModelMeta) -> Result<Vec<Sample>, Box<dyn std::error::Error>> {
    if let Some(path) = &args.annotations {
        let entries: Vec<AnnotatedImage> =
            serde_json::from_reader(std::io::BufReader::new(std::fs::File::open(path)?))?;
        return entries
            .into_iter()
            .map(|entry| -> Result<Sample, Box<dyn std::error::Error>> {
                Ok(Sample {
                    image: F::read_image_any(&entry.image)?,
                    objects: entry.objects,
                })
            })
            .collect();
    }

    // random noise with random boxes, enough to exercise the loop
    let mut rng = rand::rng();
    let [height, width, _] = meta.inp_size;
    (0..args.synthetic)
        .map(|_| -> Result<Sample, Box<dyn std::error::Error>> {
            let pixels = (0..width * height * 3).map(|_| rng.random::<u8>()).collect();
            let image = Image::new(ImageSize { width, height }, pixels)?;
            let (w, h) = (width as f32, height as f32);
            let xmin = rng.random_range(0.0..w * 0.5);
            let ymin = rng.random_range(0.0..h * 0.5);
            let objects = vec![Annotation {
                class: rng.random_range(0..meta.class_count),
                xmin,
                ymin,
                xmax: xmin + rng.random_range(w * 0.1..w * 0.5),
                ymax: ymin + rng.random_range(h * 0.1..h * 0.5),
            }];
            Ok(Sample { image, objects })
        })
        .collect()
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
    let args: Args = argh::from_env();

    let meta = match &args.meta {
        Some(path) => ModelMeta::from_json_file(path)?,
        None => ModelMeta::default(),
    };
    let samples = load_samples(&args, &meta)?;

    let mut config = TrainingConfig {
        batch_size: args.batch,
        epochs: args.epoch,
        dataset_size: samples.len(),
        save_every: args.save,
        clip: args.clip,
        load: args.load,
        backup: args.backup.clone(),
        keep: args.keep,
        ..TrainingConfig::default()
    };
    config.optimizer.kind = OptimizerKind::try_from(args.trainer.clone())?;
    config.optimizer.learning_rate = args.lr;
    config.optimizer.max_learning_rate = args.max_lr;

    let device = Device::cuda_if_available(0)?;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let model = TinyYoloV2::load(vb, &TinyYoloV2Config::voc(), &meta)?;

    let control = match &args.status_file {
        Some(path) => Control::new(FlagFileSink::new(path)),
        None => Control::default(),
    };

    let epochs = config.epochs;
    let dataset = AnnotatedDataset::new(meta.clone(), samples, config.batch_size, args.workers, None)?;
    let batches = Prefetcher::spawn(dataset, epochs, 4)?;

    let mut trainer = Trainer::new(meta, config, model, varmap, device, control)?;
    let step = trainer.run_training_loop(batches)?;
    tracing::info!("Training finished at step {step}");

    Ok(())
}
