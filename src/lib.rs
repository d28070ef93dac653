#![deny(missing_docs)]

//! YOLOv2 training and inference in Rust
//!
//! This crate provides the YOLOv2 detection loss, a training loop with checkpointing and
//! resume, and a simple interface for running a tiny YOLOv2 on images.
//!
//! # Examples
//!
//! ```no_run
//! use candle_core::{DType, Device};
//! use candle_nn::{VarBuilder, VarMap};
//! use yolo2_train::{
//!     AnnotatedDataset, Control, ModelMeta, Prefetcher, TinyYoloV2, TinyYoloV2Config,
//!     Trainer, TrainingConfig,
//! };
//!
//! let meta = ModelMeta::from_json_file("tiny-yolo-voc.json").expect("Failed to read meta");
//! let config = TrainingConfig::default();
//!
//! let varmap = VarMap::new();
//! let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
//! let model = TinyYoloV2::load(vb, &TinyYoloV2Config::voc(), &meta)
//!     .expect("Failed to build the model");
//!
//! let samples = Vec::new();
//! let dataset = AnnotatedDataset::new(meta.clone(), samples, config.batch_size, 4, None)
//!     .expect("Failed to create the dataset");
//! let batches = Prefetcher::spawn(dataset, config.epochs, 4)
//!     .expect("Failed to start prefetching");
//!
//! let mut trainer = Trainer::new(meta, config, model, varmap, Device::Cpu, Control::default())
//!     .expect("Failed to set up training");
//! let step = trainer.run_training_loop(batches).expect("Training failed");
//! println!("Trained up to step {step}");
//! ```

/// Bounding box module with non-maximum suppression
mod bounding_box;

/// Anchor decoding, IOU and responsibility masks
mod box_match;

/// Checkpoint persistence and resume
mod checkpoint;

/// Batch sources and prefetching
mod data;

/// Error taxonomy
mod error;

/// The YOLOv2 loss
mod loss;

/// Model metadata
mod meta;

/// Tiny YOLOv2 model definition in candle
mod model;

/// Optimizers and learning-rate schedule
mod optim;

/// Progress reporting and the kill / abort signal
mod status;

/// Ground-truth encoding
mod targets;

/// Training-step driver
mod train;

/// YOLOv2 high level interface
mod yolov2;

pub use bounding_box::{BoundingBox, iou, non_maximum_suppression};
pub use box_match::{BoxMatcher, GroundTruthGeometry, best_boxes, intersection_over_union};
pub use checkpoint::{CheckpointStore, LegacyLoader, NpzLoader, RestoredState, StepSelector};
pub use data::{AnnotatedDataset, Batch, BatchSource, Prefetcher, Sample, epochs, prepare_image};
pub use error::{Result, YoloError};
pub use loss::{LossTargets, YoloLoss, weighted_square_error};
pub use meta::ModelMeta;
pub use model::{Pool, TinyYoloV2, TinyYoloV2Config};
pub use optim::{
    Adadelta, Adagrad, CyclicLearningRate, Momentum, Optimizer, OptimizerConfig, OptimizerKind,
    ParamsMomentum, ParamsRmsProp, RmsProp,
};
pub use status::{ChannelSink, Control, FlagFileSink, NullSink, StatusSink, StatusUpdate};
pub use targets::{Annotation, ExampleTargets, encode_example, stack_targets};
pub use train::{Trainer, TrainingConfig, TrainingState, checkpoint_cadence};
pub use yolov2::{YoloV2, YoloV2Config, decode_boxes};
