use std::sync::Arc;
use std::thread::{self, JoinHandle};

use candle_core::{Device, Tensor};
use crossbeam_channel::{Receiver, bounded};
use kornia_image::{Image, ImageSize};
use rand::{SeedableRng, seq::SliceRandom};
use rayon::prelude::*;

use crate::{
    error::{Result, YoloError},
    loss::LossTargets,
    meta::ModelMeta,
    targets::{Annotation, ExampleTargets, encode_example, stack_targets},
};

/// Network input and loss targets for one step.
#[derive(Debug, Clone)]
pub struct Batch {
    /// `[N, 3, height, width]` input in `[0, 1]`.
    pub inputs: Tensor,
    /// Ground truth for the loss.
    pub targets: LossTargets,
}

impl Batch {
    /// Number of examples in the batch.
    pub fn len(&self) -> usize {
        self.targets.batch_size()
    }

    /// Whether the batch holds no example.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A finite, restartable sequence of batches.
pub trait BatchSource {
    /// Examples visited per epoch.
    fn size(&self) -> usize;

    /// Single pass over the data for `epoch`.
    fn epoch(&self, epoch: usize) -> Box<dyn Iterator<Item = Result<Batch>> + Send + '_>;
}

/// Chain `epochs` passes of a source into one stream of batches.
pub fn epochs<S: BatchSource>(
    source: &S,
    epochs: usize,
) -> impl Iterator<Item = Result<Batch>> + '_ {
    (0..epochs).flat_map(move |epoch| source.epoch(epoch))
}

/// An annotated training image.
#[derive(Clone)]
pub struct Sample {
    /// RGB8 image at its original size.
    pub image: Image<u8, 3>,
    /// Objects in pixel coordinates of `image`.
    pub objects: Vec<Annotation>,
}

/// In-memory annotated images, shuffled every epoch.
///
/// Images are resized and targets encoded on a fixed-size rayon pool.
pub struct AnnotatedDataset {
    meta: Arc<ModelMeta>,
    samples: Arc<Vec<Sample>>,
    batch_size: usize,
    seed: Option<u64>,
    pool: Arc<rayon::ThreadPool>,
}

impl AnnotatedDataset {
    /// Create a dataset preparing batches on `workers` threads.
    pub fn new(
        meta: ModelMeta,
        samples: Vec<Sample>,
        batch_size: usize,
        workers: usize,
        seed: Option<u64>,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(YoloError::Configuration("batch size must be positive".to_string()));
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers.max(1))
            .thread_name(|i| format!("yolo-batch-{i}"))
            .build()
            .map_err(|e| YoloError::Configuration(format!("cannot start worker pool: {e}")))?;
        Ok(Self {
            meta: Arc::new(meta),
            samples: Arc::new(samples),
            batch_size,
            seed,
            pool: Arc::new(pool),
        })
    }

    /// Batches per epoch; the trailing partial batch is dropped.
    pub fn batches_per_epoch(&self) -> usize {
        self.samples.len() / self.batch_size
    }

    fn order(&self, epoch: usize) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.samples.len()).collect();
        let mut rng = match self.seed {
            Some(seed) => rand::rngs::StdRng::seed_from_u64(seed.wrapping_add(epoch as u64)),
            None => rand::rngs::StdRng::from_rng(&mut rand::rng()),
        };
        order.shuffle(&mut rng);
        order
    }

    fn build_batch(&self, indices: &[usize]) -> Result<Batch> {
        let [height, width, _] = self.meta.inp_size;
        let prepared = self.pool.install(|| {
            indices
                .par_iter()
                .map(|&i| {
                    let sample = &self.samples[i];
                    let pixels = prepare_image(&sample.image, width, height)?;
                    let targets = encode_example(
                        &self.meta,
                        sample.image.width(),
                        sample.image.height(),
                        &sample.objects,
                    );
                    Ok((pixels, targets))
                })
                .collect::<Result<Vec<(Vec<f32>, ExampleTargets)>>>()
        })?;
        let n = prepared.len();
        let (pixels, targets): (Vec<Vec<f32>>, Vec<ExampleTargets>) = prepared.into_iter().unzip();
        let inputs = Tensor::from_vec(pixels.concat(), (n, height, width, 3), &Device::Cpu)?
            .permute((0, 3, 1, 2))?
            .contiguous()?;
        let targets = stack_targets(&self.meta, &targets, &Device::Cpu)?;
        Ok(Batch { inputs, targets })
    }
}

impl BatchSource for AnnotatedDataset {
    fn size(&self) -> usize {
        self.samples.len()
    }

    fn epoch(&self, epoch: usize) -> Box<dyn Iterator<Item = Result<Batch>> + Send + '_> {
        let order = self.order(epoch);
        let batch_size = self.batch_size;
        Box::new(
            (0..self.batches_per_epoch())
                .map(move |b| self.build_batch(&order[b * batch_size..(b + 1) * batch_size])),
        )
    }
}

/// Resize an RGB8 image to the network input and scale it to `[0, 1]`, HWC order.
pub fn prepare_image(image: &Image<u8, 3>, width: usize, height: usize) -> Result<Vec<f32>> {
    let mut image_resized = Image::from_size_val(ImageSize { width, height }, 0)?;
    kornia_imgproc::resize::resize_fast(
        image,
        &mut image_resized,
        kornia_imgproc::interpolation::InterpolationMode::Nearest,
    )?;
    Ok(image_resized.map(|&x| x as f32 / 255.0).into_vec())
}

/// Runs a batch source on a background thread, `depth` batches ahead of the consumer.
///
/// Batches cross a bounded channel fully materialised, never partially built.
pub struct Prefetcher {
    rx: Receiver<Result<Batch>>,
    handle: Option<JoinHandle<()>>,
}

impl Prefetcher {
    /// Start producing `epochs` passes of `source`.
    pub fn spawn<S>(source: S, epochs_to_run: usize, depth: usize) -> Result<Self>
    where
        S: BatchSource + Send + 'static,
    {
        let (tx, rx) = bounded(depth.max(1));
        let handle = thread::Builder::new()
            .name("yolo-prefetch".to_string())
            .spawn(move || {
                for batch in epochs(&source, epochs_to_run) {
                    let failed = batch.is_err();
                    // the consumer hung up
                    if tx.send(batch).is_err() || failed {
                        break;
                    }
                }
            })?;
        Ok(Self {
            rx,
            handle: Some(handle),
        })
    }
}

impl Iterator for Prefetcher {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        self.rx.recv().ok()
    }
}

impl Drop for Prefetcher {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            // disconnect first so a producer blocked on a full channel wakes up
            drop(std::mem::replace(&mut self.rx, crossbeam_channel::never()));
            let _ = handle.join();
        }
    }
}
