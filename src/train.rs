use std::path::PathBuf;

use candle_core::{Device, ModuleT, Var};
use candle_nn::VarMap;
use serde::{Deserialize, Serialize};

use crate::{
    checkpoint::{CheckpointStore, RestoredState, StepSelector},
    data::Batch,
    error::{Result, YoloError},
    loss::YoloLoss,
    meta::ModelMeta,
    optim::{Optimizer, OptimizerConfig},
    status::{Control, StatusUpdate},
};

/// Run-level training settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Examples per step.
    pub batch_size: usize,
    /// Passes over the dataset.
    pub epochs: usize,
    /// Examples per epoch, used for progress; 0 reports no progress.
    pub dataset_size: usize,
    /// Checkpoint every this many examples.
    pub save_every: usize,
    /// Clamp every gradient element to `[-1, 1]`.
    pub clip: bool,
    /// Update rule and learning rate.
    pub optimizer: OptimizerConfig,
    /// Checkpoint to resume from: negative for latest, 0 for a fresh start.
    pub load: i64,
    /// Directory holding the checkpoints.
    pub backup: PathBuf,
    /// Checkpoints retained on disk; 0 keeps all of them.
    pub keep: usize,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            batch_size: 16,
            epochs: 1000,
            dataset_size: 0,
            save_every: 2000,
            clip: false,
            optimizer: OptimizerConfig::default(),
            load: 0,
            backup: PathBuf::from("./ckpt/"),
            keep: 20,
        }
    }
}

/// Steps between two checkpoints, `None` when checkpoints are only taken at the end.
pub fn checkpoint_cadence(save_every: usize, batch_size: usize) -> Option<usize> {
    save_every.checked_div(batch_size).filter(|&c| c > 0)
}

/// Mutable state threaded through the loop.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainingState {
    /// Steps applied so far, including those of a restored checkpoint.
    pub global_step: u64,
    /// Exponential moving average of the loss, unset before the first step of a run.
    pub loss_moving_average: Option<f32>,
    /// `(loss, moving average)` of every step.
    pub loss_profile: Vec<(f32, f32)>,
}

impl TrainingState {
    /// State resumed from a checkpoint. The moving average restarts with the run.
    pub fn resumed(restored: RestoredState) -> Self {
        Self {
            global_step: restored.step,
            loss_moving_average: None,
            loss_profile: restored.loss_profile,
        }
    }

    /// Fold a step loss into the moving average and the profile.
    pub fn record(&mut self, loss: f32) -> f32 {
        let mva = match self.loss_moving_average {
            None => loss,
            Some(avg) => 0.9 * avg + 0.1 * loss,
        };
        self.loss_moving_average = Some(mva);
        self.loss_profile.push((loss, mva));
        mva
    }
}

/// Drives forward, loss, backward and update over a stream of batches.
pub struct Trainer<M> {
    config: TrainingConfig,
    model: M,
    varmap: VarMap,
    vars: Vec<Var>,
    loss: YoloLoss,
    optimizer: Optimizer,
    store: CheckpointStore,
    control: Control,
    device: Device,
    state: TrainingState,
}

impl<M: ModuleT> Trainer<M> {
    /// Set up a run over the variables of `varmap`, restoring a checkpoint when
    /// `config.load` asks for one.
    pub fn new(
        meta: ModelMeta,
        config: TrainingConfig,
        model: M,
        varmap: VarMap,
        device: Device,
        control: Control,
    ) -> Result<Self> {
        let setup = || -> Result<_> {
            let loss = YoloLoss::new(meta.clone(), &device)?;
            let vars = varmap.all_vars();
            let optimizer = Optimizer::new(&config.optimizer, vars.clone())?;
            let store = CheckpointStore::new(&config.backup, &meta.name, config.keep)?;
            let state = match StepSelector::from_load_flag(config.load) {
                Some(selector) => TrainingState::resumed(store.restore(&varmap, selector)?),
                None => TrainingState::default(),
            };
            Ok((loss, vars, optimizer, store, state))
        };
        let (loss, vars, optimizer, store, state) = setup().map_err(|e| control.fail(0, e))?;
        Ok(Self {
            config,
            model,
            varmap,
            vars,
            loss,
            optimizer,
            store,
            control,
            device,
            state,
        })
    }

    /// Current state of the run.
    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    /// The control shared with the caller.
    pub fn control(&self) -> &Control {
        &self.control
    }

    /// The checkpoint store of the run.
    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    /// Train on every batch and return the final global step.
    ///
    /// An abort request stops the loop at the next step boundary, after the progress made
    /// so far is checkpointed. Every other failure raises the kill signal through
    /// [`Control::fail`] before it is returned.
    pub fn run_training_loop<I>(&mut self, batches: I) -> Result<u64>
    where
        I: IntoIterator<Item = Result<Batch>>,
    {
        let start = self.state.global_step;
        let cadence = checkpoint_cadence(self.config.save_every, self.config.batch_size);
        let planned = (self.config.dataset_size * self.config.epochs) as f64;
        let mut batches = batches.into_iter();
        let mut seen = 0usize;
        let mut saved_at = start;
        let mut i = 0usize;

        loop {
            let step = start + i as u64 + 1;
            if self.control.abort_requested() {
                tracing::info!("abort requested, stopping before step {step}");
                self.checkpoint_if_unsaved(saved_at)?;
                return Err(YoloError::Aborted(self.state.global_step));
            }
            let Some(batch) = batches.next() else {
                break;
            };
            let batch = batch.map_err(|e| self.control.fail(step, e))?;

            if i == 0 {
                self.log_training_statistics();
            }
            let loss = self
                .train_step(&batch, step)
                .map_err(|e| self.control.fail(step, e))?;
            let mva = self.state.record(loss);
            self.state.global_step = step;

            seen += batch.len();
            let progress = if planned > 0.0 {
                seen as f64 / planned * 100.0
            } else {
                0.0
            };
            self.control.report(&StatusUpdate {
                step,
                progress,
                error: None,
                done: false,
            });
            tracing::info!(
                "step {step} - loss {loss} - moving ave loss {mva} - progress {progress:.2}%"
            );

            if cadence.is_some_and(|c| (i + 1) % c == 0) {
                self.save().map_err(|e| self.control.fail(step, e))?;
                saved_at = step;
            }
            i += 1;
        }

        self.checkpoint_if_unsaved(saved_at)?;
        self.control.report(&StatusUpdate {
            step: self.state.global_step,
            progress: 100.0,
            error: None,
            done: true,
        });
        Ok(self.state.global_step)
    }

    /// One optimisation step; returns the loss. A non-finite loss stops before any update.
    fn train_step(&mut self, batch: &Batch, step: u64) -> Result<f32> {
        let inputs = batch.inputs.to_device(&self.device)?;
        let targets = batch.targets.to_device(&self.device)?;
        let raw = self
            .model
            .forward_t(&inputs, true)
            .map_err(YoloError::from_step)?;
        let loss = self.loss.compute(&raw, &targets).map_err(|e| match e {
            YoloError::CandleError(e) => YoloError::from_step(e),
            e => e,
        })?;
        let value = loss.to_scalar::<f32>()?;
        if !value.is_finite() {
            return Err(YoloError::Divergence {
                clipping: self.config.clip,
            });
        }

        let mut grads = loss.backward().map_err(YoloError::from_step)?;
        if self.config.clip {
            for var in &self.vars {
                if let Some(grad) = grads.remove(var) {
                    grads.insert(var, grad.clamp(-1f32, 1f32)?);
                }
            }
        }
        self.optimizer
            .set_learning_rate(self.config.optimizer.learning_rate_at(step - 1));
        self.optimizer
            .step(&grads)
            .map_err(|e| match e {
                YoloError::CandleError(e) => YoloError::from_step(e),
                e => e,
            })?;
        Ok(value)
    }

    fn save(&self) -> Result<()> {
        self.store.save(
            &self.varmap,
            self.state.global_step,
            &self.state.loss_profile,
        )
    }

    fn checkpoint_if_unsaved(&self, saved_at: u64) -> Result<()> {
        let step = self.state.global_step;
        if step == saved_at {
            return Ok(());
        }
        self.save().map_err(|e| self.control.fail(step, e))
    }

    fn log_training_statistics(&self) {
        tracing::info!("Training statistics:");
        tracing::info!("\tLearning rate : {}", self.optimizer.learning_rate());
        tracing::info!("\tOptimizer     : {}", self.config.optimizer.kind);
        tracing::info!("\tBatch size    : {}", self.config.batch_size);
        tracing::info!("\tEpoch number  : {}", self.config.epochs);
        tracing::info!("\tBackup every  : {}", self.config.save_every);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{
        AnnotatedDataset, epochs,
        tests::{tiny_meta, tiny_samples},
    };
    use crate::optim::OptimizerKind;
    use crate::status::ChannelSink;
    use candle_core::{DType, Module, Tensor};
    use candle_nn::{Linear, VarBuilder};

    /// Linear map from the flattened image to the raw detection output.
    struct Flat(Linear);

    impl Module for Flat {
        fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
            xs.flatten_from(1)?.apply(&self.0)
        }
    }

    struct OutOfMemory;

    impl Module for OutOfMemory {
        fn forward(&self, _xs: &Tensor) -> candle_core::Result<Tensor> {
            Err(candle_core::Error::Msg(
                "CUDA_ERROR_OUT_OF_MEMORY: out of memory".to_string(),
            ))
        }
    }

    fn config(backup: &std::path::Path) -> TrainingConfig {
        TrainingConfig {
            batch_size: 1,
            epochs: 1,
            dataset_size: 8,
            save_every: 100,
            optimizer: OptimizerConfig {
                kind: OptimizerKind::Sgd,
                learning_rate: 1e-2,
                ..OptimizerConfig::default()
            },
            backup: backup.to_path_buf(),
            keep: 0,
            ..TrainingConfig::default()
        }
    }

    fn trainer(config: TrainingConfig, control: Control) -> Result<Trainer<Flat>> {
        let meta = tiny_meta();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let [h, w, c] = meta.inp_size;
        let linear = candle_nn::linear(h * w * c, meta.output_len(), vb.pp("fc"))?;
        Trainer::new(meta, config, Flat(linear), varmap, Device::Cpu, control)
    }

    fn batches(n: usize) -> Result<Vec<Batch>> {
        let data = AnnotatedDataset::new(tiny_meta(), tiny_samples(n), 1, 1, Some(0))?;
        epochs(&data, 1).collect()
    }

    fn weights(trainer: &Trainer<Flat>) -> candle_core::Result<Vec<f32>> {
        let data = trainer.varmap.data().lock().unwrap();
        data["fc.weight"].as_tensor().flatten_all()?.to_vec1()
    }

    #[test]
    fn test_moving_average() {
        let mut state = TrainingState::default();
        assert_eq!(state.record(10.0), 10.0);
        assert!((state.record(0.0) - 9.0).abs() < 1e-6);
        assert!((state.record(9.0) - 9.0).abs() < 1e-6);
        assert_eq!(state.loss_profile.len(), 3);
        assert_eq!(state.loss_profile[0], (10.0, 10.0));
    }

    #[test]
    fn test_checkpoint_cadence() {
        assert_eq!(checkpoint_cadence(100, 25), Some(4));
        assert_eq!(checkpoint_cadence(10, 25), None);
        assert_eq!(checkpoint_cadence(100, 0), None);
    }

    #[test]
    fn test_loop_checkpoints_on_cadence_and_at_the_end() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut cfg = config(dir.path());
        cfg.batch_size = 25;
        cfg.dataset_size = 10;
        let mut trainer = trainer(cfg, Control::default())?;
        let last = trainer.run_training_loop(batches(10)?.into_iter().map(Ok))?;
        assert_eq!(last, 10);

        let store = trainer.store();
        assert!(store.weights_path(4).exists());
        assert!(store.weights_path(8).exists());
        assert!(store.weights_path(10).exists());
        assert!(!store.weights_path(5).exists());
        assert_eq!(store.latest_step()?, 10);
        assert_eq!(store.load_profile(10)?.len(), 10);
        Ok(())
    }

    #[test]
    fn test_training_lowers_the_loss() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut trainer = trainer(config(dir.path()), Control::default())?;
        let batch = batches(1)?.remove(0);
        trainer.run_training_loop(std::iter::repeat_n(batch, 30).map(Ok))?;
        let profile = &trainer.state().loss_profile;
        assert!(profile[29].0 < profile[0].0);
        Ok(())
    }

    #[test]
    fn test_non_finite_loss_halts_before_update() -> Result<()> {
        for (fill, clip, hint) in [
            (f64::NAN, false, "turning on gradient clipping."),
            (f64::NAN, true, "with a smaller learning rate."),
            (f64::INFINITY, false, "turning on gradient clipping."),
            (f64::INFINITY, true, "with a smaller learning rate."),
        ] {
            let dir = tempfile::tempdir()?;
            let (tx, rx) = crossbeam_channel::unbounded();
            let mut cfg = config(dir.path());
            cfg.clip = clip;
            let mut trainer = trainer(cfg, Control::new(ChannelSink::new(tx)))?;
            let mut batch = batches(1)?.remove(0);
            batch.inputs = batch.inputs.affine(0.0, fill)?;
            let before = weights(&trainer)?;

            let err = trainer.run_training_loop([Ok(batch)]).unwrap_err();
            assert!(matches!(err, YoloError::Divergence { clipping } if clipping == clip));
            assert!(err.to_string().ends_with(hint), "{fill} / {clip}: {err}");
            assert_eq!(weights(&trainer)?, before);
            assert!(trainer.control().is_killed());
            assert!(rx.try_iter().any(|u| u.error.is_some()));
            assert!(!trainer.store().index_path().exists());
        }
        Ok(())
    }

    #[test]
    fn test_clipping_bounds_each_update() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut cfg = config(dir.path());
        cfg.clip = true;
        let lr = cfg.optimizer.learning_rate as f32;
        let mut trainer = trainer(cfg, Control::default())?;
        for mut batch in batches(4)? {
            batch.inputs = batch.inputs.affine(50.0, 0.0)?;
            let before = weights(&trainer)?;
            trainer.run_training_loop([Ok(batch)])?;
            let largest = weights(&trainer)?
                .iter()
                .zip(&before)
                .map(|(a, b)| (a - b).abs())
                .fold(0f32, f32::max);
            assert!(largest <= lr * (1.0 + 1e-4), "update of {largest} with lr {lr}");
        }
        Ok(())
    }

    #[test]
    fn test_progress_is_reported_every_step() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut cfg = config(dir.path());
        cfg.dataset_size = 4;
        cfg.epochs = 1;
        let mut trainer = trainer(cfg, Control::new(ChannelSink::new(tx)))?;
        trainer.run_training_loop(batches(4)?.into_iter().map(Ok))?;

        let updates: Vec<StatusUpdate> = rx.try_iter().collect();
        let (last, steps) = updates.split_last().unwrap();
        let progress: Vec<f64> = steps.iter().map(|u| u.progress).collect();
        assert_eq!(progress, vec![25.0, 50.0, 75.0, 100.0]);
        assert_eq!(steps.iter().map(|u| u.step).collect::<Vec<_>>(), vec![1, 2, 3, 4]);
        assert!(steps.iter().all(|u| !u.done && u.error.is_none()));
        assert!(last.done);
        assert_eq!(last.progress, 100.0);
        Ok(())
    }

    #[test]
    fn test_abort_stops_at_step_boundary() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let control = Control::default();
        let mut trainer = trainer(config(dir.path()), control.clone())?;
        let stream = batches(6)?.into_iter().enumerate().map(move |(i, b)| {
            if i == 2 {
                control.request_abort();
            }
            Ok(b)
        });
        let err = trainer.run_training_loop(stream).unwrap_err();
        assert!(matches!(err, YoloError::Aborted(3)));
        assert!(!trainer.control().is_killed());
        assert_eq!(trainer.store().latest_step()?, 3);
        Ok(())
    }

    #[test]
    fn test_resume_continues_step_count() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut first = trainer(config(dir.path()), Control::default())?;
        first.run_training_loop(batches(3)?.into_iter().map(Ok))?;

        let mut cfg = config(dir.path());
        cfg.load = -1;
        let mut resumed = trainer(cfg, Control::default())?;
        assert_eq!(resumed.state().global_step, 3);
        assert_eq!(resumed.state().loss_profile.len(), 3);
        assert_eq!(weights(&resumed)?, weights(&first)?);
        let last = resumed.run_training_loop(batches(2)?.into_iter().map(Ok))?;
        assert_eq!(last, 5);
        Ok(())
    }

    #[test]
    fn test_out_of_memory_is_resource_exhaustion() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let control = Control::default();
        let meta = tiny_meta();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        vb.get((2, 2), "unused")?;
        let mut trainer = Trainer::new(
            meta,
            config(dir.path()),
            OutOfMemory,
            varmap,
            Device::Cpu,
            control.clone(),
        )?;
        let err = trainer
            .run_training_loop(batches(1)?.into_iter().map(Ok))
            .unwrap_err();
        assert!(matches!(err, YoloError::ResourceExhausted(_)));
        assert!(control.is_killed());
        Ok(())
    }

    #[test]
    fn test_failed_restore_raises_kill_signal() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let control = Control::default();
        let mut cfg = config(dir.path());
        cfg.load = -1;
        assert!(matches!(
            trainer(cfg, control.clone()),
            Err(YoloError::CheckpointNotFound(_))
        ));
        assert!(control.is_killed());
        Ok(())
    }
}
