use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Shape, Tensor, Var};
use candle_nn::VarMap;

use crate::error::{Result, YoloError};

const INDEX_FILE: &str = "checkpoint";
const STEP_TENSOR: &str = "global_step";

/// Which checkpoint to resume from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepSelector {
    /// The last entry of the index.
    Latest,
    /// An explicit step.
    Step(u64),
}

impl StepSelector {
    /// Interpret a numeric load flag: negative means latest, zero means start fresh.
    pub fn from_load_flag(load: i64) -> Option<Self> {
        match load {
            0 => None,
            l if l < 0 => Some(StepSelector::Latest),
            l => Some(StepSelector::Step(l as u64)),
        }
    }
}

/// Training state recovered from a checkpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct RestoredState {
    /// Global step the checkpoint was taken at.
    pub step: u64,
    /// Loss profile saved with it; empty when none was found.
    pub loss_profile: Vec<(f32, f32)>,
    /// Whether the legacy loader had to be used.
    pub legacy: bool,
}

/// Looks variables up by name and shape in an older checkpoint format.
pub trait LegacyLoader {
    /// The stored value for `name`, if present with exactly `shape`.
    fn load(&self, name: &str, shape: &Shape) -> Option<Tensor>;
}

/// Legacy checkpoints stored as numpy `.npz` archives.
pub struct NpzLoader {
    tensors: HashMap<String, Tensor>,
}

impl NpzLoader {
    /// Read every array of an `.npz` archive.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let tensors = Tensor::read_npz(path.as_ref())?.into_iter().collect();
        Ok(Self { tensors })
    }
}

impl LegacyLoader for NpzLoader {
    fn load(&self, name: &str, shape: &Shape) -> Option<Tensor> {
        self.tensors
            .get(name)
            .filter(|t| t.shape() == shape)
            .cloned()
    }
}

/// Reads and writes checkpoints of one model in a backup directory.
///
/// Per saved step `N` of model `name` the directory holds `name-N.safetensors` (every
/// trainable variable plus a `global_step` scalar) and `name-N.profile` (the JSON list of
/// `(loss, moving average)` pairs up to `N`). A single `checkpoint` index lists the
/// retained stems, latest last.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
    name: String,
    keep: usize,
}

impl CheckpointStore {
    /// Open (and create) the backup directory. `keep = 0` retains every checkpoint.
    pub fn new(dir: impl Into<PathBuf>, name: impl Into<String>, keep: usize) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            name: name.into(),
            keep,
        })
    }

    /// The backup directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn stem(&self, step: u64) -> String {
        format!("{}-{step}", self.name)
    }

    /// Path of the checkpoint index.
    pub fn index_path(&self) -> PathBuf {
        self.dir.join(INDEX_FILE)
    }

    /// Variable snapshot of `step`.
    pub fn weights_path(&self, step: u64) -> PathBuf {
        self.dir.join(format!("{}.safetensors", self.stem(step)))
    }

    /// Loss profile of `step`.
    pub fn profile_path(&self, step: u64) -> PathBuf {
        self.dir.join(format!("{}.profile", self.stem(step)))
    }

    /// Legacy archive consulted when the snapshot of `step` is unreadable.
    pub fn legacy_path(&self, step: u64) -> PathBuf {
        self.dir.join(format!("{}.npz", self.stem(step)))
    }

    /// Persist every variable of `varmap` and the loss profile at `step`.
    ///
    /// Files are written under temporary names and renamed; the index is rewritten last,
    /// so a checkpoint only becomes visible to `Latest` once it is complete.
    pub fn save(&self, varmap: &VarMap, step: u64, loss_profile: &[(f32, f32)]) -> Result<()> {
        tracing::info!("Checkpoint at step {step}");

        let mut tensors: HashMap<String, Tensor> = {
            let data = varmap
                .data()
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            data.iter()
                .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
                .collect()
        };
        tensors.insert(STEP_TENSOR.to_string(), Tensor::new(step as i64, &Device::Cpu)?);

        let profile = self.profile_path(step);
        let weights = self.weights_path(step);
        let profile_tmp = profile.with_extension("profile.tmp");
        let weights_tmp = weights.with_extension("safetensors.tmp");
        std::fs::write(&profile_tmp, serde_json::to_vec(loss_profile)?)?;
        candle_core::safetensors::save(&tensors, &weights_tmp)?;
        std::fs::rename(&profile_tmp, &profile)?;
        std::fs::rename(&weights_tmp, &weights)?;

        self.append_to_index(step)
    }

    fn read_index(&self) -> Result<Vec<String>> {
        let content = match std::fs::read_to_string(self.index_path()) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(content
            .lines()
            .filter(|line| line.starts_with("all_model_checkpoint_paths:"))
            .filter_map(quoted)
            .map(str::to_string)
            .collect())
    }

    fn append_to_index(&self, step: u64) -> Result<()> {
        let stem = self.stem(step);
        let mut entries = self.read_index()?;
        entries.retain(|e| *e != stem);
        entries.push(stem.clone());

        let mut dropped = Vec::new();
        if self.keep > 0 && entries.len() > self.keep {
            dropped = entries.drain(..entries.len() - self.keep).collect();
        }

        let mut index = format!("model_checkpoint_path: \"{stem}\"\n");
        for entry in &entries {
            index.push_str(&format!("all_model_checkpoint_paths: \"{entry}\"\n"));
        }
        let tmp = self.dir.join(format!("{INDEX_FILE}.tmp"));
        std::fs::write(&tmp, index)?;
        std::fs::rename(&tmp, self.index_path())?;

        for entry in dropped {
            for ext in ["safetensors", "profile"] {
                let path = self.dir.join(format!("{entry}.{ext}"));
                if let Err(e) = std::fs::remove_file(&path) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        tracing::warn!("cannot remove old checkpoint {}: {e}", path.display());
                    }
                }
            }
        }
        Ok(())
    }

    /// Step of the last checkpoint listed in the index.
    pub fn latest_step(&self) -> Result<u64> {
        let content = std::fs::read_to_string(self.index_path()).map_err(|e| {
            YoloError::CheckpointNotFound(format!("{}: {e}", self.index_path().display()))
        })?;
        let last = content
            .lines()
            .map(str::trim)
            .rfind(|line| !line.is_empty())
            .ok_or_else(|| YoloError::CheckpointNotFound("empty checkpoint index".to_string()))?;
        parse_index_line(last).ok_or_else(|| {
            YoloError::CheckpointNotFound(format!("malformed checkpoint index line: {last}"))
        })
    }

    /// Turn a selector into a concrete step.
    pub fn resolve(&self, selector: StepSelector) -> Result<u64> {
        match selector {
            StepSelector::Latest => self.latest_step(),
            StepSelector::Step(step) => Ok(step),
        }
    }

    /// Loss profile saved with `step`.
    pub fn load_profile(&self, step: u64) -> Result<Vec<(f32, f32)>> {
        Ok(serde_json::from_slice(&std::fs::read(self.profile_path(step))?)?)
    }

    /// Restore `varmap`, falling back to `<name>-<step>.npz` for unreadable snapshots.
    pub fn restore(&self, varmap: &VarMap, selector: StepSelector) -> Result<RestoredState> {
        let step = self.resolve(selector)?;
        self.restore_step(varmap, step, |path| {
            NpzLoader::open(path)
                .map(|l| Box::new(l) as Box<dyn LegacyLoader>)
                .map_err(|e| YoloError::CheckpointNotFound(format!("{}: {e}", path.display())))
        })
    }

    /// Restore `varmap`, falling back to `loader` for unreadable snapshots.
    pub fn restore_with_loader(
        &self,
        varmap: &VarMap,
        selector: StepSelector,
        loader: &dyn LegacyLoader,
    ) -> Result<RestoredState> {
        let step = self.resolve(selector)?;
        self.restore_step(varmap, step, |_| {
            Ok(Box::new(Borrowed(loader)) as Box<dyn LegacyLoader + '_>)
        })
    }

    fn restore_step<'a>(
        &self,
        varmap: &VarMap,
        step: u64,
        open_legacy: impl FnOnce(&Path) -> Result<Box<dyn LegacyLoader + 'a>>,
    ) -> Result<RestoredState> {
        tracing::info!("Loading from {}", self.dir.join(self.stem(step)).display());
        let vars = sorted_vars(varmap);
        match self.restore_native(&vars, step) {
            Err(YoloError::UnreadableCheckpoint { path, reason }) => {
                tracing::info!("Resolving old graph def {path} (no guarantee): {reason}");
                let loader = open_legacy(&self.legacy_path(step))?;
                restore_legacy(&vars, loader.as_ref())?;
                Ok(RestoredState {
                    step,
                    loss_profile: self.load_profile(step).unwrap_or_default(),
                    legacy: true,
                })
            }
            other => other,
        }
    }

    fn restore_native(&self, vars: &[(String, Var)], step: u64) -> Result<RestoredState> {
        let path = self.weights_path(step);
        let device = vars
            .first()
            .map(|(_, v)| v.device().clone())
            .unwrap_or(Device::Cpu);
        let tensors = candle_core::safetensors::load(&path, &device).map_err(|e| {
            YoloError::UnreadableCheckpoint {
                path: path.display().to_string(),
                reason: e.to_string(),
            }
        })?;
        let values = vars
            .iter()
            .map(|(name, var)| {
                let value = tensors
                    .get(name)
                    .ok_or_else(|| YoloError::MissingVariable(name.clone()))?;
                checked_value(name, var, value)
            })
            .collect::<Result<Vec<_>>>()?;
        assign_all(vars, &values)?;
        let saved_step = match tensors.get(STEP_TENSOR) {
            Some(t) => t.to_dtype(DType::I64)?.to_scalar::<i64>()? as u64,
            None => step,
        };
        Ok(RestoredState {
            step: saved_step,
            loss_profile: self.load_profile(step).unwrap_or_default(),
            legacy: false,
        })
    }
}

struct Borrowed<'a>(&'a dyn LegacyLoader);

impl LegacyLoader for Borrowed<'_> {
    fn load(&self, name: &str, shape: &Shape) -> Option<Tensor> {
        self.0.load(name, shape)
    }
}

fn restore_legacy(vars: &[(String, Var)], loader: &dyn LegacyLoader) -> Result<()> {
    let values = vars
        .iter()
        .map(|(name, var)| {
            let value = loader
                .load(name, var.shape())
                .ok_or_else(|| YoloError::MissingVariable(name.clone()))?;
            checked_value(name, var, &value)
        })
        .collect::<Result<Vec<_>>>()?;
    assign_all(vars, &values)
}

/// `value` converted for `var`, or an error when the shapes differ.
fn checked_value(name: &str, var: &Var, value: &Tensor) -> Result<Tensor> {
    if value.shape() != var.shape() {
        return Err(YoloError::Configuration(format!(
            "variable {name} has shape {:?} in the checkpoint, the model expects {:?}",
            value.shape(),
            var.shape()
        )));
    }
    Ok(value.to_dtype(var.dtype())?.to_device(var.device())?)
}

// every value is resolved before the first write, a failed restore leaves the vars as they were
fn assign_all(vars: &[(String, Var)], values: &[Tensor]) -> Result<()> {
    for ((_, var), value) in vars.iter().zip(values) {
        var.set(value)?;
    }
    Ok(())
}

fn sorted_vars(varmap: &VarMap) -> Vec<(String, Var)> {
    let data = varmap
        .data()
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    let mut vars: Vec<(String, Var)> = data
        .iter()
        .map(|(name, var)| (name.clone(), var.clone()))
        .collect();
    vars.sort_by(|a, b| a.0.cmp(&b.0));
    vars
}

fn quoted(line: &str) -> Option<&str> {
    line.split('"').nth(1)
}

/// `all_model_checkpoint_paths: "yolo-400"` gives 400.
fn parse_index_line(line: &str) -> Option<u64> {
    let token = line.split(' ').nth(1)?;
    let path = quoted(token)?;
    path.rsplit('-').next()?.parse().ok()
}
