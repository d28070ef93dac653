use candle_core::{Tensor, Var, backprop::GradStore};
use candle_nn::{AdamW, Optimizer as _, ParamsAdamW, SGD};
use serde::{Deserialize, Serialize};

use crate::error::{Result, YoloError};

/// Optimizer kinds selectable by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    /// Plain gradient descent.
    Sgd,
    /// Gradient descent with momentum.
    Momentum,
    /// Momentum with the Nesterov look-ahead.
    Nesterov,
    /// RMSProp with momentum.
    RmsProp,
    /// Adagrad.
    Adagrad,
    /// Adadelta.
    Adadelta,
    /// Adam.
    Adam,
}

impl TryFrom<String> for OptimizerKind {
    type Error = YoloError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        Ok(match s.as_str() {
            "sgd" => OptimizerKind::Sgd,
            "momentum" => OptimizerKind::Momentum,
            "nesterov" => OptimizerKind::Nesterov,
            "rmsprop" => OptimizerKind::RmsProp,
            "adagrad" => OptimizerKind::Adagrad,
            "adadelta" => OptimizerKind::Adadelta,
            "adam" => OptimizerKind::Adam,
            _ => {
                return Err(YoloError::Configuration(format!(
                    "Invalid trainer: {s}"
                )));
            }
        })
    }
}

impl std::fmt::Display for OptimizerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                OptimizerKind::Sgd => "sgd",
                OptimizerKind::Momentum => "momentum",
                OptimizerKind::Nesterov => "nesterov",
                OptimizerKind::RmsProp => "rmsprop",
                OptimizerKind::Adagrad => "adagrad",
                OptimizerKind::Adadelta => "adadelta",
                OptimizerKind::Adam => "adam",
            }
        )
    }
}

/// Optimizer and learning-rate settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerConfig {
    /// Which update rule to use.
    pub kind: OptimizerKind,
    /// Base learning rate.
    pub learning_rate: f64,
    /// Momentum for `momentum`, `nesterov` and `rmsprop`.
    pub momentum: f64,
    /// Upper bound of the cyclic schedule; `None` keeps the rate constant.
    pub max_learning_rate: Option<f64>,
    /// Half period of the cyclic schedule, in steps.
    pub step_size: u64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            kind: OptimizerKind::RmsProp,
            learning_rate: 1e-5,
            momentum: 0.0,
            max_learning_rate: None,
            step_size: 20,
        }
    }
}

/// Triangular cyclic learning rate whose amplitude halves every cycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CyclicLearningRate {
    /// Lower bound.
    pub base: f64,
    /// Upper bound of the first cycle.
    pub max: f64,
    /// Half period in steps.
    pub step_size: u64,
}

impl CyclicLearningRate {
    /// Learning rate at `step`.
    pub fn at(&self, step: u64) -> f64 {
        let step_size = self.step_size.max(1) as f64;
        let step = step as f64;
        let cycle = (1.0 + step / (2.0 * step_size)).floor();
        let x = (step / step_size - 2.0 * cycle + 1.0).abs();
        let amplitude = (self.max - self.base) * (1.0 - x).max(0.0);
        self.base + amplitude / 2f64.powf(cycle - 1.0)
    }
}

impl OptimizerConfig {
    /// The schedule, when a maximum learning rate is configured.
    pub fn schedule(&self) -> Option<CyclicLearningRate> {
        self.max_learning_rate.map(|max| CyclicLearningRate {
            base: self.learning_rate,
            max,
            step_size: self.step_size,
        })
    }

    /// Learning rate to use at `step`.
    pub fn learning_rate_at(&self, step: u64) -> f64 {
        self.schedule()
            .map_or(self.learning_rate, |schedule| schedule.at(step))
    }
}

/// Momentum SGD, optionally with the Nesterov update.
pub struct Momentum {
    vars: Vec<(Var, Tensor)>,
    lr: f64,
    momentum: f64,
    nesterov: bool,
}

/// Settings for [`Momentum`].
#[derive(Debug, Clone, Copy)]
pub struct ParamsMomentum {
    /// Learning rate.
    pub lr: f64,
    /// Decay of the accumulator.
    pub momentum: f64,
    /// Use the Nesterov look-ahead.
    pub nesterov: bool,
}

impl candle_nn::Optimizer for Momentum {
    type Config = ParamsMomentum;

    fn new(vars: Vec<Var>, config: ParamsMomentum) -> candle_core::Result<Self> {
        let vars = with_slots(vars, 0.0)?;
        Ok(Self {
            vars,
            lr: config.lr,
            momentum: config.momentum,
            nesterov: config.nesterov,
        })
    }

    fn step(&mut self, grads: &GradStore) -> candle_core::Result<()> {
        for (var, accum) in self.vars.iter_mut() {
            let Some(grad) = grads.get(var) else {
                continue;
            };
            *accum = ((&*accum * self.momentum)? + grad)?;
            let update = if self.nesterov {
                (grad + (&*accum * self.momentum)?)?
            } else {
                accum.clone()
            };
            var.set(&var.sub(&(update * self.lr)?)?)?;
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.lr = lr;
    }
}

/// RMSProp with momentum.
pub struct RmsProp {
    vars: Vec<(Var, Tensor, Tensor)>,
    params: ParamsRmsProp,
}

/// Settings for [`RmsProp`].
#[derive(Debug, Clone, Copy)]
pub struct ParamsRmsProp {
    /// Learning rate.
    pub lr: f64,
    /// Decay of the squared-gradient average.
    pub decay: f64,
    /// Momentum of the update.
    pub momentum: f64,
    /// Numerical floor added under the square root.
    pub eps: f64,
}

impl candle_nn::Optimizer for RmsProp {
    type Config = ParamsRmsProp;

    fn new(vars: Vec<Var>, params: ParamsRmsProp) -> candle_core::Result<Self> {
        let vars = with_slots(vars, 1.0)?
            .into_iter()
            .map(|(var, ms)| {
                let mom = ms.zeros_like()?;
                Ok((var, ms, mom))
            })
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(Self { vars, params })
    }

    fn step(&mut self, grads: &GradStore) -> candle_core::Result<()> {
        let p = self.params;
        for (var, ms, mom) in self.vars.iter_mut() {
            let Some(grad) = grads.get(var) else {
                continue;
            };
            *ms = ((&*ms * p.decay)? + (grad.sqr()? * (1.0 - p.decay))?)?;
            let scaled = (grad / (&*ms + p.eps)?.sqrt()?)?;
            *mom = ((&*mom * p.momentum)? + (scaled * p.lr)?)?;
            var.set(&var.sub(mom)?)?;
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.params.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.params.lr = lr;
    }
}

/// Adagrad.
pub struct Adagrad {
    vars: Vec<(Var, Tensor)>,
    lr: f64,
}

impl candle_nn::Optimizer for Adagrad {
    type Config = f64;

    fn new(vars: Vec<Var>, lr: f64) -> candle_core::Result<Self> {
        Ok(Self {
            vars: with_slots(vars, 0.1)?,
            lr,
        })
    }

    fn step(&mut self, grads: &GradStore) -> candle_core::Result<()> {
        for (var, accum) in self.vars.iter_mut() {
            let Some(grad) = grads.get(var) else {
                continue;
            };
            *accum = (&*accum + grad.sqr()?)?;
            let update = (grad / accum.sqrt()?)?;
            var.set(&var.sub(&(update * self.lr)?)?)?;
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.lr = lr;
    }
}

/// Adadelta.
pub struct Adadelta {
    vars: Vec<(Var, Tensor, Tensor)>,
    lr: f64,
}

impl Adadelta {
    const RHO: f64 = 0.95;
    const EPS: f64 = 1e-8;
}

impl candle_nn::Optimizer for Adadelta {
    type Config = f64;

    fn new(vars: Vec<Var>, lr: f64) -> candle_core::Result<Self> {
        let vars = with_slots(vars, 0.0)?
            .into_iter()
            .map(|(var, accum)| {
                let accum_update = accum.zeros_like()?;
                Ok((var, accum, accum_update))
            })
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(Self { vars, lr })
    }

    fn step(&mut self, grads: &GradStore) -> candle_core::Result<()> {
        let (rho, eps) = (Self::RHO, Self::EPS);
        for (var, accum, accum_update) in self.vars.iter_mut() {
            let Some(grad) = grads.get(var) else {
                continue;
            };
            *accum = ((&*accum * rho)? + (grad.sqr()? * (1.0 - rho))?)?;
            let ratio = ((&*accum_update + eps)?.sqrt()? / (&*accum + eps)?.sqrt()?)?;
            let update = (ratio * grad)?;
            *accum_update = ((&*accum_update * rho)? + (update.sqr()? * (1.0 - rho))?)?;
            var.set(&var.sub(&(update * self.lr)?)?)?;
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.lr = lr;
    }
}

fn with_slots(vars: Vec<Var>, init: f64) -> candle_core::Result<Vec<(Var, Tensor)>> {
    vars.into_iter()
        .filter(|var| var.dtype().is_float())
        .map(|var| {
            let slot = var.as_tensor().detach().ones_like()?.affine(init, 0.0)?;
            Ok((var, slot))
        })
        .collect()
}

/// Enum dispatch over the supported optimizers.
pub enum Optimizer {
    /// candle-nn SGD.
    Sgd(SGD),
    /// Momentum or Nesterov.
    Momentum(Momentum),
    /// RMSProp.
    RmsProp(RmsProp),
    /// Adagrad.
    Adagrad(Adagrad),
    /// Adadelta.
    Adadelta(Adadelta),
    /// candle-nn AdamW without weight decay.
    Adam(AdamW),
}

impl Optimizer {
    /// Build the optimizer named by `config` over `vars`.
    pub fn new(config: &OptimizerConfig, vars: Vec<Var>) -> Result<Self> {
        let lr = config.learning_rate;
        Ok(match config.kind {
            OptimizerKind::Sgd => Optimizer::Sgd(SGD::new(vars, lr)?),
            OptimizerKind::Momentum | OptimizerKind::Nesterov => {
                Optimizer::Momentum(Momentum::new(
                    vars,
                    ParamsMomentum {
                        lr,
                        momentum: config.momentum,
                        nesterov: config.kind == OptimizerKind::Nesterov,
                    },
                )?)
            }
            OptimizerKind::RmsProp => Optimizer::RmsProp(RmsProp::new(
                vars,
                ParamsRmsProp {
                    lr,
                    decay: 0.9,
                    momentum: config.momentum,
                    eps: 1e-10,
                },
            )?),
            OptimizerKind::Adagrad => Optimizer::Adagrad(Adagrad::new(vars, lr)?),
            OptimizerKind::Adadelta => Optimizer::Adadelta(Adadelta::new(vars, lr)?),
            OptimizerKind::Adam => Optimizer::Adam(AdamW::new(
                vars,
                ParamsAdamW {
                    lr,
                    weight_decay: 0.0,
                    ..Default::default()
                },
            )?),
        })
    }

    /// Apply one update from `grads`.
    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        match self {
            Optimizer::Sgd(o) => o.step(grads)?,
            Optimizer::Momentum(o) => o.step(grads)?,
            Optimizer::RmsProp(o) => o.step(grads)?,
            Optimizer::Adagrad(o) => o.step(grads)?,
            Optimizer::Adadelta(o) => o.step(grads)?,
            Optimizer::Adam(o) => o.step(grads)?,
        }
        Ok(())
    }

    /// Current learning rate.
    pub fn learning_rate(&self) -> f64 {
        match self {
            Optimizer::Sgd(o) => o.learning_rate(),
            Optimizer::Momentum(o) => o.learning_rate(),
            Optimizer::RmsProp(o) => o.learning_rate(),
            Optimizer::Adagrad(o) => o.learning_rate(),
            Optimizer::Adadelta(o) => o.learning_rate(),
            Optimizer::Adam(o) => o.learning_rate(),
        }
    }

    /// Replace the learning rate used by the next step.
    pub fn set_learning_rate(&mut self, lr: f64) {
        match self {
            Optimizer::Sgd(o) => o.set_learning_rate(lr),
            Optimizer::Momentum(o) => o.set_learning_rate(lr),
            Optimizer::RmsProp(o) => o.set_learning_rate(lr),
            Optimizer::Adagrad(o) => o.set_learning_rate(lr),
            Optimizer::Adadelta(o) => o.set_learning_rate(lr),
            Optimizer::Adam(o) => o.set_learning_rate(lr),
        }
    }
}
