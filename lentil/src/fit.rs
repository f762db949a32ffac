use crate::config::TrainConfig;
use crate::elbo::{joint_elbo, TrainingData};
use crate::error::{AlignError, Result};
use crate::minibatch::MinibatchSampler;
use crate::model::WarpAlignModel;
use crate::sample::Sample;

use candle_core::Var;
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use candle_util::candle_linalg::{ensure_finite, to_host_scalar};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use std::path::Path;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum FitState {
    Initializing,
    /// `step` is running or was the last to complete
    Stepping { step: usize },
    Converged { steps: usize },
    Failed {
        step: usize,
        last_finite_loss: Option<f64>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepControl {
    Continue,
    Stop,
}

/// Called after every completed step with the step index and the loss
/// (negative ELBO)
pub trait FitCallback {
    fn on_step(&mut self, step: usize, loss: f64) -> StepControl;
}

impl<F> FitCallback for F
where
    F: FnMut(usize, f64) -> StepControl,
{
    fn on_step(&mut self, step: usize, loss: f64) -> StepControl {
        self(step, loss)
    }
}

/// Stop once the best loss has not improved by a relative `tol`
/// for `patience` consecutive steps
pub struct LossPlateau {
    pub patience: usize,
    pub tol: f64,
    best: f64,
    since_best: usize,
}

impl LossPlateau {
    pub fn new(patience: usize, tol: f64) -> Self {
        Self {
            patience,
            tol,
            best: f64::INFINITY,
            since_best: 0,
        }
    }
}

impl FitCallback for LossPlateau {
    fn on_step(&mut self, _step: usize, loss: f64) -> StepControl {
        if self.best - loss > self.tol * self.best.abs().max(1.0) || !self.best.is_finite() {
            self.best = loss;
            self.since_best = 0;
        } else {
            self.since_best += 1;
        }
        if self.since_best >= self.patience {
            StepControl::Stop
        } else {
            StepControl::Continue
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct FitReport {
    pub loss_trace: Vec<f64>,
    pub steps: usize,
    pub stopped_by_callback: bool,
    pub final_state: FitState,
}

impl FitReport {
    pub fn final_loss(&self) -> Option<f64> {
        self.loss_trace.last().copied()
    }

    pub fn to_json_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = std::fs::File::create(path)?;
        serde_json::to_writer_pretty(std::io::BufWriter::new(file), self)?;
        Ok(())
    }
}

/// Stochastic variational fit of a [`WarpAlignModel`]
///
/// Holds the model mutably for its lifetime, so a single fit owns the
/// parameters it updates.
pub struct Trainer<'m> {
    model: &'m mut WarpAlignModel,
    data: TrainingData,
    sampler: MinibatchSampler,
    vars: Vec<Var>,
    adam: AdamW,
    rng: StdRng,
    config: TrainConfig,
    state: FitState,
    loss_trace: Vec<f64>,
}

impl<'m> Trainer<'m> {
    /// * `model` - model built from `samples`
    /// * `samples` - training samples, in the model's order
    /// * `config` - optimization settings
    pub fn new(model: &'m mut WarpAlignModel, samples: &[Sample], config: TrainConfig) -> Result<Self> {
        config.validate()?;

        let data = TrainingData::new(&*model, samples)?;
        let sampler = MinibatchSampler::new(model.sample_sizes(), config.batch_size);
        let vars = model.params().trainable_vars()?;

        let adam = AdamW::new(
            vars.clone(),
            ParamsAdamW {
                lr: config.learning_rate,
                weight_decay: 0.0,
                ..Default::default()
            },
        )?;

        debug!(
            "trainer: {} trainable tensors, {} samples, batch {:?}",
            vars.len(),
            data.num_samples(),
            config.batch_size
        );

        Ok(Self {
            model,
            data,
            sampler,
            vars,
            adam,
            rng: StdRng::seed_from_u64(config.seed),
            config,
            state: FitState::Initializing,
            loss_trace: vec![],
        })
    }

    pub fn state(&self) -> &FitState {
        &self.state
    }

    pub fn loss_trace(&self) -> &[f64] {
        &self.loss_trace
    }

    pub fn model(&self) -> &WarpAlignModel {
        &*self.model
    }

    fn last_finite_loss(&self) -> Option<f64> {
        self.loss_trace.last().copied()
    }

    /// One optimizer step; returns the loss before the update
    ///
    /// On error nothing has been updated and the trainer is `Failed`.
    pub fn step(&mut self) -> Result<f64> {
        if let FitState::Failed { .. } = self.state {
            return Err(AlignError::Config("trainer has already failed".into()));
        }

        let step = self.loss_trace.len();
        self.state = FitState::Stepping { step };

        match self.try_step() {
            Ok(loss) => {
                self.loss_trace.push(loss);
                Ok(loss)
            }
            Err(e) => {
                let last_finite_loss = self.last_finite_loss();
                warn!("step {} failed: {}", step, e);
                self.state = FitState::Failed {
                    step,
                    last_finite_loss,
                };
                Err(AlignError::StepFailed {
                    step,
                    last_finite_loss,
                    source: Box::new(e),
                })
            }
        }
    }

    fn try_step(&mut self) -> Result<f64> {
        let batches = self.sampler.draw(&mut self.rng)?;
        let terms = joint_elbo(&*self.model, &self.data, &batches, Some(&mut self.rng))?;
        let loss = terms.loss()?;

        let loss_val = to_host_scalar(&loss)?;
        if !loss_val.is_finite() {
            return Err(AlignError::NonFinite {
                what: format!("loss ({})", loss_val),
            });
        }

        let grads = loss.backward()?;
        for var in self.vars.iter() {
            if let Some(g) = grads.get(var.as_tensor()) {
                ensure_finite(g, "gradient")?;
            }
        }

        self.adam.step(&grads)?;
        Ok(loss_val)
    }

    /// Run up to `num_iterations` steps, asking `callback` after each
    pub fn run<C: FitCallback>(&mut self, callback: &mut C) -> Result<FitReport> {
        let num_iter = self.config.num_iterations;
        let pb = ProgressBar::new(num_iter as u64);
        if let Ok(style) = ProgressStyle::with_template("Aligning {bar:40} {pos}/{len} iterations ({eta})") {
            pb.set_style(style.progress_chars("##-"));
        }
        if !self.config.show_progress || self.config.verbose {
            pb.set_draw_target(ProgressDrawTarget::hidden());
        }

        let mut stopped_by_callback = false;

        for _ in 0..num_iter {
            let step = self.loss_trace.len();
            let loss = self.step()?;
            pb.inc(1);

            if self.config.verbose && (step + 1) % self.config.log_every == 0 {
                info!("[{}] loss: {}", step + 1, loss);
            }

            if callback.on_step(step, loss) == StepControl::Stop {
                info!("stopped by callback after step {}", step + 1);
                stopped_by_callback = true;
                break;
            }
        }
        pb.finish_and_clear();

        let steps = self.loss_trace.len();
        self.state = FitState::Converged { steps };

        Ok(FitReport {
            loss_trace: self.loss_trace.clone(),
            steps,
            stopped_by_callback,
            final_state: self.state.clone(),
        })
    }
}

/// Fit `model` to `samples` for the configured number of iterations
pub fn fit(model: &mut WarpAlignModel, samples: &[Sample], config: TrainConfig) -> Result<FitReport> {
    let mut trainer = Trainer::new(model, samples, config)?;
    trainer.run(&mut |_: usize, _: f64| StepControl::Continue)
}
