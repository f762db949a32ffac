use crate::error::{AlignError, Result};
use crate::sample::Sample;
use candle_core::{DType, Device};
use candle_util::candle_kernels::KernelKind;
use ndarray::Array2;

/// Kernel family and initial hyperparameters of one layer
#[derive(Clone, Debug)]
pub struct KernelConfig {
    pub kind: KernelKind,
    pub lengthscale: f64,
    pub outputscale: f64,
}

impl KernelConfig {
    fn validate(&self, layer: &str) -> Result<()> {
        if !(self.lengthscale > 0.0 && self.lengthscale.is_finite()) {
            return Err(AlignError::Config(format!(
                "{} lengthscale must be positive, got {}",
                layer, self.lengthscale
            )));
        }
        if !(self.outputscale > 0.0 && self.outputscale.is_finite()) {
            return Err(AlignError::Config(format!(
                "{} outputscale must be positive, got {}",
                layer, self.outputscale
            )));
        }
        Ok(())
    }
}

/// Where the inducing points start
#[derive(Clone, Debug)]
pub enum InducingInit {
    /// Product grid of per-dimension quantiles of the data
    Grid,
    /// Seeded subset of the data locations, without replacement
    Random,
    /// Given locations (m x D), shared by every layer of this kind
    Explicit(Array2<f64>),
}

/// Deterministic part of the warp, added to the GP deviation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WarpMean {
    /// g(x) = x + f(x)
    Identity,
    /// g(x) = x W + b + f(x), with W = I and b = 0 at the start
    Affine,
}

/// Model structure and initialization
#[derive(Clone, Debug)]
pub struct AlignConfig {
    pub num_inducing_warp: usize,
    pub num_inducing_outcome: usize,
    pub warp_kernel: KernelConfig,
    pub outcome_kernel: KernelConfig,
    /// one warp kernel for all samples instead of one per sample
    pub share_warp_kernel: bool,
    pub warp_mean: WarpMean,
    /// this sample's observed frame is the template; it is never warped
    pub reference_sample: Option<usize>,
    pub warp_inducing: InducingInit,
    pub outcome_inducing: InducingInit,
    pub learn_inducing: bool,
    pub whiten: bool,
    pub jitter: f64,
    /// initial diagonal of the warp layers' variational factor
    pub warp_init_scale: f64,
    pub noise_variance: f64,
    pub learn_noise: bool,
    pub seed: u64,
    pub dtype: DType,
    pub device: Device,
}

impl Default for AlignConfig {
    fn default() -> Self {
        Self {
            num_inducing_warp: 16,
            num_inducing_outcome: 36,
            warp_kernel: KernelConfig {
                kind: KernelKind::SquaredExponential,
                lengthscale: 1.0,
                outputscale: 0.1,
            },
            outcome_kernel: KernelConfig {
                kind: KernelKind::SquaredExponential,
                lengthscale: 0.5,
                outputscale: 1.0,
            },
            share_warp_kernel: false,
            warp_mean: WarpMean::Identity,
            reference_sample: None,
            warp_inducing: InducingInit::Grid,
            outcome_inducing: InducingInit::Grid,
            learn_inducing: true,
            whiten: true,
            jitter: 1e-5,
            warp_init_scale: 0.1,
            noise_variance: 0.1,
            learn_noise: true,
            seed: 42,
            dtype: DType::F64,
            device: Device::Cpu,
        }
    }
}

impl AlignConfig {
    /// Checks that need no data
    pub fn validate(&self) -> Result<()> {
        if self.num_inducing_warp == 0 || self.num_inducing_outcome == 0 {
            return Err(AlignError::Config(format!(
                "need at least one inducing point per layer, got warp {} and outcome {}",
                self.num_inducing_warp, self.num_inducing_outcome
            )));
        }

        self.warp_kernel.validate("warp kernel")?;
        self.outcome_kernel.validate("outcome kernel")?;

        if !(self.jitter >= 0.0 && self.jitter.is_finite()) {
            return Err(AlignError::Config(format!(
                "jitter must be non-negative, got {}",
                self.jitter
            )));
        }

        if !(self.warp_init_scale > 0.0 && self.warp_init_scale.is_finite()) {
            return Err(AlignError::Config(format!(
                "warp_init_scale must be positive, got {}",
                self.warp_init_scale
            )));
        }

        if !(self.noise_variance > 0.0 && self.noise_variance.is_finite()) {
            return Err(AlignError::Config(format!(
                "noise variance must be positive, got {}",
                self.noise_variance
            )));
        }

        if !matches!(self.dtype, DType::F32 | DType::F64) {
            return Err(AlignError::Config(format!(
                "unsupported dtype {:?}",
                self.dtype
            )));
        }

        check_explicit(&self.warp_inducing, self.num_inducing_warp, "warp")?;
        check_explicit(&self.outcome_inducing, self.num_inducing_outcome, "outcome")?;
        Ok(())
    }

    /// Checks against the training samples
    pub fn validate_samples(&self, samples: &[Sample], dim_coord: usize) -> Result<()> {
        if let Some(r) = self.reference_sample {
            if r >= samples.len() {
                return Err(AlignError::Config(format!(
                    "reference sample {} out of range for {} samples",
                    r,
                    samples.len()
                )));
            }
        }

        for (init, layer) in [
            (&self.warp_inducing, "warp"),
            (&self.outcome_inducing, "outcome"),
        ] {
            if let InducingInit::Explicit(z) = init {
                if z.ncols() != dim_coord {
                    return Err(AlignError::Config(format!(
                        "explicit {} inducing points have {} columns, samples have {}",
                        layer,
                        z.ncols(),
                        dim_coord
                    )));
                }
            }
        }

        if matches!(self.warp_inducing, InducingInit::Random) {
            for (v, s) in samples.iter().enumerate() {
                if Some(v) != self.reference_sample && s.num_locations() < self.num_inducing_warp {
                    return Err(AlignError::Config(format!(
                        "sample {} has {} locations, fewer than {} warp inducing points",
                        s.id(),
                        s.num_locations(),
                        self.num_inducing_warp
                    )));
                }
            }
        }

        if matches!(self.outcome_inducing, InducingInit::Random) {
            let ntot: usize = samples.iter().map(|s| s.num_locations()).sum();
            if ntot < self.num_inducing_outcome {
                return Err(AlignError::Config(format!(
                    "{} locations in total, fewer than {} outcome inducing points",
                    ntot, self.num_inducing_outcome
                )));
            }
        }

        Ok(())
    }
}

fn check_explicit(init: &InducingInit, m: usize, layer: &str) -> Result<()> {
    if let InducingInit::Explicit(z) = init {
        if z.nrows() != m {
            return Err(AlignError::Config(format!(
                "explicit {} inducing points have {} rows, expected {}",
                layer,
                z.nrows(),
                m
            )));
        }
        if z.iter().any(|x| !x.is_finite()) {
            return Err(AlignError::Config(format!(
                "explicit {} inducing points contain non-finite values",
                layer
            )));
        }
    }
    Ok(())
}

/// Optimization settings
#[derive(Clone, Debug)]
pub struct TrainConfig {
    pub learning_rate: f64,
    pub num_iterations: usize,
    /// locations drawn per sample and step; `None` uses every location
    pub batch_size: Option<usize>,
    pub seed: u64,
    pub verbose: bool,
    pub show_progress: bool,
    pub log_every: usize,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-2,
            num_iterations: 1000,
            batch_size: None,
            seed: 7,
            verbose: false,
            show_progress: false,
            log_every: 100,
        }
    }
}

impl TrainConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.learning_rate > 0.0 && self.learning_rate.is_finite()) {
            return Err(AlignError::Config(format!(
                "learning rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if self.batch_size == Some(0) {
            return Err(AlignError::Config("batch size must be positive".into()));
        }
        if self.log_every == 0 {
            return Err(AlignError::Config("log_every must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn defaults_are_valid() {
        assert!(AlignConfig::default().validate().is_ok());
        assert!(TrainConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_bad_values() {
        let bad = [
            AlignConfig {
                num_inducing_warp: 0,
                ..Default::default()
            },
            AlignConfig {
                jitter: -1e-6,
                ..Default::default()
            },
            AlignConfig {
                noise_variance: 0.0,
                ..Default::default()
            },
            AlignConfig {
                outcome_kernel: KernelConfig {
                    kind: KernelKind::Matern32,
                    lengthscale: -1.0,
                    outputscale: 1.0,
                },
                ..Default::default()
            },
            AlignConfig {
                num_inducing_warp: 3,
                warp_inducing: InducingInit::Explicit(array![[0.0, 0.0], [1.0, 1.0]]),
                ..Default::default()
            },
            AlignConfig {
                dtype: DType::U8,
                ..Default::default()
            },
        ];
        for config in bad.iter() {
            assert!(
                matches!(config.validate(), Err(AlignError::Config(_))),
                "{:?}",
                config
            );
        }

        let train = TrainConfig {
            learning_rate: 0.0,
            ..Default::default()
        };
        assert!(train.validate().is_err());
        let train = TrainConfig {
            batch_size: Some(0),
            ..Default::default()
        };
        assert!(train.validate().is_err());
    }

    #[test]
    fn sample_dependent_checks() -> anyhow::Result<()> {
        let s = Sample::new("a", array![[0.0, 0.0], [1.0, 0.0], [0.0, 1.0]], array![[1.0], [2.0], [3.0]])?;
        let samples = vec![s];

        let config = AlignConfig {
            reference_sample: Some(1),
            ..Default::default()
        };
        assert!(config.validate_samples(&samples, 2).is_err());

        let config = AlignConfig {
            num_inducing_warp: 4,
            warp_inducing: InducingInit::Random,
            ..Default::default()
        };
        assert!(config.validate_samples(&samples, 2).is_err());

        let config = AlignConfig {
            num_inducing_outcome: 2,
            outcome_inducing: InducingInit::Explicit(array![[0.0, 0.0, 0.0], [1.0, 1.0, 1.0]]),
            ..Default::default()
        };
        config.validate()?;
        assert!(config.validate_samples(&samples, 2).is_err());
        Ok(())
    }
}
