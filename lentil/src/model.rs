//! Two-layer alignment model.
//!
//! Each sample v has a warp g_v from its observed frame to the shared
//! template, and a single outcome GP f maps template coordinates to
//! features:
//!
//! ```text
//! x (observed) --g_v--> g (aligned) --f--> y (features) + N(0, τ_v²)
//! ```
//!
//! All tensors are registered in one [`ParamStore`]; layers hold
//! tensors that share storage with the store, so optimizer updates and
//! loads are seen without rebuilding anything.

use crate::config::{AlignConfig, KernelConfig, WarpMean};
use crate::convert::ConvertTensorOps;
use crate::error::{AlignError, Result};
use crate::inducing::init_inducing;
use crate::params::ParamStore;
use crate::sample::{shared_dims, Sample};
use crate::sampling::reparameterize;
use crate::warp::{AffineMean, SampleWarp, WarpLayer};

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_util::candle_kernels::Kernel;
use candle_util::candle_linalg::to_host_vec;
use candle_util::candle_svgp::SvgpLayer;
use log::debug;
use ndarray::Axis;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::BTreeMap;
use std::path::Path;

const MIN_LN_NOISE: f64 = -12.0;
const MAX_LN_NOISE: f64 = 10.0;

pub struct WarpAlignModel {
    config: AlignConfig,
    params: ParamStore,
    sample_ids: Vec<String>,
    sample_sizes: Vec<usize>,
    dim_coord: usize,
    dim_feature: usize,
    warps: Vec<SampleWarp>,
    outcome: SvgpLayer,
    ln_noise_v: Tensor,
}

/// Aligned coordinates of one sample before the outcome layer
pub struct WarpDraw {
    /// aligned coordinates fed to the outcome layer
    pub aligned_nd: Tensor,
    pub aligned_mean_nd: Tensor,
    pub aligned_var_nd: Tensor,
    /// `None` for the reference sample
    pub kl: Option<Tensor>,
}

/// One pass through both layers
pub struct ForwardOutput {
    /// aligned coordinates fed to the outcome layer
    pub aligned_nd: Tensor,
    pub aligned_mean_nd: Tensor,
    pub aligned_var_nd: Tensor,
    pub feature_mean_np: Tensor,
    pub feature_var_np: Tensor,
}

fn build_kernel(config: &KernelConfig, vb: VarBuilder) -> Result<Kernel> {
    Ok(Kernel::new(
        config.kind,
        config.lengthscale,
        config.outputscale,
        vb,
    )?)
}

impl WarpAlignModel {
    /// Initialize every layer from the training samples
    ///
    /// Shapes are fixed here: the number of samples, D, P and the
    /// inducing counts cannot change afterwards.
    pub fn new(samples: &[Sample], config: AlignConfig) -> Result<Self> {
        config.validate()?;
        let (dim_coord, dim_feature) = shared_dims(samples)?;
        config.validate_samples(samples, dim_coord)?;

        let dtype = config.dtype;
        let dev = config.device.clone();
        let mut params = ParamStore::new(dtype, &dev);
        let mut rng = StdRng::seed_from_u64(config.seed);
        let vb = params.var_builder();

        let num_warped = samples.len() - usize::from(config.reference_sample.is_some());
        let shared_kernel = if config.share_warp_kernel && num_warped > 0 {
            Some(build_kernel(&config.warp_kernel, vb.pp("warp.kernel"))?)
        } else {
            None
        };

        let mut warps = Vec::with_capacity(samples.len());

        for (v, sample) in samples.iter().enumerate() {
            if config.reference_sample == Some(v) {
                debug!("sample {} ({}) is the reference frame", v, sample.id());
                warps.push(SampleWarp::Reference);
                continue;
            }

            let z = init_inducing(
                &config.warp_inducing,
                sample.coords(),
                config.num_inducing_warp,
                &mut rng,
            )?;
            let z = params.insert(
                &format!("warp.{}.inducing", v),
                &z.to_tensor(dtype, &dev)?,
                config.learn_inducing,
            )?;

            let kernel = match &shared_kernel {
                Some(kernel) => kernel.clone(),
                None => build_kernel(&config.warp_kernel, vb.pp(format!("warp.{}.kernel", v)))?,
            };

            let gp = SvgpLayer::new(
                kernel,
                z,
                dim_coord,
                config.whiten,
                config.jitter,
                config.warp_init_scale,
                vb.pp(format!("warp.{}", v)),
            )?;

            let affine = match config.warp_mean {
                WarpMean::Identity => None,
                WarpMean::Affine => {
                    let weight = params.insert(
                        &format!("warp.{}.affine.weight", v),
                        &Tensor::eye(dim_coord, DType::F64, &Device::Cpu)?,
                        true,
                    )?;
                    let bias = params.insert(
                        &format!("warp.{}.affine.bias", v),
                        &Tensor::zeros((1, dim_coord), DType::F64, &Device::Cpu)?,
                        true,
                    )?;
                    Some(AffineMean::new(weight, bias))
                }
            };

            warps.push(SampleWarp::Warped(WarpLayer::new(gp, affine)));
        }

        // the outcome layer starts over the pooled observed frames
        let views: Vec<_> = samples.iter().map(|s| s.coords().view()).collect();
        let pooled = ndarray::concatenate(Axis(0), &views)
            .map_err(|e| AlignError::Shape(e.to_string()))?;

        let z = init_inducing(
            &config.outcome_inducing,
            &pooled,
            config.num_inducing_outcome,
            &mut rng,
        )?;
        let z = params.insert(
            "outcome.inducing",
            &z.to_tensor(dtype, &dev)?,
            config.learn_inducing,
        )?;
        let outcome = SvgpLayer::new(
            build_kernel(&config.outcome_kernel, vb.pp("outcome.kernel"))?,
            z,
            dim_feature,
            config.whiten,
            config.jitter,
            1.0,
            vb.pp("outcome"),
        )?;

        let ln_noise_v = params.insert(
            "likelihood.ln_noise",
            &Tensor::full(config.noise_variance.ln(), samples.len(), &Device::Cpu)?,
            config.learn_noise,
        )?;

        debug!(
            "initialized {} samples (D = {}, P = {}) with {} parameters",
            samples.len(),
            dim_coord,
            dim_feature,
            params.num_scalars()?
        );

        Ok(Self {
            sample_ids: samples.iter().map(|s| s.id().to_string()).collect(),
            sample_sizes: samples.iter().map(|s| s.num_locations()).collect(),
            config,
            params,
            dim_coord,
            dim_feature,
            warps,
            outcome,
            ln_noise_v,
        })
    }

    /// Rebuild the model for `samples` and overwrite its parameters
    /// with the values saved at `path`
    pub fn load<P: AsRef<Path>>(samples: &[Sample], config: AlignConfig, path: P) -> Result<Self> {
        let mut model = Self::new(samples, config)?;
        model.params.load(path)?;
        Ok(model)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.params.save(path)
    }

    pub fn config(&self) -> &AlignConfig {
        &self.config
    }

    pub fn params(&self) -> &ParamStore {
        &self.params
    }

    pub fn named_parameters(&self) -> Result<BTreeMap<String, Tensor>> {
        self.params.named_tensors()
    }

    pub fn num_samples(&self) -> usize {
        self.sample_ids.len()
    }

    pub fn sample_ids(&self) -> &[String] {
        &self.sample_ids
    }

    pub fn sample_index(&self, id: &str) -> Option<usize> {
        self.sample_ids.iter().position(|s| s == id)
    }

    pub fn sample_sizes(&self) -> &[usize] {
        &self.sample_sizes
    }

    pub fn dim_coord(&self) -> usize {
        self.dim_coord
    }

    pub fn dim_feature(&self) -> usize {
        self.dim_feature
    }

    pub fn dtype(&self) -> DType {
        self.params.dtype()
    }

    pub fn device(&self) -> &Device {
        self.params.device()
    }

    pub fn warp(&self, sample: usize) -> Result<&SampleWarp> {
        self.warps.get(sample).ok_or_else(|| {
            AlignError::Shape(format!(
                "sample index {} out of range for {} samples",
                sample,
                self.warps.len()
            ))
        })
    }

    pub fn warps(&self) -> &[SampleWarp] {
        &self.warps
    }

    pub fn outcome(&self) -> &SvgpLayer {
        &self.outcome
    }

    /// τ² per sample, shape (V,)
    pub fn noise_variance_tensor(&self) -> Result<Tensor> {
        Ok(self
            .ln_noise_v
            .clamp(MIN_LN_NOISE, MAX_LN_NOISE)?
            .exp()?)
    }

    pub fn noise_variance(&self, sample: usize) -> Result<f64> {
        self.warp(sample)?;
        let tau2 = to_host_vec(&self.noise_variance_tensor()?)?;
        Ok(tau2[sample])
    }

    pub(crate) fn check_coords(&self, x_nd: &Tensor) -> Result<usize> {
        let (n, d) = x_nd.dims2()?;
        if d != self.dim_coord {
            return Err(AlignError::Shape(format!(
                "coordinates have {} columns, model expects {}",
                d, self.dim_coord
            )));
        }
        Ok(n)
    }

    /// Warp stage of [`Self::forward`]: aligned coordinates of one
    /// sample together with the KL term of its warp
    ///
    /// * `sample` - sample index
    /// * `x_nd` - observed coordinates (n x D)
    /// * `eps_nd` - standard normal noise for a reparameterized draw of
    ///   the aligned coordinates; `None` feeds the warp mean
    pub fn warp_draw(&self, sample: usize, x_nd: &Tensor, eps_nd: Option<&Tensor>) -> Result<WarpDraw> {
        let warp = self.warp(sample)?;
        let n = self.check_coords(x_nd)?;

        let eval = warp.evaluate(x_nd)?;

        let aligned_nd = match eps_nd {
            Some(eps) if !warp.is_reference() => {
                if eps.dims() != [n, self.dim_coord] {
                    return Err(AlignError::Shape(format!(
                        "noise is {:?}, expected [{}, {}]",
                        eps.dims(),
                        n,
                        self.dim_coord
                    )));
                }
                reparameterize(&eval.mean_nd, &eval.var_nd, eps)?
            }
            _ => eval.mean_nd.clone(),
        };

        Ok(WarpDraw {
            aligned_nd,
            aligned_mean_nd: eval.mean_nd,
            aligned_var_nd: eval.var_nd,
            kl: eval.kl,
        })
    }

    /// Push observed coordinates of one sample through both layers
    ///
    /// Arguments as in [`Self::warp_draw`].
    pub fn forward(&self, sample: usize, x_nd: &Tensor, eps_nd: Option<&Tensor>) -> Result<ForwardOutput> {
        let draw = self.warp_draw(sample, x_nd, eps_nd)?;
        let (feature_mean_np, feature_var_np) = self.outcome.posterior()?.predict(&draw.aligned_nd)?;

        Ok(ForwardOutput {
            aligned_nd: draw.aligned_nd,
            aligned_mean_nd: draw.aligned_mean_nd,
            aligned_var_nd: draw.aligned_var_nd,
            feature_mean_np,
            feature_var_np,
        })
    }
}
