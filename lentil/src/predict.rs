use crate::convert::ConvertTensorOps;
use crate::error::{AlignError, Result};
use crate::model::WarpAlignModel;
use crate::sample::Sample;
use crate::warp::SampleWarp;

use candle_core::{DType, Device, Tensor};
use candle_util::candle_kernels::Kernel;
use candle_util::candle_linalg::to_host_vec;
use candle_util::candle_model_traits::InducingLayerT;
use ndarray::Array2;
use serde::Serialize;
use std::path::Path;

/// Template coordinates of a set of locations
#[derive(Clone, Debug)]
pub struct AlignedCoords {
    pub mean: Array2<f64>,
    /// per-coordinate marginal variance; zero for the reference sample
    pub var: Array2<f64>,
}

/// Latent feature distribution; the observation noise is not included
#[derive(Clone, Debug)]
pub struct FeaturePrediction {
    pub mean: Array2<f64>,
    pub var: Array2<f64>,
}

#[derive(Clone, Debug, Serialize)]
pub struct KernelSummary {
    pub kind: String,
    pub lengthscale: f64,
    pub outputscale: f64,
}

impl KernelSummary {
    fn from_kernel(kernel: &Kernel) -> Result<Self> {
        Ok(Self {
            kind: format!("{:?}", kernel.kind()),
            lengthscale: kernel.lengthscale()?,
            outputscale: kernel.outputscale()?,
        })
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct WarpSummary {
    pub sample: String,
    pub reference: bool,
    pub kernel: Option<KernelSummary>,
    pub affine_weight: Option<Vec<Vec<f64>>>,
    pub affine_bias: Option<Vec<f64>>,
}

#[derive(Clone, Debug, Serialize)]
pub struct HyperparameterSummary {
    pub warps: Vec<WarpSummary>,
    pub outcome_kernel: KernelSummary,
    pub noise_variance: Vec<f64>,
}

impl HyperparameterSummary {
    pub fn to_json_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = std::fs::File::create(path)?;
        serde_json::to_writer_pretty(std::io::BufWriter::new(file), self)?;
        Ok(())
    }
}

fn host_matrix(x: &Tensor) -> Result<Vec<Vec<f64>>> {
    Ok(x.to_device(&Device::Cpu)?
        .to_dtype(DType::F64)?
        .to_vec2::<f64>()?)
}

impl WarpAlignModel {
    /// Map observed coordinates of `sample` to the template
    ///
    /// Works for any locations in the sample's observed frame, not only
    /// the training ones. The warp mean is used; nothing is sampled.
    pub fn align(&self, sample: usize, coords: &Array2<f64>) -> Result<AlignedCoords> {
        let warp = self.warp(sample)?;
        let x_nd = coords.to_tensor(self.dtype(), self.device())?;
        self.check_coords(&x_nd)?;

        let (mean_nd, var_nd) = warp.predict(&x_nd)?;
        Ok(AlignedCoords {
            mean: Array2::from_tensor(&mean_nd.detach())?,
            var: Array2::from_tensor(&var_nd.detach())?,
        })
    }

    /// Same as [`WarpAlignModel::align`], by sample id
    pub fn align_by_id(&self, id: &str, coords: &Array2<f64>) -> Result<AlignedCoords> {
        let sample = self
            .sample_index(id)
            .ok_or_else(|| AlignError::Shape(format!("unknown sample {}", id)))?;
        self.align(sample, coords)
    }

    /// Aligned training locations of every sample, in model order
    pub fn align_samples(&self, samples: &[Sample]) -> Result<Vec<AlignedCoords>> {
        if samples.len() != self.num_samples() {
            return Err(AlignError::Shape(format!(
                "{} samples given, model has {}",
                samples.len(),
                self.num_samples()
            )));
        }
        samples
            .iter()
            .enumerate()
            .map(|(v, s)| self.align(v, s.coords()))
            .collect()
    }

    /// Outcome layer at template coordinates
    pub fn predict_feature(&self, aligned: &Array2<f64>) -> Result<FeaturePrediction> {
        let g_nd = aligned.to_tensor(self.dtype(), self.device())?;
        self.check_coords(&g_nd)?;

        let (mean_np, var_np) = self.outcome().predict(&g_nd)?;
        Ok(FeaturePrediction {
            mean: Array2::from_tensor(&mean_np.detach())?,
            var: Array2::from_tensor(&var_np.detach())?,
        })
    }

    /// Current kernel, mean-function and noise parameters
    pub fn hyperparameters(&self) -> Result<HyperparameterSummary> {
        let mut warps = Vec::with_capacity(self.num_samples());

        for (warp, id) in self.warps().iter().zip(self.sample_ids()) {
            let summary = match warp {
                SampleWarp::Reference => WarpSummary {
                    sample: id.clone(),
                    reference: true,
                    kernel: None,
                    affine_weight: None,
                    affine_bias: None,
                },
                SampleWarp::Warped(layer) => {
                    let (affine_weight, affine_bias) = match layer.affine() {
                        Some(affine) => (
                            Some(host_matrix(affine.weight())?),
                            Some(to_host_vec(affine.bias())?),
                        ),
                        None => (None, None),
                    };
                    WarpSummary {
                        sample: id.clone(),
                        reference: false,
                        kernel: Some(KernelSummary::from_kernel(layer.gp().kernel())?),
                        affine_weight,
                        affine_bias,
                    }
                }
            };
            warps.push(summary);
        }

        Ok(HyperparameterSummary {
            warps,
            outcome_kernel: KernelSummary::from_kernel(self.outcome().kernel())?,
            noise_variance: to_host_vec(&self.noise_variance_tensor()?)?,
        })
    }
}
