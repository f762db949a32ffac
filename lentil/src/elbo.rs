//! Joint evidence lower bound over all samples.
//!
//! ```text
//! ELBO = Σ_v (n_v / b_v) Σ_{i ∈ B_v} E_q[log N(y_i | f(g_v(x_i)), τ_v²)]
//!        - Σ_v KL(q(u_v) || p(u_v)) - KL(q(u_f) || p(u_f))
//! ```

use crate::convert::ConvertTensorOps;
use crate::error::{AlignError, Result};
use crate::minibatch::Minibatch;
use crate::model::WarpAlignModel;
use crate::sample::Sample;
use crate::sampling::standard_normal;

use candle_core::Tensor;
use candle_util::candle_linalg::to_host_scalar;
use candle_util::candle_loss_functions::gaussian_expected_log_likelihood;
use rand::rngs::StdRng;

/// Per-sample coordinates and features resident on the model's device
pub struct TrainingData {
    coords: Vec<Tensor>,
    features: Vec<Tensor>,
}

impl TrainingData {
    /// `samples` must be the ones the model was built from, in order
    pub fn new(model: &WarpAlignModel, samples: &[Sample]) -> Result<Self> {
        if samples.len() != model.num_samples() {
            return Err(AlignError::Shape(format!(
                "{} samples given, model has {}",
                samples.len(),
                model.num_samples()
            )));
        }

        let mut coords = Vec::with_capacity(samples.len());
        let mut features = Vec::with_capacity(samples.len());

        for (v, s) in samples.iter().enumerate() {
            if s.id() != model.sample_ids()[v]
                || s.num_locations() != model.sample_sizes()[v]
                || s.dim_coord() != model.dim_coord()
                || s.dim_feature() != model.dim_feature()
            {
                return Err(AlignError::Shape(format!(
                    "sample {} ({}) does not match the model's sample {} ({})",
                    v,
                    s.id(),
                    v,
                    model.sample_ids()[v]
                )));
            }
            coords.push(s.coords().to_tensor(model.dtype(), model.device())?);
            features.push(s.features().to_tensor(model.dtype(), model.device())?);
        }

        Ok(Self { coords, features })
    }

    pub fn num_samples(&self) -> usize {
        self.coords.len()
    }
}

/// Scalar terms of one evaluation, still on the graph
pub struct ElboTerms {
    pub elbo: Tensor,
    pub expected_log_lik: Tensor,
    pub kl_warp: Tensor,
    pub kl_outcome: Tensor,
}

/// Host copies of [`ElboTerms`]
#[derive(Clone, Copy, Debug)]
pub struct ElboValues {
    pub elbo: f64,
    pub expected_log_lik: f64,
    pub kl_warp: f64,
    pub kl_outcome: f64,
}

impl ElboTerms {
    /// Negative ELBO, the quantity minimized
    pub fn loss(&self) -> Result<Tensor> {
        Ok(self.elbo.neg()?)
    }

    pub fn values(&self) -> Result<ElboValues> {
        Ok(ElboValues {
            elbo: to_host_scalar(&self.elbo)?,
            expected_log_lik: to_host_scalar(&self.expected_log_lik)?,
            kl_warp: to_host_scalar(&self.kl_warp)?,
            kl_outcome: to_host_scalar(&self.kl_outcome)?,
        })
    }
}

/// Evaluate the joint ELBO on one minibatch per sample
///
/// * `model` - the alignment model
/// * `data` - resident training data
/// * `batches` - at most one minibatch per sample
/// * `rng` - reparameterized draws of the aligned coordinates; `None`
///   feeds the warp means, which makes the estimate deterministic
pub fn joint_elbo(
    model: &WarpAlignModel,
    data: &TrainingData,
    batches: &[Minibatch],
    mut rng: Option<&mut StdRng>,
) -> Result<ElboTerms> {
    let dtype = model.dtype();
    let dev = model.device();
    let zero = Tensor::zeros((), dtype, dev)?;

    if let Some(mb) = batches.iter().find(|mb| mb.sample >= model.num_samples()) {
        return Err(AlignError::Shape(format!(
            "minibatch for sample {} of {}",
            mb.sample,
            model.num_samples()
        )));
    }

    // all warp KL terms, whether or not the sample is in this step
    let mut kl_warp = zero.clone();
    let mut aligned = Vec::with_capacity(batches.len());

    for (v, warp) in model.warps().iter().enumerate() {
        let batch: Vec<&Minibatch> = batches.iter().filter(|mb| mb.sample == v).collect();
        if batch.len() > 1 {
            return Err(AlignError::Shape(format!(
                "{} minibatches for sample {}",
                batch.len(),
                v
            )));
        }

        match batch.first() {
            Some(mb) => {
                let rows = Tensor::from_vec(mb.indices.clone(), mb.len(), dev)?;
                let x_nd = data.coords[v].index_select(&rows, 0)?;

                let eps_nd = match rng.as_deref_mut() {
                    Some(rng) if !warp.is_reference() => {
                        Some(standard_normal(rng, (mb.len(), model.dim_coord()), dtype, dev)?)
                    }
                    _ => None,
                };
                let draw = model.warp_draw(v, &x_nd, eps_nd.as_ref())?;
                aligned.push((*mb, rows, draw.aligned_nd));

                if let Some(kl) = draw.kl {
                    kl_warp = (kl_warp + kl)?;
                }
            }
            None => {
                if let Some(layer) = warp.layer() {
                    kl_warp = (kl_warp + layer.gp().posterior()?.kl_term()?)?;
                }
            }
        }
    }

    if aligned.is_empty() {
        return Err(AlignError::Shape("no minibatch to evaluate".into()));
    }

    // one factorization and one prediction for every sample's points
    let outcome = model.outcome().posterior()?;
    let g_all = Tensor::cat(&aligned.iter().map(|(_, _, g)| g).collect::<Vec<_>>(), 0)?;
    let (mean_all, var_all) = outcome.predict(&g_all)?;

    let tau2_v = model.noise_variance_tensor()?;
    let mut expected_log_lik = zero;
    let mut offset = 0;

    for (mb, rows, _) in aligned.iter() {
        let b = mb.len();
        let y_np = data.features[mb.sample].index_select(rows, 0)?;
        let mean_np = mean_all.narrow(0, offset, b)?;
        let var_np = var_all.narrow(0, offset, b)?;
        let tau2 = tau2_v.narrow(0, mb.sample, 1)?;

        let llik = gaussian_expected_log_likelihood(&y_np, &mean_np, &var_np, &tau2)?.sum_all()?;
        expected_log_lik = (expected_log_lik + (llik * mb.scale)?)?;
        offset += b;
    }

    let kl_outcome = outcome.kl_term()?;
    let elbo = ((&expected_log_lik - &kl_warp)? - &kl_outcome)?;

    Ok(ElboTerms {
        elbo,
        expected_log_lik,
        kl_warp,
        kl_outcome,
    })
}
