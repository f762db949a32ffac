use crate::error::Result;
use candle_core::Tensor;
use candle_util::candle_svgp::SvgpLayer;

/// x W + b
#[derive(Clone, Debug)]
pub struct AffineMean {
    weight_dd: Tensor,
    bias_1d: Tensor,
}

impl AffineMean {
    pub fn new(weight_dd: Tensor, bias_1d: Tensor) -> Self {
        Self { weight_dd, bias_1d }
    }

    pub fn forward(&self, x_nd: &Tensor) -> Result<Tensor> {
        Ok(x_nd.matmul(&self.weight_dd)?.broadcast_add(&self.bias_1d)?)
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight_dd
    }

    pub fn bias(&self) -> &Tensor {
        &self.bias_1d
    }
}

/// g(x) = m(x) + f(x) with a D-output SVGP f
#[derive(Clone, Debug)]
pub struct WarpLayer {
    gp: SvgpLayer,
    affine: Option<AffineMean>,
}

/// Aligned coordinate distribution of a batch plus the layer's KL
pub struct WarpEval {
    pub mean_nd: Tensor,
    pub var_nd: Tensor,
    pub kl: Option<Tensor>,
}

impl WarpLayer {
    pub fn new(gp: SvgpLayer, affine: Option<AffineMean>) -> Self {
        Self { gp, affine }
    }

    pub fn gp(&self) -> &SvgpLayer {
        &self.gp
    }

    pub fn affine(&self) -> Option<&AffineMean> {
        self.affine.as_ref()
    }

    fn mean_function(&self, x_nd: &Tensor) -> Result<Tensor> {
        match &self.affine {
            Some(affine) => affine.forward(x_nd),
            None => Ok(x_nd.clone()),
        }
    }

    /// Marginal mean and variance of g(x)
    pub fn predict(&self, x_nd: &Tensor) -> Result<(Tensor, Tensor)> {
        let (delta_nd, var_nd) = self.gp.posterior()?.predict(x_nd)?;
        Ok(((self.mean_function(x_nd)? + delta_nd)?, var_nd))
    }

    /// Prediction and KL sharing one Cholesky factorization
    pub fn evaluate(&self, x_nd: &Tensor) -> Result<WarpEval> {
        let post = self.gp.posterior()?;
        let (delta_nd, var_nd) = post.predict(x_nd)?;
        Ok(WarpEval {
            mean_nd: (self.mean_function(x_nd)? + delta_nd)?,
            var_nd,
            kl: Some(post.kl_term()?),
        })
    }
}

/// How one sample's observed coordinates reach the template
#[derive(Clone, Debug)]
pub enum SampleWarp {
    /// observed coordinates are template coordinates
    Reference,
    Warped(WarpLayer),
}

impl SampleWarp {
    pub fn is_reference(&self) -> bool {
        matches!(self, SampleWarp::Reference)
    }

    pub fn layer(&self) -> Option<&WarpLayer> {
        match self {
            SampleWarp::Reference => None,
            SampleWarp::Warped(layer) => Some(layer),
        }
    }

    pub fn predict(&self, x_nd: &Tensor) -> Result<(Tensor, Tensor)> {
        match self {
            SampleWarp::Reference => Ok((x_nd.clone(), x_nd.zeros_like()?)),
            SampleWarp::Warped(layer) => layer.predict(x_nd),
        }
    }

    pub fn evaluate(&self, x_nd: &Tensor) -> Result<WarpEval> {
        match self {
            SampleWarp::Reference => Ok(WarpEval {
                mean_nd: x_nd.clone(),
                var_nd: x_nd.zeros_like()?,
                kl: None,
            }),
            SampleWarp::Warped(layer) => layer.evaluate(x_nd),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::{VarBuilder, VarMap};
    use candle_util::candle_kernels::{Kernel, KernelKind};

    fn layer(affine: Option<AffineMean>, dev: &Device) -> anyhow::Result<WarpLayer> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F64, dev);
        let z = Tensor::from_vec(vec![0.0f64, 0.0, 1.0, 0.0, 0.0, 1.0, 1.0, 1.0], (4, 2), dev)?;
        let kernel = Kernel::new(KernelKind::Matern52, 1.0, 0.1, vb.pp("kernel"))?;
        let gp = SvgpLayer::new(kernel, z, 2, true, 1e-6, 0.1, vb)?;
        Ok(WarpLayer::new(gp, affine))
    }

    #[test]
    fn fresh_warp_is_the_mean_function() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let x = Tensor::from_vec(vec![0.3f64, 0.4, 0.9, 0.1, -0.2, 0.5], (3, 2), &dev)?;

        let identity = layer(None, &dev)?;
        let (mean, var) = identity.predict(&x)?;
        let diff = (mean - &x)?.abs()?.sum_all()?.to_scalar::<f64>()?;
        approx::assert_abs_diff_eq!(diff, 0.0, epsilon = 1e-12);
        assert!(var.flatten_all()?.max(0)?.to_scalar::<f64>()? < 0.1);

        let w = Tensor::from_vec(vec![0.0f64, -1.0, 1.0, 0.0], (2, 2), &dev)?;
        let b = Tensor::from_vec(vec![1.0f64, 2.0], (1, 2), &dev)?;
        let rotated = layer(Some(AffineMean::new(w.clone(), b.clone())), &dev)?;
        let eval = rotated.evaluate(&x)?;
        let expected = x.matmul(&w)?.broadcast_add(&b)?;
        let diff = (eval.mean_nd - expected)?.abs()?.sum_all()?.to_scalar::<f64>()?;
        approx::assert_abs_diff_eq!(diff, 0.0, epsilon = 1e-12);
        assert!(eval.kl.is_some());
        Ok(())
    }

    #[test]
    fn reference_passes_through() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let x = Tensor::from_vec(vec![0.3f64, 0.4, 0.9, 0.1], (2, 2), &dev)?;
        let eval = SampleWarp::Reference.evaluate(&x)?;
        assert_eq!(eval.mean_nd.to_vec2::<f64>()?, x.to_vec2::<f64>()?);
        assert_eq!(eval.var_nd.sum_all()?.to_scalar::<f64>()?, 0.0);
        assert!(eval.kl.is_none());
        Ok(())
    }
}
