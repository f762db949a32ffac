use candle_core::{DType, Device, Result, Tensor};
use rand::rngs::StdRng;
use rand_distr::{Distribution, StandardNormal};

/// ε ~ N(0, I) drawn on the host from a seeded generator
pub fn standard_normal(
    rng: &mut StdRng,
    shape: (usize, usize),
    dtype: DType,
    dev: &Device,
) -> Result<Tensor> {
    let eps: Vec<f64> = (0..shape.0 * shape.1)
        .map(|_| StandardNormal.sample(rng))
        .collect();
    Tensor::from_vec(eps, shape, &Device::Cpu)?
        .to_dtype(dtype)?
        .to_device(dev)
}

/// mean + ε * sqrt(var), differentiable in `mean` and `var`
pub fn reparameterize(mean: &Tensor, var: &Tensor, eps: &Tensor) -> Result<Tensor> {
    mean + eps.mul(&var.sqrt()?)?
}
