use crate::config::InducingInit;
use crate::error::{AlignError, Result};
use log::debug;
use ndarray::{Array2, Axis};
use rand::rngs::StdRng;

/// Initial inducing locations for one layer
///
/// * `init` - strategy
/// * `coords` - data locations (n x D) the layer sees
/// * `m` - number of inducing points
/// * `rng` - used by [`InducingInit::Random`]
pub fn init_inducing(
    init: &InducingInit,
    coords: &Array2<f64>,
    m: usize,
    rng: &mut StdRng,
) -> Result<Array2<f64>> {
    let z = match init {
        InducingInit::Grid => quantile_grid(coords, m)?,
        InducingInit::Random => random_subset(coords, m, rng)?,
        InducingInit::Explicit(z) => {
            if z.dim() != (m, coords.ncols()) {
                return Err(AlignError::Shape(format!(
                    "explicit inducing points are {:?}, expected ({}, {})",
                    z.dim(),
                    m,
                    coords.ncols()
                )));
            }
            z.clone()
        }
    };
    debug!("initialized {} x {} inducing points ({:?})", z.nrows(), z.ncols(), kind(init));
    Ok(z)
}

fn kind(init: &InducingInit) -> &'static str {
    match init {
        InducingInit::Grid => "grid",
        InducingInit::Random => "random",
        InducingInit::Explicit(_) => "explicit",
    }
}

/// Evenly thinned product grid of per-dimension quantiles
///
/// With k the smallest integer such that k^D ≥ m, each dimension gets
/// the quantiles at (i + 0.5) / k, i = 0..k, and m of the k^D grid
/// points are kept at evenly spaced positions.
pub fn quantile_grid(coords: &Array2<f64>, m: usize) -> Result<Array2<f64>> {
    let (n, d) = coords.dim();
    if n == 0 || d == 0 || m == 0 {
        return Err(AlignError::Shape(format!(
            "cannot place {} grid points over {} x {} coordinates",
            m, n, d
        )));
    }

    let mut k = 1_usize;
    while k.checked_pow(d as u32).is_some_and(|kd| kd < m) {
        k += 1;
    }
    let total = k
        .checked_pow(d as u32)
        .ok_or_else(|| AlignError::Config(format!("grid of {}^{} points overflows", k, d)))?;

    let levels: Vec<Vec<f64>> = coords
        .axis_iter(Axis(1))
        .map(|col| {
            let mut sorted: Vec<f64> = col.to_vec();
            sorted.sort_by(|a, b| a.total_cmp(b));
            (0..k)
                .map(|i| quantile(&sorted, (i as f64 + 0.5) / k as f64))
                .collect()
        })
        .collect();

    let mut z = Array2::<f64>::zeros((m, d));
    for (j, mut row) in z.axis_iter_mut(Axis(0)).enumerate() {
        // j-th of m evenly spaced grid positions, digits in base k
        let mut g = j * total / m;
        for (c, level) in levels.iter().enumerate() {
            row[c] = level[g % k];
            g /= k;
        }
    }
    Ok(z)
}

/// Linear interpolation between order statistics
fn quantile(sorted: &[f64], q: f64) -> f64 {
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = (lo + 1).min(sorted.len() - 1);
    sorted[lo] + (pos - lo as f64) * (sorted[hi] - sorted[lo])
}

/// `m` distinct data rows chosen uniformly at random
pub fn random_subset(coords: &Array2<f64>, m: usize, rng: &mut StdRng) -> Result<Array2<f64>> {
    let n = coords.nrows();
    if m == 0 || m > n {
        return Err(AlignError::Config(format!(
            "cannot pick {} inducing points from {} locations",
            m, n
        )));
    }
    let mut rows = rand::seq::index::sample(rng, n, m).into_vec();
    rows.sort_unstable();
    Ok(coords.select(Axis(0), &rows))
}
