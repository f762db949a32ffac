use crate::error::{AlignError, Result};
use ndarray::Array2;

/// One spatial sample: observed locations and the features measured
/// there. Rows of `coords` and `features` refer to the same location.
#[derive(Clone, Debug)]
pub struct Sample {
    id: String,
    coords: Array2<f64>,
    features: Array2<f64>,
}

impl Sample {
    /// * `id` - sample name
    /// * `coords` - observed coordinates (n x D)
    /// * `features` - feature values (n x P)
    pub fn new(id: impl Into<String>, coords: Array2<f64>, features: Array2<f64>) -> Result<Self> {
        let id = id.into();
        let (n, d) = coords.dim();
        let (n_feat, p) = features.dim();

        if n == 0 || d == 0 || p == 0 {
            return Err(AlignError::Shape(format!(
                "sample {}: empty coordinates ({} x {}) or features ({} x {})",
                id, n, d, n_feat, p
            )));
        }

        if n != n_feat {
            return Err(AlignError::Shape(format!(
                "sample {}: {} coordinate rows vs. {} feature rows",
                id, n, n_feat
            )));
        }

        if coords.iter().chain(features.iter()).any(|x| !x.is_finite()) {
            return Err(AlignError::NonFinite {
                what: format!("input values in sample {}", id),
            });
        }

        Ok(Self {
            id,
            coords,
            features,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn coords(&self) -> &Array2<f64> {
        &self.coords
    }

    pub fn features(&self) -> &Array2<f64> {
        &self.features
    }

    pub fn num_locations(&self) -> usize {
        self.coords.nrows()
    }

    pub fn dim_coord(&self) -> usize {
        self.coords.ncols()
    }

    pub fn dim_feature(&self) -> usize {
        self.features.ncols()
    }
}

/// Check that all samples share coordinate and feature dimensions
///
/// # Returns `(D, P)`
pub fn shared_dims(samples: &[Sample]) -> Result<(usize, usize)> {
    let first = samples
        .first()
        .ok_or_else(|| AlignError::Shape("no samples".into()))?;

    let (d, p) = (first.dim_coord(), first.dim_feature());

    for s in samples.iter().skip(1) {
        if s.dim_coord() != d || s.dim_feature() != p {
            return Err(AlignError::Shape(format!(
                "sample {} has {} coordinate and {} feature columns; expected {} and {}",
                s.id(),
                s.dim_coord(),
                s.dim_feature(),
                d,
                p
            )));
        }
    }

    Ok((d, p))
}
