use crate::error::{AlignError, Result};
use rand::rngs::StdRng;

/// Locations of one sample used in a step, with the factor that makes
/// their log-likelihood an unbiased estimate of the full-sample sum
#[derive(Clone, Debug)]
pub struct Minibatch {
    pub sample: usize,
    pub indices: Vec<u32>,
    /// n_v / b_v
    pub scale: f64,
}

impl Minibatch {
    /// * `sample` - sample index
    /// * `indices` - chosen rows, all below `total`
    /// * `total` - number of locations in the sample
    pub fn new(sample: usize, indices: Vec<u32>, total: usize) -> Result<Self> {
        if indices.is_empty() || indices.len() > total {
            return Err(AlignError::Shape(format!(
                "minibatch of {} from {} locations",
                indices.len(),
                total
            )));
        }
        if let Some(&bad) = indices.iter().find(|&&i| i as usize >= total) {
            return Err(AlignError::Shape(format!(
                "location {} out of range for {} locations",
                bad, total
            )));
        }
        let scale = total as f64 / indices.len() as f64;
        Ok(Self {
            sample,
            indices,
            scale,
        })
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// Draws one minibatch per sample and step
///
/// Every sample contributes min(batch_size, n_v) locations sampled
/// without replacement; a sample smaller than the batch is used whole.
pub struct MinibatchSampler {
    sizes: Vec<usize>,
    batch_size: Option<usize>,
}

impl MinibatchSampler {
    pub fn new(sizes: &[usize], batch_size: Option<usize>) -> Self {
        Self {
            sizes: sizes.to_vec(),
            batch_size,
        }
    }

    pub fn is_full_batch(&self) -> bool {
        match self.batch_size {
            None => true,
            Some(b) => self.sizes.iter().all(|&n| n <= b),
        }
    }

    pub fn full(&self) -> Result<Vec<Minibatch>> {
        self.sizes
            .iter()
            .enumerate()
            .map(|(v, &n)| Minibatch::new(v, (0..n as u32).collect(), n))
            .collect()
    }

    pub fn draw(&self, rng: &mut StdRng) -> Result<Vec<Minibatch>> {
        let batch_size = match self.batch_size {
            Some(b) if !self.is_full_batch() => b,
            _ => return self.full(),
        };

        self.sizes
            .iter()
            .enumerate()
            .map(|(v, &n)| {
                if n <= batch_size {
                    return Minibatch::new(v, (0..n as u32).collect(), n);
                }
                let mut rows: Vec<u32> = rand::seq::index::sample(&mut *rng, n, batch_size)
                    .into_iter()
                    .map(|i| i as u32)
                    .collect();
                rows.sort_unstable();
                Minibatch::new(v, rows, n)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn each_sample_scales_by_its_own_size() -> anyhow::Result<()> {
        let sampler = MinibatchSampler::new(&[100, 30, 10], Some(20));
        let mut rng = StdRng::seed_from_u64(1);
        let batches = sampler.draw(&mut rng)?;

        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].len(), 20);
        approx::assert_abs_diff_eq!(batches[0].scale, 5.0);
        approx::assert_abs_diff_eq!(batches[1].scale, 1.5);
        // smaller than the batch: used whole
        assert_eq!(batches[2].len(), 10);
        approx::assert_abs_diff_eq!(batches[2].scale, 1.0);

        for mb in batches.iter() {
            let mut uniq = mb.indices.clone();
            uniq.dedup();
            assert_eq!(uniq.len(), mb.len(), "drawn without replacement");
        }
        Ok(())
    }

    #[test]
    fn full_batch_when_unset() -> anyhow::Result<()> {
        let sampler = MinibatchSampler::new(&[4, 7], None);
        assert!(sampler.is_full_batch());
        let batches = sampler.draw(&mut StdRng::seed_from_u64(0))?;
        assert_eq!(batches[1].indices, (0..7).collect::<Vec<u32>>());
        approx::assert_abs_diff_eq!(batches[1].scale, 1.0);
        Ok(())
    }

    #[test]
    fn rejects_bad_indices() {
        assert!(Minibatch::new(0, vec![], 3).is_err());
        assert!(Minibatch::new(0, vec![0, 3], 3).is_err());
    }
}
