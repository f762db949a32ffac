use crate::error::{AlignError, Result};
use crate::sample::Sample;
use log::info;
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal, Uniform};

pub struct SimArgs {
    pub num_samples: usize,
    pub num_locations: usize,
    pub num_features: usize,
    /// sample v is rotated by v * rotation_deg around the square's centre
    pub rotation_deg: f64,
    /// sample v is shifted by v * translation along the first axis
    pub translation: f64,
    pub coord_noise: f64,
    pub feature_noise: f64,
    /// plane waves per feature field
    pub num_waves: usize,
    pub rseed: u64,
}

impl Default for SimArgs {
    fn default() -> Self {
        Self {
            num_samples: 2,
            num_locations: 200,
            num_features: 5,
            rotation_deg: 15.0,
            translation: 0.0,
            coord_noise: 0.0,
            feature_noise: 0.05,
            num_waves: 3,
            rseed: 42,
        }
    }
}

pub struct SimOut {
    pub samples: Vec<Sample>,
    /// true template location of every observed location
    pub template_coords: Vec<Array2<f64>>,
    pub angles_deg: Vec<f64>,
}

/// Smooth random field: Σ_j a_j cos(2π ω_j·t + φ_j)
struct WaveField {
    amplitude: Vec<f64>,
    omega: Vec<[f64; 2]>,
    phase: Vec<f64>,
}

impl WaveField {
    fn sample(num_waves: usize, rng: &mut StdRng) -> Result<Self> {
        let amp = Normal::new(0.0, 1.0 / (num_waves as f64).sqrt())
            .map_err(|e| AlignError::Config(e.to_string()))?;
        // at most 1.5 cycles across the unit square
        let freq = Uniform::new(-1.5, 1.5).map_err(|e| AlignError::Config(e.to_string()))?;
        let phase = Uniform::new(0.0, 2.0 * std::f64::consts::PI)
            .map_err(|e| AlignError::Config(e.to_string()))?;

        Ok(Self {
            amplitude: (0..num_waves).map(|_| amp.sample(rng)).collect(),
            omega: (0..num_waves)
                .map(|_| [freq.sample(rng), freq.sample(rng)])
                .collect(),
            phase: (0..num_waves).map(|_| phase.sample(rng)).collect(),
        })
    }

    fn eval(&self, t: &[f64; 2]) -> f64 {
        (0..self.amplitude.len())
            .map(|j| {
                let w = &self.omega[j];
                let arg = 2.0 * std::f64::consts::PI * (w[0] * t[0] + w[1] * t[1]) + self.phase[j];
                self.amplitude[j] * arg.cos()
            })
            .sum()
    }
}

/// Rotated, shifted and noisy copies of one smooth 2-D template
///
/// ```text
/// t ~ U[0,1]²,   x_v = R(θ_v)(t - c) + c + (v δ, 0) + e,   y_v = f(t) + η
/// ```
///
/// Every sample draws its own template locations; sample 0 is not
/// rotated or shifted.
pub fn generate_rotated_samples(args: &SimArgs) -> Result<SimOut> {
    if args.num_samples == 0 || args.num_locations == 0 || args.num_features == 0 || args.num_waves == 0 {
        return Err(AlignError::Config(
            "samples, locations, features and waves must all be positive".into(),
        ));
    }

    let mut rng = StdRng::seed_from_u64(args.rseed);

    let coord_noise =
        Normal::new(0.0, args.coord_noise).map_err(|e| AlignError::Config(e.to_string()))?;
    let feature_noise =
        Normal::new(0.0, args.feature_noise).map_err(|e| AlignError::Config(e.to_string()))?;
    let runif = Uniform::new(0.0, 1.0).map_err(|e| AlignError::Config(e.to_string()))?;

    let fields = (0..args.num_features)
        .map(|_| WaveField::sample(args.num_waves, &mut rng))
        .collect::<Result<Vec<_>>>()?;

    let nn = args.num_locations;
    let mut samples = Vec::with_capacity(args.num_samples);
    let mut template_coords = Vec::with_capacity(args.num_samples);
    let mut angles_deg = Vec::with_capacity(args.num_samples);

    for v in 0..args.num_samples {
        let angle = args.rotation_deg * v as f64;
        let (sin, cos) = angle.to_radians().sin_cos();
        let shift = Array1::from(vec![args.translation * v as f64, 0.0]);

        let t = Array2::from_shape_fn((nn, 2), |_| runif.sample(&mut rng));

        let mut x = Array2::<f64>::zeros((nn, 2));
        for (i, row) in t.rows().into_iter().enumerate() {
            let (a, b) = (row[0] - 0.5, row[1] - 0.5);
            x[[i, 0]] = cos * a - sin * b + 0.5 + shift[0] + coord_noise.sample(&mut rng);
            x[[i, 1]] = sin * a + cos * b + 0.5 + shift[1] + coord_noise.sample(&mut rng);
        }

        let mut y = Array2::<f64>::zeros((nn, args.num_features));
        for i in 0..nn {
            let ti = [t[[i, 0]], t[[i, 1]]];
            for (p, field) in fields.iter().enumerate() {
                y[[i, p]] = field.eval(&ti) + feature_noise.sample(&mut rng);
            }
        }

        samples.push(Sample::new(format!("sample_{}", v), x, y)?);
        template_coords.push(t);
        angles_deg.push(angle);
    }

    info!(
        "simulated {} samples x {} locations x {} features",
        args.num_samples, nn, args.num_features
    );

    Ok(SimOut {
        samples,
        template_coords,
        angles_deg,
    })
}

/// Mean squared distance between matched rows
pub fn mean_squared_distance(a: &Array2<f64>, b: &Array2<f64>) -> Result<f64> {
    if a.dim() != b.dim() || a.nrows() == 0 {
        return Err(AlignError::Shape(format!(
            "cannot compare {:?} with {:?}",
            a.dim(),
            b.dim()
        )));
    }
    Ok((a - b).mapv(|d| d * d).sum() / a.nrows() as f64)
}
