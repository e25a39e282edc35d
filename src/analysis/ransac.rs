//! Generic, model-agnostic RANSAC.
//!
//! Implement [`Estimator`] for a model and call [`ransac`] with the data, a
//! [`RansacOptions`] and a random source. When no consensus is found the
//! result has `success == false` and `model == None`; the function never
//! panics on degenerate input.

use rand::seq::SliceRandom;
use rand::Rng;

/// Configuration parameters for the RANSAC loop
#[derive(Debug, Clone)]
pub struct RansacOptions {
    /// Maximum number of sampling rounds
    pub max_iters: usize,
    /// Inlier residual threshold
    pub thresh: f64,
    /// Minimum number of inliers required to accept a model
    pub min_inliers: usize,
    /// Desired confidence in `[0, 1]`; shortens the loop once a good model is seen
    pub confidence: f64,
    /// Refit on the consensus set before scoring
    pub refit_on_inliers: bool,
}

impl Default for RansacOptions {
    fn default() -> Self {
        Self {
            max_iters: 1000,
            thresh: 1.0,
            min_inliers: 2,
            confidence: 0.99,
            refit_on_inliers: true,
        }
    }
}

/// Output of a RANSAC run
#[derive(Debug, Clone)]
pub struct RansacResult<M> {
    pub success: bool,
    pub model: Option<M>,
    /// Indices of inlier data points
    pub inliers: Vec<usize>,
    /// Root-mean-square residual over inliers
    pub inlier_rms: f64,
    pub iters: usize,
}

impl<M> Default for RansacResult<M> {
    fn default() -> Self {
        Self {
            success: false,
            model: None,
            inliers: Vec::new(),
            inlier_rms: f64::INFINITY,
            iters: 0,
        }
    }
}

/// A model that can be fitted from a minimal sample
pub trait Estimator {
    type Datum;
    type Model;

    /// Minimal number of samples needed to estimate a model
    const MIN_SAMPLES: usize;

    /// Fit from a subset of data indices; `None` if the subset is degenerate
    fn fit(data: &[Self::Datum], sample_indices: &[usize]) -> Option<Self::Model>;

    /// Non-negative residual in the same units as [`RansacOptions::thresh`]
    fn residual(model: &Self::Model, datum: &Self::Datum) -> f64;

    fn is_degenerate(_data: &[Self::Datum], _sample_indices: &[usize]) -> bool {
        false
    }

    /// Refit on a full inlier set. Default: keep the minimal-sample model.
    fn refit(_data: &[Self::Datum], _inliers: &[usize]) -> Option<Self::Model> {
        None
    }
}

fn rms(vals: &[f64]) -> f64 {
    if vals.is_empty() {
        return f64::INFINITY;
    }
    let ss: f64 = vals.iter().map(|&v| v * v).sum();
    (ss / vals.len() as f64).sqrt()
}

/// Adaptive iteration bound from the best inlier ratio seen so far
fn calculate_iterations(
    confidence: f64,
    inlier_ratio: f64,
    min_samples: usize,
    iters_so_far: usize,
    max_iters: usize,
) -> usize {
    if confidence <= 0.0 || inlier_ratio <= 0.0 {
        return max_iters;
    }

    let denom = (1.0 - inlier_ratio.powf(min_samples as f64)).max(1e-12).ln();
    if denom >= 0.0 {
        return max_iters;
    }

    let n_iter = ((1.0 - confidence).ln() / denom).ceil() as usize;
    n_iter.clamp(iters_so_far, max_iters)
}

fn inliers_of<E: Estimator>(
    data: &[E::Datum],
    model: &E::Model,
    thresh: f64,
    inliers: &mut Vec<usize>,
    residuals: &mut Vec<f64>,
) {
    inliers.clear();
    residuals.clear();
    for (i, datum) in data.iter().enumerate() {
        let r = E::residual(model, datum);
        if r <= thresh {
            inliers.push(i);
            residuals.push(r);
        }
    }
}

/// Run RANSAC for an [`Estimator`]
pub fn ransac<E, R>(data: &[E::Datum], opts: &RansacOptions, rng: &mut R) -> RansacResult<E::Model>
where
    E: Estimator,
    R: Rng + ?Sized,
{
    let mut best: RansacResult<E::Model> = RansacResult::default();
    if data.len() < E::MIN_SAMPLES {
        return best;
    }

    let all_indices: Vec<usize> = (0..data.len()).collect();
    let mut sample = vec![0usize; E::MIN_SAMPLES];

    let mut inliers = Vec::with_capacity(data.len());
    let mut residuals = Vec::with_capacity(data.len());

    let mut dynamic_max_iters = opts.max_iters;
    let mut num_iters = 0;
    while num_iters < dynamic_max_iters {
        num_iters += 1;
        for (k, &idx) in all_indices.choose_multiple(rng, E::MIN_SAMPLES).enumerate() {
            sample[k] = idx;
        }

        if E::is_degenerate(data, &sample) {
            continue;
        }
        let Some(mut model) = E::fit(data, &sample) else {
            continue;
        };

        inliers_of::<E>(data, &model, opts.thresh, &mut inliers, &mut residuals);
        if inliers.len() < opts.min_inliers {
            continue;
        }

        if opts.refit_on_inliers {
            if let Some(refit) = E::refit(data, &inliers) {
                model = refit;
                inliers_of::<E>(data, &model, opts.thresh, &mut inliers, &mut residuals);
                if inliers.len() < opts.min_inliers {
                    continue;
                }
            }
        }

        let inlier_rms = rms(&residuals);
        let better = !best.success
            || inliers.len() > best.inliers.len()
            || (inliers.len() == best.inliers.len() && inlier_rms < best.inlier_rms);
        if better {
            best.success = true;
            best.model = Some(model);
            best.inliers = inliers.clone();
            best.inlier_rms = inlier_rms;
            best.iters = num_iters;
        }

        dynamic_max_iters = calculate_iterations(
            opts.confidence,
            best.inliers.len() as f64 / data.len() as f64,
            E::MIN_SAMPLES,
            num_iters,
            opts.max_iters,
        );
    }

    best
}
