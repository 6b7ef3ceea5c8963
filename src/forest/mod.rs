//! Isolation Forest - Unsupervised anomaly scoring by isolation depth
//!
//! Points that are easy to isolate with random axis-aligned splits sit on
//! short paths and score high; typical points need many splits.
//!
//! ## Architecture
//!
//! - `IsolationTree`: node arena built from one subsample
//! - `IsolationForest`: ordered ensemble, average path length, raw score
//! - `ScoreCalibration`: logistic map from raw score to [0, 100], anchored
//!   on the training score distribution
//! - `ForestModel`: forest plus standardization statistics and calibration
//!
//! ## Determinism
//!
//! Tree `i` draws from its own `StdRng` seeded from `(seed, i)`, so trees are
//! built in parallel with rayon and still come out bit-identical for a given
//! seed regardless of thread count.

mod tree;

pub use tree::{average_path_length, IsolationTree, Node, Row};

use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use statrs::statistics::{Data, OrderStatistics, Statistics};

use crate::config::defaults::SCORE_SPREAD_FLOOR;
use crate::config::ForestConfig;
use crate::features::{FeatureVector, FEATURE_COUNT};

/// Seed for tree `index` of a forest seeded with `seed`.
fn tree_seed(seed: u64, index: usize) -> u64 {
    seed ^ (index as u64).wrapping_add(1).wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

// ============================================================================
// Forest
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IsolationForest {
    trees: Vec<IsolationTree>,
    /// Effective subsample size ψ used for every tree.
    subsample_size: usize,
}

impl IsolationForest {
    /// Build `n_trees` trees over `rows`. `None` when fewer than two rows.
    pub fn fit(rows: &[Row], n_trees: usize, subsample_size: usize, seed: u64) -> Option<Self> {
        if rows.len() < 2 || n_trees == 0 {
            return None;
        }
        let psi = subsample_size.clamp(2, rows.len());
        let max_depth = (psi as f64).log2().ceil() as usize;

        let trees = (0..n_trees)
            .into_par_iter()
            .map(|i| {
                let mut rng = StdRng::seed_from_u64(tree_seed(seed, i));
                let indices = rand::seq::index::sample(&mut rng, rows.len(), psi).into_vec();
                IsolationTree::build(rows, &indices, max_depth, &mut rng)
            })
            .collect();

        Some(Self {
            trees,
            subsample_size: psi,
        })
    }

    pub(crate) fn from_parts(trees: Vec<IsolationTree>, subsample_size: usize) -> Self {
        Self { trees, subsample_size }
    }

    /// Mean isolation depth E[h(x)] across the ensemble.
    pub fn path_length(&self, x: &Row) -> f64 {
        if self.trees.is_empty() {
            return 0.0;
        }
        self.trees.iter().map(|t| t.path_length(x)).sum::<f64>() / self.trees.len() as f64
    }

    /// `2^(−E[h(x)] / c(ψ))` in (0, 1]. Returns the path length alongside.
    pub fn raw_score(&self, x: &Row) -> (f64, f64) {
        let h = self.path_length(x);
        let c = average_path_length(self.subsample_size);
        let raw = if c > 0.0 { 2f64.powf(-h / c) } else { 1.0 };
        (raw, h)
    }

    pub fn trees(&self) -> &[IsolationTree] {
        &self.trees
    }

    pub fn tree_count(&self) -> usize {
        self.trees.len()
    }

    pub fn subsample_size(&self) -> usize {
        self.subsample_size
    }
}

// ============================================================================
// Score Calibration
// ============================================================================

/// Logistic mapping `100 / (1 + exp(−k·(raw − offset)/spread))`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreCalibration {
    /// Raw score mapped to 50: the (1 − contamination) training quantile
    pub offset: f64,
    /// Population std-dev of raw training scores, floored
    pub spread: f64,
    pub steepness: f64,
}

impl ScoreCalibration {
    pub fn fit(raw_scores: &[f64], contamination: f64, steepness: f64) -> Self {
        let spread = raw_scores.iter().population_std_dev();
        let offset = Data::new(raw_scores.to_vec()).quantile(1.0 - contamination);
        Self {
            offset,
            spread: if spread.is_finite() { spread.max(SCORE_SPREAD_FLOOR) } else { SCORE_SPREAD_FLOOR },
            steepness,
        }
    }

    pub fn map(&self, raw: f64) -> f64 {
        let z = self.steepness * (raw - self.offset) / self.spread;
        (100.0 / (1.0 + (-z).exp())).clamp(0.0, 100.0)
    }

    pub fn is_valid(&self) -> bool {
        self.offset.is_finite() && self.spread.is_finite() && self.spread > 0.0 && self.steepness.is_finite() && self.steepness > 0.0
    }
}

// ============================================================================
// Trained Model
// ============================================================================

/// One scored vector.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ForestScore {
    /// Calibrated score in [0, 100]
    pub score: f64,
    pub raw: f64,
    pub path_length: f64,
}

/// Forest plus everything needed to score raw feature vectors.
#[derive(Debug, Clone, PartialEq)]
pub struct ForestModel {
    pub forest: IsolationForest,
    pub means: Row,
    pub std_devs: Row,
    pub calibration: ScoreCalibration,
}

impl ForestModel {
    /// Standardize `vectors`, build the forest, and calibrate on the training scores.
    ///
    /// `None` when the rows cannot support a forest (fewer than two rows).
    pub fn train(vectors: &[FeatureVector], config: &ForestConfig, seed: u64) -> Option<Self> {
        let (means, std_devs) = column_stats(vectors);
        let rows: Vec<Row> = vectors
            .iter()
            .map(|v| standardize(v.values(), &means, &std_devs))
            .collect();

        let forest = IsolationForest::fit(&rows, config.n_trees, config.subsample_size, seed)?;
        let raw: Vec<f64> = rows.par_iter().map(|r| forest.raw_score(r).0).collect();
        let calibration = ScoreCalibration::fit(&raw, config.contamination, config.score_steepness);

        Some(Self {
            forest,
            means,
            std_devs,
            calibration,
        })
    }

    pub fn score(&self, vector: &FeatureVector) -> ForestScore {
        let row = standardize(vector.values(), &self.means, &self.std_devs);
        let (raw, path_length) = self.forest.raw_score(&row);
        ForestScore {
            score: self.calibration.map(raw),
            raw,
            path_length,
        }
    }
}

/// Per-feature population mean and std-dev.
fn column_stats(vectors: &[FeatureVector]) -> (Row, Row) {
    let mut means = [0.0; FEATURE_COUNT];
    let mut std_devs = [0.0; FEATURE_COUNT];
    for f in 0..FEATURE_COUNT {
        let column: Vec<f64> = vectors.iter().map(|v| v.values()[f]).collect();
        means[f] = column.iter().mean();
        std_devs[f] = column.iter().population_std_dev();
    }
    (means, std_devs)
}

/// Z-score each component; zero-variance features contribute 0.
pub fn standardize(values: &Row, means: &Row, std_devs: &Row) -> Row {
    let mut out = [0.0; FEATURE_COUNT];
    for f in 0..FEATURE_COUNT {
        out[f] = if std_devs[f] > 0.0 {
            (values[f] - means[f]) / std_devs[f]
        } else {
            0.0
        };
    }
    out
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use rand_distr::{Distribution, Normal};

    fn normal_vectors(n: usize, seed: u64) -> Vec<FeatureVector> {
        let mut rng = StdRng::seed_from_u64(seed);
        let pressure = Normal::new(60.0, 2.0).unwrap();
        let flow = Normal::new(40.0, 1.0).unwrap();
        (0..n)
            .map(|_| {
                let mut v = [0.0; FEATURE_COUNT];
                v[0] = pressure.sample(&mut rng);
                v[1] = flow.sample(&mut rng);
                v[2] = rng.gen_range(-0.5..0.5);
                v[8] = v[0] / v[1];
                FeatureVector::new(v)
            })
            .collect()
    }

    fn reading_like(pressure: f64, flow: f64, rate: f64) -> FeatureVector {
        let mut v = [0.0; FEATURE_COUNT];
        v[0] = pressure;
        v[1] = flow;
        v[2] = rate;
        v[8] = pressure / flow;
        FeatureVector::new(v)
    }

    fn with_flow(flow: f64) -> FeatureVector {
        reading_like(60.0, flow, 0.0)
    }

    #[test]
    fn test_fixed_seed_gives_identical_trees() {
        let vectors = normal_vectors(400, 1);
        let config = ForestConfig::default();
        let a = ForestModel::train(&vectors, &config, 99).unwrap();
        let b = ForestModel::train(&vectors, &config, 99).unwrap();
        assert_eq!(a.forest, b.forest);
        assert_eq!(a.calibration, b.calibration);
        let c = ForestModel::train(&vectors, &config, 100).unwrap();
        assert_ne!(a.forest, c.forest);
    }

    #[test]
    fn test_parallel_build_matches_single_thread() {
        let vectors = normal_vectors(300, 2);
        let config = ForestConfig::default();
        let pool = rayon::ThreadPoolBuilder::new().num_threads(1).build().unwrap();
        let single = pool.install(|| ForestModel::train(&vectors, &config, 5).unwrap());
        let parallel = ForestModel::train(&vectors, &config, 5).unwrap();
        assert_eq!(single.forest, parallel.forest);
    }

    #[test]
    fn test_subsample_and_depth_limits() {
        let vectors = normal_vectors(1000, 3);
        let model = ForestModel::train(&vectors, &ForestConfig::default(), 42).unwrap();
        assert_eq!(model.forest.tree_count(), 100);
        assert_eq!(model.forest.subsample_size(), 256);
        assert!(model.forest.trees().iter().all(|t| t.depth() <= 8));

        let small = ForestModel::train(&normal_vectors(50, 3), &ForestConfig::default(), 42).unwrap();
        assert_eq!(small.forest.subsample_size(), 50);
    }

    #[test]
    fn test_outlier_scores_above_typical_point() {
        let vectors = normal_vectors(500, 4);
        let model = ForestModel::train(&vectors, &ForestConfig::default(), 42).unwrap();
        let typical = model.score(&with_flow(40.0));
        let flow_only = model.score(&with_flow(80.0));
        let burst = model.score(&reading_like(5.0, 80.0, 50.0));
        assert!(typical.score < 50.0, "typical scored {}", typical.score);
        assert!(burst.score > 60.0, "burst scored {}", burst.score);
        assert!(flow_only.raw > typical.raw);
        assert!(burst.raw > flow_only.raw);
        assert!(burst.path_length < typical.path_length);
    }

    #[test]
    fn test_score_monotone_in_single_feature_deviation() {
        let vectors = normal_vectors(500, 5);
        let model = ForestModel::train(&vectors, &ForestConfig::default(), 42).unwrap();
        let mut previous = model.score(&with_flow(44.0)).score;
        for step in 1..=20 {
            let score = model.score(&with_flow(44.0 + f64::from(step))).score;
            assert!(score + 1.0 >= previous, "score dropped from {previous} to {score}");
            previous = score;
        }
    }

    #[test]
    fn test_scores_bounded() {
        let vectors = normal_vectors(300, 6);
        let model = ForestModel::train(&vectors, &ForestConfig::default(), 42).unwrap();
        for v in vectors.iter().chain([with_flow(1e9), with_flow(1e-9)].iter()) {
            let s = model.score(v);
            assert!((0.0..=100.0).contains(&s.score));
            assert!(s.raw > 0.0 && s.raw <= 1.0);
        }
    }

    #[test]
    fn test_calibration_anchors_quantile_at_fifty() {
        let raw: Vec<f64> = (0..1000).map(|i| 0.3 + f64::from(i) * 1e-4).collect();
        let cal = ScoreCalibration::fit(&raw, 0.005, 1.5);
        assert!((cal.map(cal.offset) - 50.0).abs() < 1e-9);
        assert!(cal.map(0.3) < 5.0);
        assert!(cal.map(0.9) > 99.0);
    }

    #[test]
    fn test_calibration_floors_spread() {
        let cal = ScoreCalibration::fit(&[0.4; 20], 0.005, 1.5);
        assert_eq!(cal.spread, SCORE_SPREAD_FLOOR);
        assert!(cal.is_valid());
    }

    #[test]
    fn test_zero_variance_feature_contributes_zero() {
        let means = [1.0; FEATURE_COUNT];
        let mut stds = [2.0; FEATURE_COUNT];
        stds[3] = 0.0;
        let mut x = [5.0; FEATURE_COUNT];
        x[3] = 1e6;
        let z = standardize(&x, &means, &stds);
        assert_eq!(z[3], 0.0);
        assert_eq!(z[0], 2.0);
    }

    #[test]
    fn test_fit_needs_two_rows() {
        assert!(IsolationForest::fit(&[[0.0; FEATURE_COUNT]], 10, 256, 1).is_none());
    }
}
