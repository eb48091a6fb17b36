use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};

const LAMBDA: f32 = 1.0;
const MIN_GAIN: f32 = 1e-7;
const PROB_CLAMP: f32 = 1e-6;

/// One depth-1 regression tree. Leaf values are already scaled by the
/// learning rate; rows with `x[feature] <= threshold` take the left leaf.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stump {
    pub feature: usize,
    pub threshold: f32,
    pub left: f32,
    pub right: f32,
}

/// Gradient-boosted stump ensemble for binary classification.
///
/// Logistic loss, Newton leaf steps, per-example sample weights, and
/// quantile-candidate splits. Depth-1 trees keep the margin an exact
/// per-feature additive decomposition, which is what the explainer persists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GbdtModel {
    pub base_score: f32,
    pub stumps: Vec<Stump>,
    pub n_features: usize,
}

#[derive(Debug, Clone)]
pub struct TrainParams {
    pub n_rounds: usize,
    pub learning_rate: f32,
    pub max_bins: usize,
}

impl Default for TrainParams {
    fn default() -> Self {
        Self {
            n_rounds: 100,
            learning_rate: 0.1,
            max_bins: 16,
        }
    }
}

impl GbdtModel {
    /// Fits the ensemble on a feature matrix, binary labels, and sample
    /// weights. Stops early when no split improves the loss.
    pub fn fit(
        x: &Array2<f32>,
        y: &[f32],
        weights: &[f32],
        params: &TrainParams,
    ) -> AppResult<Self> {
        let n = x.nrows();
        let d = x.ncols();
        if n == 0 || d == 0 {
            return Err(AppError::InvalidInput(
                "cannot fit on an empty feature matrix".to_string(),
            ));
        }
        if y.len() != n || weights.len() != n {
            return Err(AppError::InvalidInput(format!(
                "label/weight length mismatch: {} rows, {} labels, {} weights",
                n,
                y.len(),
                weights.len()
            )));
        }

        let weight_sum: f32 = weights.iter().sum();
        let positive_sum: f32 = y.iter().zip(weights).map(|(yi, wi)| yi * wi).sum();
        let prior = (positive_sum / weight_sum).clamp(PROB_CLAMP, 1.0 - PROB_CLAMP);
        let base_score = (prior / (1.0 - prior)).ln();

        let mut margins = vec![base_score; n];
        let mut stumps = Vec::with_capacity(params.n_rounds);

        let thresholds: Vec<Vec<f32>> = (0..d)
            .map(|j| candidate_thresholds(x, j, params.max_bins))
            .collect();

        for _ in 0..params.n_rounds {
            // Weighted gradients and hessians of the logistic loss
            let mut grad = vec![0.0f32; n];
            let mut hess = vec![0.0f32; n];
            for i in 0..n {
                let p = sigmoid(margins[i]);
                grad[i] = weights[i] * (p - y[i]);
                hess[i] = weights[i] * (p * (1.0 - p)).max(PROB_CLAMP);
            }
            let g_total: f32 = grad.iter().sum();
            let h_total: f32 = hess.iter().sum();
            let root_score = g_total * g_total / (h_total + LAMBDA);

            let mut best: Option<(f32, usize, f32, f32, f32)> = None;
            for j in 0..d {
                for &t in &thresholds[j] {
                    let mut g_left = 0.0f32;
                    let mut h_left = 0.0f32;
                    for i in 0..n {
                        if x[[i, j]] <= t {
                            g_left += grad[i];
                            h_left += hess[i];
                        }
                    }
                    let g_right = g_total - g_left;
                    let h_right = h_total - h_left;
                    if h_left <= 0.0 || h_right <= 0.0 {
                        continue;
                    }
                    let gain = g_left * g_left / (h_left + LAMBDA)
                        + g_right * g_right / (h_right + LAMBDA)
                        - root_score;
                    if gain > best.as_ref().map_or(MIN_GAIN, |b| b.0) {
                        let left = -g_left / (h_left + LAMBDA);
                        let right = -g_right / (h_right + LAMBDA);
                        best = Some((gain, j, t, left, right));
                    }
                }
            }

            let Some((_, feature, threshold, left, right)) = best else {
                break;
            };

            let stump = Stump {
                feature,
                threshold,
                left: left * params.learning_rate,
                right: right * params.learning_rate,
            };
            for i in 0..n {
                margins[i] += if x[[i, stump.feature]] <= stump.threshold {
                    stump.left
                } else {
                    stump.right
                };
            }
            stumps.push(stump);
        }

        Ok(Self {
            base_score,
            stumps,
            n_features: d,
        })
    }

    /// Raw margin (log-odds) per row
    pub fn predict_margin(&self, x: &Array2<f32>) -> AppResult<Array1<f32>> {
        self.check_width(x)?;
        let mut margins = Array1::from_elem(x.nrows(), self.base_score);
        for stump in &self.stumps {
            for i in 0..x.nrows() {
                margins[i] += if x[[i, stump.feature]] <= stump.threshold {
                    stump.left
                } else {
                    stump.right
                };
            }
        }
        Ok(margins)
    }

    /// Positive-class probability per row
    pub fn predict_proba(&self, x: &Array2<f32>) -> AppResult<Array1<f32>> {
        Ok(self.predict_margin(x)?.mapv(sigmoid))
    }

    /// Per-row, per-feature additive contributions in margin space.
    /// Each stump's chosen leaf is attributed to its split feature, so a
    /// row's contributions sum to `margin - base_score` exactly.
    pub fn explain(&self, x: &Array2<f32>) -> AppResult<Array2<f32>> {
        self.check_width(x)?;
        let mut contributions = Array2::zeros((x.nrows(), self.n_features));
        for stump in &self.stumps {
            for i in 0..x.nrows() {
                contributions[[i, stump.feature]] += if x[[i, stump.feature]] <= stump.threshold {
                    stump.left
                } else {
                    stump.right
                };
            }
        }
        Ok(contributions)
    }

    fn check_width(&self, x: &Array2<f32>) -> AppResult<()> {
        if x.ncols() != self.n_features {
            return Err(AppError::Internal(format!(
                "matrix has {} columns, model was fitted on {}",
                x.ncols(),
                self.n_features
            )));
        }
        Ok(())
    }
}

fn sigmoid(z: f32) -> f32 {
    1.0 / (1.0 + (-z).exp())
}

/// Up to `max_bins` split candidates per feature, taken from the sorted
/// distinct values (quantile-spaced when there are more distinct values
/// than bins). The largest value is excluded: splitting there puts every
/// row on the left.
fn candidate_thresholds(x: &Array2<f32>, feature: usize, max_bins: usize) -> Vec<f32> {
    let mut values: Vec<f32> = x.column(feature).iter().copied().collect();
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    values.dedup();
    if values.len() < 2 {
        return Vec::new();
    }
    values.pop();
    if values.len() <= max_bins {
        return values;
    }
    let step = values.len() as f32 / max_bins as f32;
    (0..max_bins)
        .map(|k| values[(k as f32 * step) as usize])
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn separable_data() -> (Array2<f32>, Vec<f32>, Vec<f32>) {
        // First column separates the classes perfectly
        let x = array![
            [0.0, 1.0],
            [0.1, 0.0],
            [0.2, 1.0],
            [0.9, 0.0],
            [0.8, 1.0],
            [1.0, 0.0],
        ];
        let y = vec![0.0, 0.0, 0.0, 1.0, 1.0, 1.0];
        let w = vec![1.0; 6];
        (x, y, w)
    }

    #[test]
    fn test_fit_learns_separable_split() {
        let (x, y, w) = separable_data();
        let model = GbdtModel::fit(&x, &y, &w, &TrainParams::default()).unwrap();
        let probs = model.predict_proba(&x).unwrap();
        for i in 0..3 {
            assert!(probs[i] < 0.5, "negative row {} scored {}", i, probs[i]);
        }
        for i in 3..6 {
            assert!(probs[i] > 0.5, "positive row {} scored {}", i, probs[i]);
        }
    }

    #[test]
    fn test_probabilities_are_bounded() {
        let (x, y, w) = separable_data();
        let model = GbdtModel::fit(&x, &y, &w, &TrainParams::default()).unwrap();
        for p in model.predict_proba(&x).unwrap() {
            assert!(p > 0.0 && p < 1.0);
        }
    }

    #[test]
    fn test_explain_sums_to_margin_minus_base() {
        let (x, y, w) = separable_data();
        let model = GbdtModel::fit(&x, &y, &w, &TrainParams::default()).unwrap();
        let margins = model.predict_margin(&x).unwrap();
        let contributions = model.explain(&x).unwrap();
        for i in 0..x.nrows() {
            let total: f32 = contributions.row(i).sum();
            assert!(
                (total - (margins[i] - model.base_score)).abs() < 1e-4,
                "row {}: contributions {} vs margin delta {}",
                i,
                total,
                margins[i] - model.base_score
            );
        }
    }

    #[test]
    fn test_sample_weights_shift_the_boundary() {
        // Same point appears with both labels; weight decides which wins
        let x = array![[0.0], [0.0]];
        let y = vec![0.0, 1.0];
        let heavy_negative = GbdtModel::fit(&x, &y, &[5.0, 1.0], &TrainParams::default()).unwrap();
        let heavy_positive = GbdtModel::fit(&x, &y, &[1.0, 5.0], &TrainParams::default()).unwrap();
        let p_neg = heavy_negative.predict_proba(&x).unwrap()[0];
        let p_pos = heavy_positive.predict_proba(&x).unwrap()[0];
        assert!(p_neg < 0.5);
        assert!(p_pos > 0.5);
    }

    #[test]
    fn test_single_class_degenerates_to_prior() {
        let x = array![[0.0], [1.0]];
        let y = vec![1.0, 1.0];
        let w = vec![1.0, 1.0];
        let model = GbdtModel::fit(&x, &y, &w, &TrainParams::default()).unwrap();
        let probs = model.predict_proba(&x).unwrap();
        assert!(probs[0] > 0.99);
        assert!(probs[1] > 0.99);
    }

    #[test]
    fn test_width_mismatch_is_rejected() {
        let (x, y, w) = separable_data();
        let model = GbdtModel::fit(&x, &y, &w, &TrainParams::default()).unwrap();
        let narrow = array![[0.5f32]];
        assert!(model.predict_proba(&narrow).is_err());
    }

    #[test]
    fn test_candidate_thresholds_exclude_max() {
        let x = array![[0.0], [1.0], [2.0]];
        let t = candidate_thresholds(&x, 0, 16);
        assert_eq!(t, vec![0.0, 1.0]);
    }

    #[test]
    fn test_candidate_thresholds_constant_column() {
        let x = array![[3.0], [3.0]];
        assert!(candidate_thresholds(&x, 0, 16).is_empty());
    }
}
