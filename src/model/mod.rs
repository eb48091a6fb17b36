pub mod gbdt;

use chrono::{DateTime, Utc};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::services::encoder::{self, Vocabulary};

pub use gbdt::{GbdtModel, TrainParams};

/// Trained binary classifier capability. The ranking pipeline only depends
/// on this surface; the boosted-stump implementation behind it is
/// replaceable.
#[cfg_attr(test, mockall::automock)]
pub trait Classifier: Send + Sync {
    /// Ordered feature-name list the model was fitted on
    fn feature_names(&self) -> &[String];

    /// Positive-class probability per row
    fn predict_proba(&self, x: &Array2<f32>) -> AppResult<Array1<f32>>;

    /// Per-row, per-feature additive contributions in margin space
    fn explain(&self, x: &Array2<f32>) -> AppResult<Array2<f32>>;
}

/// Versioned model artifact persisted as JSON: the fitted ensemble plus the
/// frozen vocabulary and feature-name list it was trained with. Scoring
/// loads the whole artifact, so the encoding contract travels with the
/// model rather than being re-derived from live database state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub model_name: String,
    pub model_id: Uuid,
    pub trained_at: DateTime<Utc>,
    pub media_dim: usize,
    pub user_dim: usize,
    pub vocabulary: Vocabulary,
    pub feature_names: Vec<String>,
    pub gbdt: GbdtModel,
}

impl ModelArtifact {
    pub fn save(&self, path: &str) -> AppResult<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| AppError::ModelArtifact(format!("serialize failed: {}", e)))?;
        std::fs::write(path, json)
            .map_err(|e| AppError::ModelArtifact(format!("write {} failed: {}", path, e)))?;
        Ok(())
    }

    /// Loads and validates an artifact. A feature list that disagrees with
    /// the one derived from the stored vocabulary means the file was edited
    /// or produced by an incompatible version; refuse to score with it.
    pub fn load(path: &str) -> AppResult<Self> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| AppError::ModelArtifact(format!("read {} failed: {}", path, e)))?;
        let artifact: ModelArtifact = serde_json::from_str(&json)
            .map_err(|e| AppError::ModelArtifact(format!("parse {} failed: {}", path, e)))?;

        let derived =
            encoder::feature_names(&artifact.vocabulary, artifact.media_dim, artifact.user_dim);
        encoder::check_contract(&artifact.feature_names, &derived)?;
        if artifact.gbdt.n_features != artifact.feature_names.len() {
            return Err(AppError::ModelArtifact(format!(
                "ensemble expects {} features but artifact lists {}",
                artifact.gbdt.n_features,
                artifact.feature_names.len()
            )));
        }
        Ok(artifact)
    }
}

impl Classifier for ModelArtifact {
    fn feature_names(&self) -> &[String] {
        &self.feature_names
    }

    fn predict_proba(&self, x: &Array2<f32>) -> AppResult<Array1<f32>> {
        self.gbdt.predict_proba(x)
    }

    fn explain(&self, x: &Array2<f32>) -> AppResult<Array2<f32>> {
        self.gbdt.explain(x)
    }
}
