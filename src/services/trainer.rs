use std::collections::HashMap;

use chrono::Utc;
use ndarray::Array2;
use sqlx::PgPool;
use uuid::Uuid;

use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::model::{GbdtModel, ModelArtifact, TrainParams};
use crate::models::{split_tags, TrainingRow};
use crate::services::encoder::{self, cosine_similarity, EncodeRecord, Vocabulary};
use crate::services::labels;
use crate::services::profile;

/// Probability cutoff used only for the post-fit training-set readout
const REPORT_THRESHOLD: f32 = 0.6;

/// Counters and diagnostics from one training run
#[derive(Debug, Clone)]
pub struct TrainStats {
    pub examples: usize,
    pub skipped: usize,
    pub positives: usize,
    pub features: usize,
    pub training_accuracy: f32,
    pub model_id: Uuid,
}

/// Fits a model on the rebuilt training table and persists the artifact:
/// ensemble, frozen vocabulary, and feature-name list together, so scoring
/// can never drift from the encoding used here.
pub async fn train(pool: &PgPool, config: &Config) -> AppResult<TrainStats> {
    let rows = sqlx::query_as::<_, TrainingRow>(
        r#"
        SELECT username, rating_key, label, embedding,
               genre_tags, actor_tags, director_tags, release_year, sample_weight
        FROM training_data
        "#,
    )
    .fetch_all(pool)
    .await?;
    if rows.is_empty() {
        return Err(AppError::NotFound(
            "no training data; run rebuild-training first".to_string(),
        ));
    }

    let (media_dim, user_dim) = labels::embedding_dims(pool).await?;

    let genre_lists: Vec<Vec<String>> = rows
        .iter()
        .map(|r| split_tags(r.genre_tags.as_deref()))
        .collect();
    let actor_lists: Vec<Vec<String>> = rows
        .iter()
        .map(|r| split_tags(r.actor_tags.as_deref()))
        .collect();
    let director_lists: Vec<Vec<String>> = rows
        .iter()
        .map(|r| split_tags(r.director_tags.as_deref()))
        .collect();
    let years: Vec<Option<i32>> = rows.iter().map(|r| r.release_year).collect();

    let vocabulary = Vocabulary::freeze(
        &genre_lists,
        &actor_lists,
        &director_lists,
        &years,
        config.vocab_top_k,
    );
    tracing::info!(
        genres = vocabulary.genres.len(),
        actors = vocabulary.actors.len(),
        directors = vocabulary.directors.len(),
        decades = vocabulary.decades.len(),
        "Vocabulary frozen"
    );

    // Watch profiles once per user; the encoder's similarity scalar uses
    // the same profile at training and scoring time
    let mut profiles: HashMap<String, Option<Vec<f32>>> = HashMap::new();
    for row in &rows {
        if !profiles.contains_key(&row.username) {
            let vector =
                profile::user_watch_vector(pool, &row.username, config.watch_embed_min_engagement)
                    .await?;
            profiles.insert(row.username.clone(), vector);
        }
    }

    let feature_names = encoder::feature_names(&vocabulary, media_dim, user_dim);
    let width = feature_names.len();
    let mut flat: Vec<f32> = Vec::new();
    let mut y: Vec<f32> = Vec::new();
    let mut weights: Vec<f32> = Vec::new();
    let mut skipped = 0usize;

    for (i, row) in rows.iter().enumerate() {
        let Some(embedding) = &row.embedding else {
            skipped += 1;
            continue;
        };
        let combined = embedding.as_slice();
        if combined.len() != media_dim + user_dim {
            skipped += 1;
            continue;
        }
        let media = &combined[..media_dim];
        let user = &combined[media_dim..];
        let watch_sim = profiles
            .get(&row.username)
            .and_then(|p| p.as_deref())
            .map(|p| cosine_similarity(media, p))
            .unwrap_or(0.0);

        let record = EncodeRecord {
            media_embedding: media.to_vec(),
            user_embedding: user.to_vec(),
            genres: genre_lists[i].clone(),
            actors: actor_lists[i].clone(),
            directors: director_lists[i].clone(),
            year: row.release_year,
            watch_sim,
        };
        flat.extend(encoder::encode(&record, &vocabulary));
        y.push(row.label as f32);
        weights.push(row.sample_weight as f32);
    }
    if skipped > 0 {
        tracing::warn!(skipped, "Training rows skipped for unusable embeddings");
    }
    if y.is_empty() {
        return Err(AppError::NotFound(
            "no usable training rows after embedding checks".to_string(),
        ));
    }

    let x = Array2::from_shape_vec((y.len(), width), flat)
        .map_err(|e| AppError::Internal(format!("training matrix shape: {}", e)))?;
    let positives = y.iter().filter(|&&label| label > 0.5).count();
    tracing::info!(
        examples = y.len(),
        positives,
        features = width,
        "Fitting classifier"
    );

    let gbdt = GbdtModel::fit(&x, &y, &weights, &TrainParams::default())?;

    let probabilities = gbdt.predict_proba(&x)?;
    let correct = probabilities
        .iter()
        .zip(y.iter())
        .filter(|(p, label)| (**p >= REPORT_THRESHOLD) == (**label > 0.5))
        .count();
    let training_accuracy = correct as f32 / y.len() as f32;

    let artifact = ModelArtifact {
        model_name: "gbdt_model".to_string(),
        model_id: Uuid::new_v4(),
        trained_at: Utc::now(),
        media_dim,
        user_dim,
        vocabulary,
        feature_names,
        gbdt,
    };
    artifact.save(&config.model_path)?;

    tracing::info!(
        model_id = %artifact.model_id,
        path = %config.model_path,
        stumps = artifact.gbdt.stumps.len(),
        training_accuracy,
        "Model artifact saved"
    );

    Ok(TrainStats {
        examples: y.len(),
        skipped,
        positives,
        features: width,
        training_accuracy,
        model_id: artifact.model_id,
    })
}
