use std::collections::HashMap;

use chrono::Utc;
use ndarray::Array2;
use sqlx::PgPool;

use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::model::{Classifier, ModelArtifact};
use crate::models::{split_tags, CandidateRow, MediaType, Recommendation};
use crate::services::attribution;
use crate::services::candidates;
use crate::services::encoder::{self, cosine_similarity, EncodeRecord};
use crate::services::profile;

/// Canned explanation attached when the user/media similarity is high
pub const SIMILARITY_EXPLANATION: &str = "Very similar to your viewing preferences";

/// One scored candidate prior to persistence
#[derive(Debug, Clone)]
pub struct ScoredItem {
    /// Row index into the encoded feature matrix
    pub source_index: usize,
    pub rating_key: i64,
    pub media_type: MediaType,
    pub probability: f32,
    pub cosine_similarity: f32,
    pub rank: i32,
}

/// Counters from one user's scoring pass
#[derive(Debug, Default, Clone, Copy)]
pub struct ScoreRunStats {
    pub scored: usize,
    pub skipped: usize,
    pub attributed: usize,
}

/// Candidates prepared for encoding, with integrity-skipped rows counted
#[derive(Debug, Default)]
pub struct PreparedCandidates {
    pub records: Vec<EncodeRecord>,
    pub items: Vec<ScoredItem>,
    pub skipped: usize,
}

/// Converts raw candidate rows into encoder records. Rows with missing or
/// dimension-mismatched embeddings, or an unrecognized media type, are
/// skipped and counted rather than failing the run.
pub fn prepare_candidates(
    rows: &[CandidateRow],
    media_dim: usize,
    user_dim: usize,
    watch_vec: Option<&[f32]>,
) -> PreparedCandidates {
    let mut prepared = PreparedCandidates::default();
    for row in rows {
        let Some(media_type) = MediaType::parse(&row.media_type) else {
            prepared.skipped += 1;
            continue;
        };
        let (Some(media), Some(user)) = (&row.media_embedding, &row.user_embedding) else {
            prepared.skipped += 1;
            continue;
        };
        let media = media.as_slice();
        let user = user.as_slice();
        if media.len() != media_dim || user.len() != user_dim {
            prepared.skipped += 1;
            continue;
        }

        let watch_sim = watch_vec
            .map(|profile| cosine_similarity(media, profile))
            .unwrap_or(0.0);
        let source_index = prepared.records.len();
        prepared.records.push(EncodeRecord {
            media_embedding: media.to_vec(),
            user_embedding: user.to_vec(),
            genres: split_tags(row.genre_tags.as_deref()),
            actors: split_tags(row.actor_tags.as_deref()),
            directors: split_tags(row.director_tags.as_deref()),
            year: row.year,
            watch_sim,
        });
        prepared.items.push(ScoredItem {
            source_index,
            rating_key: row.rating_key,
            media_type,
            probability: 0.0,
            cosine_similarity: cosine_similarity(user, media),
            rank: 0,
        });
    }
    prepared
}

/// Assigns a dense 1..N rank within each media-type group by descending
/// probability. The sort is stable, so probability ties keep the order the
/// candidates were retrieved in; every row gets a distinct rank.
pub fn assign_ranks(items: &mut [ScoredItem]) {
    let mut groups: HashMap<MediaType, Vec<usize>> = HashMap::new();
    for (i, item) in items.iter().enumerate() {
        groups.entry(item.media_type).or_default().push(i);
    }

    let mut assignments: Vec<(usize, i32)> = Vec::with_capacity(items.len());
    for indices in groups.values() {
        let mut sorted = indices.clone();
        sorted.sort_by(|&a, &b| {
            items[b]
                .probability
                .partial_cmp(&items[a].probability)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        for (pos, &idx) in sorted.iter().enumerate() {
            assignments.push((idx, (pos + 1) as i32));
        }
    }
    for (idx, rank) in assignments {
        items[idx].rank = rank;
    }
}

/// Explanation text for a similarity value against the configured threshold
pub fn explanation_for(similarity: f32, threshold: f32) -> &'static str {
    if similarity > threshold {
        SIMILARITY_EXPLANATION
    } else {
        ""
    }
}

/// Encodes prepared candidates into the model's feature matrix, validating
/// the encoder/model contract first.
fn encode_matrix(
    prepared: &PreparedCandidates,
    artifact: &ModelArtifact,
) -> AppResult<Array2<f32>> {
    let derived =
        encoder::feature_names(&artifact.vocabulary, artifact.media_dim, artifact.user_dim);
    encoder::check_contract(artifact.feature_names(), &derived)?;

    let width = derived.len();
    let mut flat = Vec::with_capacity(prepared.records.len() * width);
    for record in &prepared.records {
        flat.extend(encoder::encode(record, &artifact.vocabulary));
    }
    Array2::from_shape_vec((prepared.records.len(), width), flat)
        .map_err(|e| AppError::Internal(format!("feature matrix shape: {}", e)))
}

/// Scores every candidate for one user and appends the resulting
/// recommendation rows. Attribution runs afterwards unless skipped.
pub async fn score_user(
    pool: &PgPool,
    artifact: &ModelArtifact,
    config: &Config,
    username: &str,
    skip_attribution: bool,
) -> AppResult<ScoreRunStats> {
    let rows = candidates::fetch_candidates(pool, username, config.watched_engagement_threshold)
        .await?;
    if rows.is_empty() {
        tracing::info!(username, "No unwatched items to score");
        return Ok(ScoreRunStats::default());
    }

    let watch_vec =
        profile::user_watch_vector(pool, username, config.watch_embed_min_engagement).await?;
    if watch_vec.is_none() {
        tracing::warn!(username, "No watch profile; watch similarity will be 0");
    }

    let mut prepared =
        prepare_candidates(&rows, artifact.media_dim, artifact.user_dim, watch_vec.as_deref());
    if prepared.skipped > 0 {
        tracing::warn!(
            username,
            skipped = prepared.skipped,
            "Candidates skipped for missing or mismatched embeddings"
        );
    }
    if prepared.items.is_empty() {
        return Ok(ScoreRunStats {
            skipped: prepared.skipped,
            ..Default::default()
        });
    }

    let x = encode_matrix(&prepared, artifact)?;
    let probabilities = artifact.predict_proba(&x)?;
    for item in prepared.items.iter_mut() {
        item.probability = probabilities[item.source_index];
    }
    assign_ranks(&mut prepared.items);

    let scored_at = Utc::now();
    let recommendations: Vec<Recommendation> = prepared
        .items
        .iter()
        .map(|item| Recommendation {
            username: username.to_string(),
            rating_key: item.rating_key,
            predicted_probability: item.probability,
            model_name: artifact.model_name.clone(),
            scored_at,
            rank: item.rank,
            cosine_similarity: item.cosine_similarity,
            explanation: explanation_for(
                item.cosine_similarity,
                config.similarity_explanation_threshold,
            )
            .to_string(),
        })
        .collect();

    let mut tx = pool.begin().await?;
    for rec in &recommendations {
        sqlx::query(
            r#"
            INSERT INTO recommendations (
                username, rating_key, predicted_probability, model_name,
                scored_at, rank, cosine_similarity, explanation
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(&rec.username)
        .bind(rec.rating_key)
        .bind(rec.predicted_probability as f64)
        .bind(&rec.model_name)
        .bind(rec.scored_at)
        .bind(rec.rank)
        .bind(rec.cosine_similarity as f64)
        .bind(&rec.explanation)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;

    let mut stats = ScoreRunStats {
        scored: prepared.items.len(),
        skipped: prepared.skipped,
        attributed: 0,
    };
    tracing::info!(username, scored = stats.scored, "Stored recommendations");

    if skip_attribution {
        tracing::info!(username, "Skipping attribution");
    } else {
        stats.attributed = attribution::write_user_attribution(
            pool,
            artifact,
            config,
            username,
            &x,
            &prepared.items,
            artifact.media_dim + artifact.user_dim,
        )
        .await?;
    }

    Ok(stats)
}

/// Scores every user with watch history. The output table is truncated
/// first (the single-user entry point appends instead); one user's failure
/// is logged and skipped rather than aborting the batch.
pub async fn score_all_users(
    pool: &PgPool,
    artifact: &ModelArtifact,
    config: &Config,
    skip_attribution: bool,
) -> AppResult<()> {
    sqlx::query("TRUNCATE recommendations").execute(pool).await?;

    let users = candidates::fetch_usernames(pool).await?;
    tracing::info!(users = users.len(), "Scoring all users");
    for username in &users {
        match score_user(pool, artifact, config, username, skip_attribution).await {
            Ok(stats) => tracing::info!(
                username = %username,
                scored = stats.scored,
                attributed = stats.attributed,
                "User scored"
            ),
            Err(e) => tracing::error!(
                username = %username,
                error = %e,
                "Scoring failed; skipping user"
            ),
        }
    }
    Ok(())
}
