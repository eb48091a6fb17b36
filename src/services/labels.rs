use std::collections::HashSet;

use pgvector::Vector;
use sqlx::PgPool;

use crate::error::{AppError, AppResult};
use crate::models::{
    engagement_ratio, FeedbackOnlyRow, FeedbackPolarity, TrainingExample, WatchLabelRow,
};

const DOWN_WEIGHT: f32 = 5.0;
const UP_WEIGHT: f32 = 2.0;
const MAX_WEIGHT: f32 = 5.0;
const REWATCH_STEP: f32 = 0.5;

/// Thresholds and bonuses governing label construction
#[derive(Debug, Clone, Copy)]
pub struct LabelPolicy {
    /// Ratio above which an unlabeled watch is a positive example
    pub engagement_threshold: f32,
    /// Ratio below which an unlabeled watch is a negative example
    pub negative_threshold: f32,
    /// Ratio bonus applied to thumbs-up rows
    pub feedback_bonus: f32,
}

/// Per-row labeling outcome
#[derive(Debug, Clone, PartialEq)]
pub enum RowOutcome {
    Example(TrainingExample),
    /// Engagement ratio between the thresholds with no feedback
    Ambiguous,
    /// Row-local data integrity problem; skipped and counted, never fatal
    Skipped(&'static str),
}

/// Counters reported at the end of a rebuild
#[derive(Debug, Default, Clone, Copy)]
pub struct BuildStats {
    pub inserted: usize,
    pub ambiguous_dropped: usize,
    pub integrity_skipped: usize,
    pub thumbs_down: usize,
    pub thumbs_up: usize,
    pub rewatch_boosted: usize,
}

/// Labels one watch-history row. Feedback polarity strictly overrides the
/// engagement heuristic; the thumbs-down branch zeroes the ratio no matter
/// how much was actually played.
pub fn label_watch_row(
    row: &WatchLabelRow,
    policy: &LabelPolicy,
    media_dim: usize,
    user_dim: usize,
) -> RowOutcome {
    let Some(raw_ratio) = engagement_ratio(row.played_duration, row.media_duration) else {
        return RowOutcome::Skipped("missing or zero duration");
    };
    let Some(combined) = combine_embeddings(
        row.media_embedding.as_ref(),
        row.user_embedding.as_ref(),
        media_dim,
        user_dim,
    ) else {
        return RowOutcome::Skipped("missing or mismatched embedding");
    };

    let feedback = row.feedback.as_deref().and_then(FeedbackPolarity::parse);
    let (label, engagement, weight) = match feedback {
        Some(FeedbackPolarity::Down) => (0, 0.0, DOWN_WEIGHT),
        Some(FeedbackPolarity::Up) => (1, raw_ratio + policy.feedback_bonus, UP_WEIGHT),
        None => {
            let weight = rewatch_weight(row.rewatch_count);
            if raw_ratio > policy.engagement_threshold {
                (1, raw_ratio, weight)
            } else if raw_ratio < policy.negative_threshold {
                (0, raw_ratio, weight)
            } else {
                return RowOutcome::Ambiguous;
            }
        }
    };

    RowOutcome::Example(TrainingExample {
        username: row.username.clone(),
        rating_key: row.rating_key,
        label,
        combined_embedding: combined,
        genre_tags: row.genre_tags.clone().unwrap_or_default(),
        actor_tags: row.actor_tags.clone().unwrap_or_default(),
        director_tags: row.director_tags.clone().unwrap_or_default(),
        release_year: row.release_year,
        season_number: row.season_number,
        episode_number: row.episode_number,
        played_duration: row.played_duration,
        media_duration: row.media_duration,
        engagement_ratio: engagement,
        sample_weight: weight,
    })
}

/// Labels a feedback row with no watch event. Same fixed weights and labels
/// by polarity; the thumbs-up ratio is the bare bonus since nothing played.
pub fn label_feedback_row(
    row: &FeedbackOnlyRow,
    policy: &LabelPolicy,
    media_dim: usize,
    user_dim: usize,
) -> RowOutcome {
    let Some(polarity) = FeedbackPolarity::parse(&row.feedback) else {
        return RowOutcome::Skipped("unknown feedback polarity");
    };
    let Some(combined) = combine_embeddings(
        row.media_embedding.as_ref(),
        row.user_embedding.as_ref(),
        media_dim,
        user_dim,
    ) else {
        return RowOutcome::Skipped("missing or mismatched embedding");
    };

    let (label, engagement, weight) = match polarity {
        FeedbackPolarity::Down => (0, 0.0, DOWN_WEIGHT),
        FeedbackPolarity::Up => (1, policy.feedback_bonus, UP_WEIGHT),
    };

    RowOutcome::Example(TrainingExample {
        username: row.username.clone(),
        rating_key: row.rating_key,
        label,
        combined_embedding: combined,
        genre_tags: row.genre_tags.clone().unwrap_or_default(),
        actor_tags: row.actor_tags.clone().unwrap_or_default(),
        director_tags: row.director_tags.clone().unwrap_or_default(),
        release_year: row.release_year,
        season_number: None,
        episode_number: None,
        played_duration: None,
        media_duration: None,
        engagement_ratio: engagement,
        sample_weight: weight,
    })
}

fn rewatch_weight(rewatch_count: i64) -> f32 {
    (1.0 + REWATCH_STEP * rewatch_count as f32).min(MAX_WEIGHT)
}

fn combine_embeddings(
    media: Option<&Vector>,
    user: Option<&Vector>,
    media_dim: usize,
    user_dim: usize,
) -> Option<Vec<f32>> {
    let media = media?.as_slice();
    let user = user?.as_slice();
    if media.len() != media_dim || user.len() != user_dim {
        return None;
    }
    let mut combined = Vec::with_capacity(media.len() + user.len());
    combined.extend_from_slice(media);
    combined.extend_from_slice(user);
    Some(combined)
}

/// Rebuilds the training table from scratch: watch-based rows unioned with
/// feedback-only rows, deduplicated by (user, item) with watch-derived rows
/// winning the key, then truncate + insert in a single transaction.
pub async fn build_training_data(
    pool: &PgPool,
    policy: &LabelPolicy,
) -> AppResult<BuildStats> {
    let (media_dim, user_dim) = embedding_dims(pool).await?;
    tracing::info!(media_dim, user_dim, "Detected embedding dimensions");

    let watch_rows = fetch_watch_rows(pool).await?;
    let feedback_rows = fetch_feedback_only_rows(pool).await?;
    tracing::info!(
        watch_rows = watch_rows.len(),
        feedback_only_rows = feedback_rows.len(),
        "Fetched label sources"
    );

    let mut stats = BuildStats::default();
    let mut seen: HashSet<(String, i64)> = HashSet::new();
    let mut examples: Vec<TrainingExample> = Vec::new();

    let mut absorb = |outcome: RowOutcome, stats: &mut BuildStats| {
        match outcome {
            RowOutcome::Example(example) => {
                if !seen.insert((example.username.clone(), example.rating_key)) {
                    return;
                }
                match (example.label, example.sample_weight) {
                    (0, w) if w == DOWN_WEIGHT => stats.thumbs_down += 1,
                    (1, w) if w == UP_WEIGHT => stats.thumbs_up += 1,
                    (1, w) if w > 1.0 => stats.rewatch_boosted += 1,
                    _ => {}
                }
                examples.push(example);
            }
            RowOutcome::Ambiguous => stats.ambiguous_dropped += 1,
            RowOutcome::Skipped(reason) => {
                stats.integrity_skipped += 1;
                tracing::debug!(reason, "Skipped training row");
            }
        }
    };

    for row in &watch_rows {
        absorb(label_watch_row(row, policy, media_dim, user_dim), &mut stats);
    }
    for row in &feedback_rows {
        absorb(
            label_feedback_row(row, policy, media_dim, user_dim),
            &mut stats,
        );
    }
    drop(absorb);
    stats.inserted = examples.len();

    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM training_data")
        .execute(&mut *tx)
        .await?;
    for example in &examples {
        sqlx::query(
            r#"
            INSERT INTO training_data (
                username, rating_key, label, embedding,
                genre_tags, actor_tags, director_tags, release_year,
                season_number, episode_number,
                played_duration, media_duration, engagement_ratio, sample_weight
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(&example.username)
        .bind(example.rating_key)
        .bind(example.label)
        .bind(Vector::from(example.combined_embedding.clone()))
        .bind(&example.genre_tags)
        .bind(&example.actor_tags)
        .bind(&example.director_tags)
        .bind(example.release_year)
        .bind(example.season_number)
        .bind(example.episode_number)
        .bind(example.played_duration)
        .bind(example.media_duration)
        .bind(example.engagement_ratio as f64)
        .bind(example.sample_weight as f64)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;

    tracing::info!(
        inserted = stats.inserted,
        ambiguous_dropped = stats.ambiguous_dropped,
        integrity_skipped = stats.integrity_skipped,
        thumbs_down = stats.thumbs_down,
        thumbs_up = stats.thumbs_up,
        rewatch_boosted = stats.rewatch_boosted,
        "Training data rebuild complete"
    );

    Ok(stats)
}

/// Embedding dimensions sampled from the stores; fatal when either store is
/// empty since nothing could be labeled anyway.
pub async fn embedding_dims(pool: &PgPool) -> AppResult<(usize, usize)> {
    let media: Option<(Vector,)> =
        sqlx::query_as("SELECT embedding FROM media_embeddings LIMIT 1")
            .fetch_optional(pool)
            .await?;
    let user: Option<(Vector,)> =
        sqlx::query_as("SELECT embedding FROM user_embeddings LIMIT 1")
            .fetch_optional(pool)
            .await?;
    match (media, user) {
        (Some((m,)), Some((u,))) => Ok((m.as_slice().len(), u.as_slice().len())),
        _ => Err(AppError::NotFound(
            "no embeddings found to detect dimensions".to_string(),
        )),
    }
}

async fn fetch_watch_rows(pool: &PgPool) -> AppResult<Vec<WatchLabelRow>> {
    let rows = sqlx::query_as::<_, WatchLabelRow>(
        r#"
        SELECT
            t.username,
            t.rating_key,
            COUNT(*) AS rewatch_count,
            t.played_duration::float8 AS played_duration,
            l.duration::float8 AS media_duration,
            l.year AS release_year,
            t.season_number,
            t.episode_number,
            genre_tags.genre_tags,
            actor_tags.actor_tags,
            director_tags.director_tags,
            me.embedding AS media_embedding,
            ue.embedding AS user_embedding,
            f.feedback
        FROM watch_history t
        JOIN library l ON t.rating_key = l.rating_key
        JOIN media_embeddings me ON t.rating_key = me.rating_key
        JOIN user_embeddings ue ON t.username = ue.username
        LEFT JOIN user_feedback f
            ON f.username = t.username AND f.rating_key = l.rating_key
        LEFT JOIN LATERAL (
            SELECT string_agg(g.name, ', ') AS genre_tags
            FROM media_genres mg
            JOIN genres g ON mg.genre_id = g.id
            WHERE mg.media_id = l.rating_key
        ) genre_tags ON true
        LEFT JOIN LATERAL (
            SELECT string_agg(a.name, ', ') AS actor_tags
            FROM media_actors ma
            JOIN actors a ON ma.actor_id = a.id
            WHERE ma.media_id = l.rating_key
        ) actor_tags ON true
        LEFT JOIN LATERAL (
            SELECT string_agg(d.name, ', ') AS director_tags
            FROM media_directors md
            JOIN directors d ON md.director_id = d.id
            WHERE md.media_id = l.rating_key
        ) director_tags ON true
        WHERE t.played_duration IS NOT NULL AND l.duration IS NOT NULL
        GROUP BY t.username, t.rating_key, t.played_duration, l.duration, l.year,
                 t.season_number, t.episode_number,
                 me.embedding, ue.embedding, f.feedback,
                 genre_tags.genre_tags, actor_tags.actor_tags, director_tags.director_tags
        "#,
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

async fn fetch_feedback_only_rows(pool: &PgPool) -> AppResult<Vec<FeedbackOnlyRow>> {
    let rows = sqlx::query_as::<_, FeedbackOnlyRow>(
        r#"
        SELECT
            f.username,
            f.rating_key,
            f.feedback,
            l.year AS release_year,
            (
                SELECT string_agg(g.name, ', ')
                FROM media_genres mg
                JOIN genres g ON mg.genre_id = g.id
                WHERE mg.media_id = l.rating_key
            ) AS genre_tags,
            (
                SELECT string_agg(a.name, ', ')
                FROM media_actors ma
                JOIN actors a ON ma.actor_id = a.id
                WHERE ma.media_id = l.rating_key
            ) AS actor_tags,
            (
                SELECT string_agg(d.name, ', ')
                FROM media_directors md
                JOIN directors d ON md.director_id = d.id
                WHERE md.media_id = l.rating_key
            ) AS director_tags,
            me.embedding AS media_embedding,
            ue.embedding AS user_embedding
        FROM user_feedback f
        JOIN library l ON f.rating_key = l.rating_key
        JOIN media_embeddings me ON f.rating_key = me.rating_key
        JOIN user_embeddings ue ON f.username = ue.username
        LEFT JOIN watch_history w
            ON w.username = f.username AND w.rating_key = f.rating_key
        WHERE w.rating_key IS NULL
        "#,
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}
