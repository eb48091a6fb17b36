use std::collections::HashMap;

use pgvector::Vector;
use sqlx::PgPool;

use crate::error::AppResult;
use crate::models::engagement_ratio;

/// Mean watch-space embedding over a user's engaged watch events, used as
/// the watch-profile side of the encoder's similarity scalar. None when the
/// user has no watch above the engagement floor.
pub async fn user_watch_vector(
    pool: &PgPool,
    username: &str,
    min_engagement: f32,
) -> AppResult<Option<Vec<f32>>> {
    let rows: Vec<(Option<f64>, Option<f64>, Option<Vector>)> = sqlx::query_as(
        r#"
        SELECT
            wh.played_duration::float8,
            l.duration::float8 AS media_duration,
            we.embedding AS watch_embedding
        FROM watch_history wh
        JOIN library l ON wh.rating_key = l.rating_key
        JOIN watch_embeddings we ON wh.watch_id::text = we.watch_id::text
        WHERE wh.username = $1
          AND wh.played_duration IS NOT NULL
          AND l.duration IS NOT NULL
        "#,
    )
    .bind(username)
    .fetch_all(pool)
    .await?;

    let mut sum: Option<Vec<f64>> = None;
    let mut count = 0usize;
    for (played, duration, embedding) in rows {
        let Some(ratio) = engagement_ratio(played, duration) else {
            continue;
        };
        if ratio < min_engagement {
            continue;
        }
        let Some(vec) = embedding else { continue };
        let values = vec.as_slice();
        match &mut sum {
            None => sum = Some(values.iter().map(|&v| v as f64).collect()),
            Some(acc) => {
                if acc.len() != values.len() {
                    tracing::debug!(username, "Watch embedding dimension mismatch, skipping");
                    continue;
                }
                for (slot, &v) in acc.iter_mut().zip(values) {
                    *slot += v as f64;
                }
            }
        }
        count += 1;
    }

    Ok(sum.map(|acc| {
        acc.into_iter()
            .map(|v| (v / count as f64) as f32)
            .collect()
    }))
}

/// Counters from a profile rebuild
#[derive(Debug, Default, Clone, Copy)]
pub struct ProfileStats {
    pub users: usize,
    pub engaged_watches: usize,
}

/// Rebuilds every user's profile embedding: the mean media-space embedding
/// over watches whose engagement ratio clears the floor, upserted into
/// user_embeddings.
pub async fn build_user_profiles(pool: &PgPool, min_engagement: f32) -> AppResult<ProfileStats> {
    let rows: Vec<(String, Option<Vector>)> = sqlx::query_as(
        r#"
        SELECT wh.username, me.embedding
        FROM watch_history wh
        JOIN library l ON wh.rating_key = l.rating_key
        JOIN media_embeddings me ON me.rating_key = wh.rating_key
        WHERE l.duration > 0
          AND wh.played_duration IS NOT NULL
          AND (wh.played_duration::float8 / (l.duration::float8 / 1000.0)) > $1
        "#,
    )
    .bind(min_engagement as f64)
    .fetch_all(pool)
    .await?;

    let mut stats = ProfileStats::default();
    let mut per_user: HashMap<String, (Vec<f64>, usize)> = HashMap::new();
    for (username, embedding) in rows {
        let Some(vec) = embedding else { continue };
        let values = vec.as_slice();
        let entry = per_user
            .entry(username)
            .or_insert_with(|| (vec![0.0; values.len()], 0));
        if entry.0.len() != values.len() {
            continue;
        }
        for (slot, &v) in entry.0.iter_mut().zip(values) {
            *slot += v as f64;
        }
        entry.1 += 1;
        stats.engaged_watches += 1;
    }

    let mut tx = pool.begin().await?;
    for (username, (sum, count)) in per_user {
        if count == 0 {
            continue;
        }
        let mean: Vec<f32> = sum.iter().map(|v| (v / count as f64) as f32).collect();
        sqlx::query(
            r#"
            INSERT INTO user_embeddings (username, embedding)
            VALUES ($1, $2)
            ON CONFLICT (username) DO UPDATE SET embedding = EXCLUDED.embedding
            "#,
        )
        .bind(&username)
        .bind(Vector::from(mean))
        .execute(&mut *tx)
        .await?;
        stats.users += 1;
    }
    tx.commit().await?;

    tracing::info!(
        users = stats.users,
        engaged_watches = stats.engaged_watches,
        "User profile embeddings rebuilt"
    );
    Ok(stats)
}
