use sqlx::PgPool;

use crate::error::AppResult;
use crate::models::CandidateRow;

/// Fetches the scorable items for one user: movies and episodes with no
/// watch event meeting the already-watched bar and no suppressing feedback.
///
/// The watched bar accepts either signal the analytics source provides:
/// a percent_complete at or above the threshold (values stored as 0-100
/// are normalized to 0-1 first), or a played/duration ratio at or above
/// the same threshold.
pub async fn fetch_candidates(
    pool: &PgPool,
    username: &str,
    watched_threshold: f32,
) -> AppResult<Vec<CandidateRow>> {
    let rows = sqlx::query_as::<_, CandidateRow>(
        r#"
        SELECT
            m.rating_key,
            m.media_type,
            m.title,
            m.parent_rating_key,
            m.year,
            g.genre_tags,
            a.actor_tags,
            d.director_tags,
            e.embedding AS media_embedding,
            ue.embedding AS user_embedding
        FROM library m
        JOIN media_embeddings e ON m.rating_key = e.rating_key
        JOIN user_embeddings ue ON ue.username = $1
        LEFT JOIN watch_history w
            ON m.rating_key = w.rating_key
            AND w.username = $1
            AND (
                (
                    w.percent_complete IS NOT NULL
                    AND (
                        CASE
                            WHEN w.percent_complete > 1 THEN w.percent_complete / 100.0
                            ELSE w.percent_complete
                        END
                    ) >= $2
                )
                OR (
                    w.played_duration IS NOT NULL
                    AND m.duration IS NOT NULL
                    AND m.duration > 0
                    AND (w.played_duration::float8 / (m.duration::float8 / 1000.0)) >= $2
                )
            )
        LEFT JOIN (
            SELECT mg.media_id, STRING_AGG(g.name, ',') AS genre_tags
            FROM media_genres mg
            JOIN genres g ON mg.genre_id = g.id
            GROUP BY mg.media_id
        ) g ON g.media_id = m.rating_key
        LEFT JOIN (
            SELECT ma.media_id, STRING_AGG(a.name, ',') AS actor_tags
            FROM media_actors ma
            JOIN actors a ON ma.actor_id = a.id
            GROUP BY ma.media_id
        ) a ON a.media_id = m.rating_key
        LEFT JOIN (
            SELECT md.media_id, STRING_AGG(d.name, ',') AS director_tags
            FROM media_directors md
            JOIN directors d ON md.director_id = d.id
            GROUP BY md.media_id
        ) d ON d.media_id = m.rating_key
        WHERE w.rating_key IS NULL
          AND m.media_type IN ('movie', 'episode')
          AND NOT EXISTS (
              SELECT 1
              FROM user_feedback f
              WHERE f.username = $1
                AND f.rating_key = m.rating_key
                AND f.suppress = true
          )
        "#,
    )
    .bind(username)
    .bind(watched_threshold as f64)
    .fetch_all(pool)
    .await?;

    tracing::info!(
        username,
        candidates = rows.len(),
        "Candidates remaining after watched and suppression filters"
    );
    Ok(rows)
}

/// Usernames eligible for an all-users scoring run
pub async fn fetch_usernames(pool: &PgPool) -> AppResult<Vec<String>> {
    let rows: Vec<(String,)> =
        sqlx::query_as("SELECT DISTINCT username FROM watch_history ORDER BY username")
            .fetch_all(pool)
            .await?;
    Ok(rows.into_iter().map(|(u,)| u).collect())
}
