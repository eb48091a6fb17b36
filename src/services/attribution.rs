use ndarray::Array2;
use sqlx::PgPool;

use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::model::Classifier;
use crate::services::scoring::ScoredItem;

/// One attribution value bound for upsert
#[derive(Debug, Clone, PartialEq)]
pub struct AttributionUpsert {
    pub rating_key: i64,
    pub dimension: i32,
    pub value: f32,
}

/// Top dimensions of one contribution row by absolute magnitude, restricted
/// to the combined-embedding index range. Categorical and decade
/// contributions are computed by the classifier but never persisted.
pub fn top_attributions(
    contributions: &[f32],
    embedding_len: usize,
    top_n: usize,
) -> Vec<(usize, f32)> {
    if top_n == 0 {
        return Vec::new();
    }
    let limit = embedding_len.min(contributions.len());
    let mut dims: Vec<(usize, f32)> = contributions[..limit]
        .iter()
        .copied()
        .enumerate()
        .collect();
    dims.sort_by(|a, b| {
        b.1.abs()
            .partial_cmp(&a.1.abs())
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    dims.truncate(top_n);
    dims
}

/// Computes the attribution rows for the top-scored slice of a user's
/// candidates: slice selection by descending probability, one `explain`
/// call over the sliced matrix, then per-row dimension filtering.
pub fn attribution_rows(
    classifier: &dyn Classifier,
    x: &Array2<f32>,
    items: &[ScoredItem],
    embedding_len: usize,
    top_n: usize,
    max_items: usize,
) -> AppResult<Vec<AttributionUpsert>> {
    if max_items == 0 || items.is_empty() {
        return Ok(Vec::new());
    }

    let mut order: Vec<usize> = (0..items.len()).collect();
    order.sort_by(|&a, &b| {
        items[b]
            .probability
            .partial_cmp(&items[a].probability)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    order.truncate(max_items);

    let width = x.ncols();
    let mut flat = Vec::with_capacity(order.len() * width);
    for &idx in &order {
        flat.extend(x.row(items[idx].source_index).iter().copied());
    }
    let x_top = Array2::from_shape_vec((order.len(), width), flat)
        .map_err(|e| AppError::Internal(format!("attribution matrix shape: {}", e)))?;

    let contributions = classifier.explain(&x_top)?;

    let mut rows = Vec::new();
    for (pos, &idx) in order.iter().enumerate() {
        let row = contributions.row(pos).to_vec();
        for (dimension, value) in top_attributions(&row, embedding_len, top_n) {
            rows.push(AttributionUpsert {
                rating_key: items[idx].rating_key,
                dimension: dimension as i32,
                value,
            });
        }
    }
    Ok(rows)
}

/// Persists one user's attribution batch. The TTL sweep for that user's
/// stale rows shares the transaction with the upserts; the upsert only
/// touches `modified_at` when the stored value actually changed, so
/// rerunning with unchanged inputs leaves timestamps alone.
pub async fn write_user_attribution(
    pool: &PgPool,
    classifier: &dyn Classifier,
    config: &Config,
    username: &str,
    x: &Array2<f32>,
    items: &[ScoredItem],
    embedding_len: usize,
) -> AppResult<usize> {
    if config.attribution_max_items == 0 {
        tracing::info!(username, "Attribution disabled");
        return Ok(0);
    }

    let rows = attribution_rows(
        classifier,
        x,
        items,
        embedding_len,
        config.attribution_top_dims,
        config.attribution_max_items,
    )?;

    let mut tx = pool.begin().await?;
    let prune_sql = format!(
        "DELETE FROM shap_impact WHERE user_id = $1 AND modified_at < now() - INTERVAL '{} days'",
        config.attribution_prune_days
    );
    let pruned = sqlx::query(&prune_sql)
        .bind(username)
        .execute(&mut *tx)
        .await?
        .rows_affected();

    for row in &rows {
        sqlx::query(
            r#"
            INSERT INTO shap_impact (
                user_id, rating_key, dimension, shap_value, created_at, modified_at
            )
            VALUES ($1, $2, $3, $4, now(), now())
            ON CONFLICT (user_id, rating_key, dimension)
            DO UPDATE SET
                shap_value = EXCLUDED.shap_value,
                modified_at = now()
            WHERE shap_impact.shap_value IS DISTINCT FROM EXCLUDED.shap_value
            "#,
        )
        .bind(username)
        .bind(row.rating_key)
        .bind(row.dimension)
        .bind(row.value as f64)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;

    tracing::info!(
        username,
        pruned,
        written = rows.len(),
        "Attribution batch stored"
    );
    Ok(rows.len())
}
