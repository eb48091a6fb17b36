use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use async_trait::async_trait;
use pgvector::Vector;
use redis::{AsyncCommands, Client as RedisClient};
use reqwest::Client as HttpClient;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::error::{AppError, AppResult};

const CACHE_TTL: u64 = 604_800; // 1 week in seconds
const MAX_RETRIES: u32 = 3;
const BACKOFF_BASE_MS: u64 = 1_000;

/// Text-to-vector capability consumed by the backfill entry point
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embeds a batch of texts, preserving order and length
    async fn embed_batch(&self, texts: &[String]) -> AppResult<Vec<Vec<f32>>>;
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbedResponse {
    #[serde(default)]
    embeddings: Vec<Vec<f32>>,
}

/// Client for an Ollama-compatible embedding endpoint, with per-text Redis
/// caching and exponential-backoff retries
pub struct OllamaClient {
    http_client: HttpClient,
    redis_client: RedisClient,
    base_url: String,
    model: String,
}

impl OllamaClient {
    pub fn new(redis_client: RedisClient, base_url: String, model: String) -> Self {
        Self {
            http_client: HttpClient::new(),
            redis_client,
            base_url,
            model,
        }
    }

    fn cache_key(&self, text: &str) -> String {
        let mut hasher = DefaultHasher::new();
        text.hash(&mut hasher);
        format!("embed:{}:{:x}", self.model, hasher.finish())
    }

    async fn get_cached(&self, text: &str) -> AppResult<Option<Vec<f32>>> {
        let mut conn = self.redis_client.get_multiplexed_async_connection().await?;
        let cached: Option<String> = conn.get(self.cache_key(text)).await.map_err(|e| {
            tracing::warn!(error = %e, "Redis get failed");
            e
        })?;
        match cached {
            Some(json) => {
                let vector: Vec<f32> = serde_json::from_str(&json).map_err(|e| {
                    AppError::Internal(format!("Cache deserialization error: {}", e))
                })?;
                Ok(Some(vector))
            }
            None => Ok(None),
        }
    }

    async fn store_cached(&self, text: &str, vector: &[f32]) -> AppResult<()> {
        let json = serde_json::to_string(vector)
            .map_err(|e| AppError::Internal(format!("Cache serialization error: {}", e)))?;
        let mut conn = self.redis_client.get_multiplexed_async_connection().await?;
        let _: () = conn
            .set_ex(self.cache_key(text), json, CACHE_TTL)
            .await
            .map_err(|e| {
                tracing::warn!(error = %e, "Redis set failed");
                e
            })?;
        Ok(())
    }

    /// One embedding request with retries; service failures after the last
    /// retry are fatal for the run
    async fn call_api(&self, texts: &[String]) -> AppResult<Vec<Vec<f32>>> {
        let url = format!("{}/api/embed", self.base_url);
        let mut attempt = 0u32;
        loop {
            let result = self
                .http_client
                .post(&url)
                .json(&EmbedRequest {
                    model: &self.model,
                    input: texts,
                })
                .send()
                .await;

            match result {
                Ok(response) if response.status().is_success() => {
                    let parsed: EmbedResponse = response.json().await?;
                    if parsed.embeddings.len() != texts.len() {
                        return Err(AppError::Embedding(format!(
                            "service returned {} vectors for {} texts",
                            parsed.embeddings.len(),
                            texts.len()
                        )));
                    }
                    return Ok(parsed.embeddings);
                }
                Ok(response) => {
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();
                    if attempt >= MAX_RETRIES {
                        return Err(AppError::Embedding(format!(
                            "service returned status {}: {}",
                            status, body
                        )));
                    }
                    tracing::warn!(%status, attempt, "Embedding request failed, retrying");
                }
                Err(e) => {
                    if attempt >= MAX_RETRIES {
                        return Err(AppError::Embedding(format!("service unreachable: {}", e)));
                    }
                    tracing::warn!(error = %e, attempt, "Embedding request failed, retrying");
                }
            }

            attempt += 1;
            tokio::time::sleep(Duration::from_millis(
                BACKOFF_BASE_MS * 2u64.pow(attempt - 1),
            ))
            .await;
        }
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaClient {
    async fn embed_batch(&self, texts: &[String]) -> AppResult<Vec<Vec<f32>>> {
        let mut results: Vec<Option<Vec<f32>>> = vec![None; texts.len()];
        let mut misses: Vec<usize> = Vec::new();

        for (i, text) in texts.iter().enumerate() {
            match self.get_cached(text).await? {
                Some(vector) => results[i] = Some(vector),
                None => misses.push(i),
            }
        }
        tracing::debug!(
            total = texts.len(),
            cache_hits = texts.len() - misses.len(),
            "Embedding batch cache lookup"
        );

        if !misses.is_empty() {
            let miss_texts: Vec<String> = misses.iter().map(|&i| texts[i].clone()).collect();
            let vectors = self.call_api(&miss_texts).await?;
            for (&i, vector) in misses.iter().zip(vectors) {
                self.store_cached(&texts[i], &vector).await?;
                results[i] = Some(vector);
            }
        }

        results
            .into_iter()
            .map(|slot| {
                slot.ok_or_else(|| AppError::Internal("embedding slot left unfilled".to_string()))
            })
            .collect()
    }
}

/// Counters from an embedding backfill
#[derive(Debug, Default, Clone, Copy)]
pub struct EmbedStats {
    pub embedded: usize,
}

#[derive(Debug, sqlx::FromRow)]
struct MissingMediaRow {
    rating_key: i64,
    title: Option<String>,
    summary: Option<String>,
}

/// Embeds library items that have no media embedding yet, one transaction
/// per request batch so completed batches survive a later failure.
pub async fn embed_missing_media(
    pool: &PgPool,
    provider: &dyn EmbeddingProvider,
    batch_size: usize,
) -> AppResult<EmbedStats> {
    let missing = sqlx::query_as::<_, MissingMediaRow>(
        r#"
        SELECT l.rating_key, l.title, l.summary
        FROM library l
        LEFT JOIN media_embeddings me ON me.rating_key = l.rating_key
        WHERE me.rating_key IS NULL
        ORDER BY l.rating_key
        "#,
    )
    .fetch_all(pool)
    .await?;

    if missing.is_empty() {
        tracing::info!("No library items missing embeddings");
        return Ok(EmbedStats::default());
    }
    tracing::info!(missing = missing.len(), "Embedding library items");

    let mut stats = EmbedStats::default();
    for chunk in missing.chunks(batch_size.max(1)) {
        let texts: Vec<String> = chunk.iter().map(media_embedding_text).collect();
        let vectors = provider.embed_batch(&texts).await?;

        let mut tx = pool.begin().await?;
        for (row, vector) in chunk.iter().zip(vectors) {
            sqlx::query(
                r#"
                INSERT INTO media_embeddings (rating_key, embedding)
                VALUES ($1, $2)
                ON CONFLICT (rating_key) DO UPDATE SET embedding = EXCLUDED.embedding
                "#,
            )
            .bind(row.rating_key)
            .bind(Vector::from(vector))
            .execute(&mut *tx)
            .await?;
            stats.embedded += 1;
        }
        tx.commit().await?;
    }

    tracing::info!(embedded = stats.embedded, "Embedding backfill complete");
    Ok(stats)
}

fn media_embedding_text(row: &MissingMediaRow) -> String {
    let title = row.title.as_deref().unwrap_or_default();
    let summary = row.summary.as_deref().unwrap_or_default();
    if summary.is_empty() {
        title.to_string()
    } else {
        format!("{}\n{}", title, summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_media_embedding_text_handles_missing_summary() {
        let row = MissingMediaRow {
            rating_key: 1,
            title: Some("Heat".to_string()),
            summary: None,
        };
        assert_eq!(media_embedding_text(&row), "Heat");

        let row = MissingMediaRow {
            rating_key: 2,
            title: Some("Heat".to_string()),
            summary: Some("A heist drama.".to_string()),
        };
        assert_eq!(media_embedding_text(&row), "Heat\nA heist drama.");
    }

    #[tokio::test]
    async fn test_mock_provider_preserves_order() {
        let mut provider = MockEmbeddingProvider::new();
        provider.expect_embed_batch().returning(|texts| {
            Ok(texts
                .iter()
                .enumerate()
                .map(|(i, _)| vec![i as f32])
                .collect())
        });
        let out = provider
            .embed_batch(&["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert_eq!(out, vec![vec![0.0], vec![1.0]]);
    }
}
