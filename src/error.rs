/// Application-level errors
#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Cache error: {0}")]
    Cache(#[from] redis::RedisError),

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("Embedding service error: {0}")]
    Embedding(String),

    #[error("Model artifact error: {0}")]
    ModelArtifact(String),

    #[error(
        "Feature mismatch: encoded {actual} columns, model expects {expected} \
         (missing: [{}], extra: [{}])",
        missing.join(", "),
        extra.join(", ")
    )]
    FeatureMismatch {
        expected: usize,
        actual: usize,
        missing: Vec<String>,
        extra: Vec<String>,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type AppResult<T> = Result<T, AppError>;
