use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Display;

/// Media item kind as stored in the library catalog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Movie,
    Show,
    Season,
    Episode,
}

impl MediaType {
    /// Parses the catalog's text column; unknown kinds are rejected
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "movie" => Some(MediaType::Movie),
            "show" => Some(MediaType::Show),
            "season" => Some(MediaType::Season),
            "episode" => Some(MediaType::Episode),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::Movie => "movie",
            MediaType::Show => "show",
            MediaType::Season => "season",
            MediaType::Episode => "episode",
        }
    }
}

impl Display for MediaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Explicit feedback polarity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedbackPolarity {
    Up,
    Down,
}

impl FeedbackPolarity {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "up" => Some(FeedbackPolarity::Up),
            "down" => Some(FeedbackPolarity::Down),
            _ => None,
        }
    }
}

/// Watch-history row joined to library duration, embeddings, and feedback,
/// as fetched by the label builder. Rewatch count comes from grouping.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct WatchLabelRow {
    pub username: String,
    pub rating_key: i64,
    pub rewatch_count: i64,
    pub played_duration: Option<f64>,
    pub media_duration: Option<f64>,
    pub release_year: Option<i32>,
    pub season_number: Option<i32>,
    pub episode_number: Option<i32>,
    pub genre_tags: Option<String>,
    pub actor_tags: Option<String>,
    pub director_tags: Option<String>,
    pub media_embedding: Option<pgvector::Vector>,
    pub user_embedding: Option<pgvector::Vector>,
    pub feedback: Option<String>,
}

/// Feedback row with no corresponding watch event
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FeedbackOnlyRow {
    pub username: String,
    pub rating_key: i64,
    pub feedback: String,
    pub release_year: Option<i32>,
    pub genre_tags: Option<String>,
    pub actor_tags: Option<String>,
    pub director_tags: Option<String>,
    pub media_embedding: Option<pgvector::Vector>,
    pub user_embedding: Option<pgvector::Vector>,
}

/// Weighted binary example produced by the label builder
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingExample {
    pub username: String,
    pub rating_key: i64,
    pub label: i32,
    pub combined_embedding: Vec<f32>,
    pub genre_tags: String,
    pub actor_tags: String,
    pub director_tags: String,
    pub release_year: Option<i32>,
    pub season_number: Option<i32>,
    pub episode_number: Option<i32>,
    pub played_duration: Option<f64>,
    pub media_duration: Option<f64>,
    pub engagement_ratio: f32,
    pub sample_weight: f32,
}

/// Training example as read back by the trainer
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TrainingRow {
    pub username: String,
    pub rating_key: i64,
    pub label: i32,
    pub embedding: Option<pgvector::Vector>,
    pub genre_tags: Option<String>,
    pub actor_tags: Option<String>,
    pub director_tags: Option<String>,
    pub release_year: Option<i32>,
    pub sample_weight: f64,
}

/// Unwatched, unsuppressed item eligible for scoring, carrying the user's
/// current embedding and the item's aggregated tags
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CandidateRow {
    pub rating_key: i64,
    pub media_type: String,
    pub title: String,
    pub parent_rating_key: Option<i64>,
    pub year: Option<i32>,
    pub genre_tags: Option<String>,
    pub actor_tags: Option<String>,
    pub director_tags: Option<String>,
    pub media_embedding: Option<pgvector::Vector>,
    pub user_embedding: Option<pgvector::Vector>,
}

/// One scored row as persisted to the recommendations table
#[derive(Debug, Clone)]
pub struct Recommendation {
    pub username: String,
    pub rating_key: i64,
    pub predicted_probability: f32,
    pub model_name: String,
    pub scored_at: DateTime<Utc>,
    pub rank: i32,
    pub cosine_similarity: f32,
    pub explanation: String,
}

/// Splits an aggregated tag string ("Drama, Crime") into clean tag tokens.
/// Absent or empty aggregates yield an empty set, never an error.
pub fn split_tags(tags: Option<&str>) -> Vec<String> {
    match tags {
        Some(raw) => raw
            .split(',')
            .map(|t| t.trim())
            .filter(|t| !t.is_empty())
            .map(|t| t.to_string())
            .collect(),
        None => Vec::new(),
    }
}

/// Engagement ratio from a played duration in seconds and a catalog duration
/// in milliseconds. None when the catalog duration is missing or zero.
pub fn engagement_ratio(played_seconds: Option<f64>, duration_ms: Option<f64>) -> Option<f32> {
    let played = played_seconds?;
    let duration = duration_ms?;
    let media_minutes = duration / 1000.0 / 60.0;
    if media_minutes == 0.0 {
        return None;
    }
    let played_minutes = played / 60.0;
    Some((played_minutes / media_minutes) as f32)
}
