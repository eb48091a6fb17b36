use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};

/// Schema version of the persisted vocabulary artifact
pub const VOCABULARY_VERSION: u32 = 1;

/// Categorical vocabulary frozen at training time and persisted inside the
/// model artifact. Scoring loads this artifact and never re-derives the
/// vocabulary from live catalog state, so train-time and score-time feature
/// construction cannot drift.
///
/// The vocabulary is closed: tags and decades outside it are silently
/// dropped at encoding time. This loses expressiveness as the catalog grows
/// and is a documented limitation, not an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vocabulary {
    pub version: u32,
    pub top_k: usize,
    pub genres: Vec<String>,
    pub actors: Vec<String>,
    pub directors: Vec<String>,
    pub decades: Vec<i32>,
}

impl Vocabulary {
    /// Freezes the top-K tags per category by frequency (ties broken
    /// alphabetically for determinism) and the set of decades present.
    pub fn freeze(
        genre_lists: &[Vec<String>],
        actor_lists: &[Vec<String>],
        director_lists: &[Vec<String>],
        years: &[Option<i32>],
        top_k: usize,
    ) -> Self {
        let mut decades: Vec<i32> = years
            .iter()
            .filter_map(|y| y.map(decade_bucket))
            .collect();
        decades.sort_unstable();
        decades.dedup();

        Self {
            version: VOCABULARY_VERSION,
            top_k,
            genres: top_tags(genre_lists, top_k),
            actors: top_tags(actor_lists, top_k),
            directors: top_tags(director_lists, top_k),
            decades,
        }
    }

    /// Total encoded width for the given embedding dimensions
    pub fn encoded_width(&self, media_dim: usize, user_dim: usize) -> usize {
        media_dim
            + user_dim
            + self.genres.len()
            + self.actors.len()
            + self.directors.len()
            + self.decades.len()
            + 1 // watch_sim
    }
}

fn top_tags(lists: &[Vec<String>], top_k: usize) -> Vec<String> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for list in lists {
        for tag in list {
            *counts.entry(tag.as_str()).or_insert(0) += 1;
        }
    }
    let mut ranked: Vec<(&str, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    ranked
        .into_iter()
        .take(top_k)
        .map(|(tag, _)| tag.to_string())
        .collect()
}

fn decade_bucket(year: i32) -> i32 {
    year / 10 * 10
}

/// Raw (item, user) record presented to the encoder
#[derive(Debug, Clone)]
pub struct EncodeRecord {
    pub media_embedding: Vec<f32>,
    pub user_embedding: Vec<f32>,
    pub genres: Vec<String>,
    pub actors: Vec<String>,
    pub directors: Vec<String>,
    pub year: Option<i32>,
    /// Cosine similarity of the media embedding against the user's
    /// watch-profile vector; 0.0 when the user has no qualifying profile
    pub watch_sim: f32,
}

/// Deterministic encoding of a record against a frozen vocabulary.
///
/// Fixed order: combined embedding (media ++ user, unchanged), multi-hot
/// genre/actor/director blocks, decade indicators, watch-similarity scalar.
/// Invoked identically by the trainer and the scorer; this is the single
/// shared definition of the feature layout.
pub fn encode(record: &EncodeRecord, vocab: &Vocabulary) -> Vec<f32> {
    let mut out = Vec::with_capacity(
        vocab.encoded_width(record.media_embedding.len(), record.user_embedding.len()),
    );
    out.extend_from_slice(&record.media_embedding);
    out.extend_from_slice(&record.user_embedding);
    extend_multi_hot(&mut out, &record.genres, &vocab.genres);
    extend_multi_hot(&mut out, &record.actors, &vocab.actors);
    extend_multi_hot(&mut out, &record.directors, &vocab.directors);
    for &decade in &vocab.decades {
        let hit = record.year.map(decade_bucket) == Some(decade);
        out.push(if hit { 1.0 } else { 0.0 });
    }
    out.push(record.watch_sim);
    out
}

fn extend_multi_hot(out: &mut Vec<f32>, tags: &[String], vocabulary: &[String]) {
    for known in vocabulary {
        let hit = tags.iter().any(|t| t == known);
        out.push(if hit { 1.0 } else { 0.0 });
    }
}

/// Ordered feature-name list for a vocabulary and embedding dimensions.
/// Must mirror `encode` exactly; the trainer stores this list in the model
/// artifact and the scorer validates against it before predicting.
pub fn feature_names(vocab: &Vocabulary, media_dim: usize, user_dim: usize) -> Vec<String> {
    let mut names = Vec::with_capacity(vocab.encoded_width(media_dim, user_dim));
    for i in 0..media_dim + user_dim {
        names.push(format!("emb_{}", i));
    }
    for tag in &vocab.genres {
        names.push(format!("genre_{}", tag));
    }
    for tag in &vocab.actors {
        names.push(format!("actor_{}", tag));
    }
    for tag in &vocab.directors {
        names.push(format!("director_{}", tag));
    }
    for decade in &vocab.decades {
        names.push(format!("is_{}s", decade));
    }
    names.push("watch_sim".to_string());
    names
}

/// Validates that the encoder's feature list matches the model's declared
/// list. A mismatch is a hard error naming the offending columns; the
/// matrix is never silently padded or truncated to fit.
pub fn check_contract(expected: &[String], actual: &[String]) -> AppResult<()> {
    if expected == actual {
        return Ok(());
    }
    let missing: Vec<String> = expected
        .iter()
        .filter(|name| !actual.contains(name))
        .cloned()
        .collect();
    let extra: Vec<String> = actual
        .iter()
        .filter(|name| !expected.contains(name))
        .cloned()
        .collect();
    Err(AppError::FeatureMismatch {
        expected: expected.len(),
        actual: actual.len(),
        missing,
        extra,
    })
}

/// Cosine similarity; 0.0 when either vector has zero norm or lengths differ
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vocab() -> Vocabulary {
        Vocabulary {
            version: VOCABULARY_VERSION,
            top_k: 2,
            genres: vec!["Drama".to_string(), "Crime".to_string()],
            actors: vec!["A One".to_string()],
            directors: vec!["D One".to_string()],
            decades: vec![1990, 2000],
        }
    }

    fn record() -> EncodeRecord {
        EncodeRecord {
            media_embedding: vec![0.1, 0.2],
            user_embedding: vec![0.3, 0.4],
            genres: vec!["Crime".to_string()],
            actors: vec![],
            directors: vec!["D One".to_string()],
            year: Some(1994),
            watch_sim: 0.5,
        }
    }

    #[test]
    fn test_encode_layout_and_order() {
        let encoded = encode(&record(), &vocab());
        assert_eq!(
            encoded,
            vec![
                0.1, 0.2, 0.3, 0.4, // combined embedding
                0.0, 1.0, // genres: Drama, Crime
                0.0, // actors: A One
                1.0, // directors: D One
                1.0, 0.0, // decades: 1990s, 2000s
                0.5, // watch_sim
            ]
        );
    }

    #[test]
    fn test_encode_is_idempotent() {
        let v = vocab();
        let r = record();
        assert_eq!(encode(&r, &v), encode(&r, &v));
    }

    #[test]
    fn test_unknown_tags_are_dropped_not_added() {
        let v = vocab();
        let mut r = record();
        r.genres = vec!["Horror".to_string()];
        let encoded = encode(&r, &v);
        assert_eq!(encoded.len(), v.encoded_width(2, 2));
        assert_eq!(&encoded[4..6], &[0.0, 0.0]);
    }

    #[test]
    fn test_unknown_decade_produces_no_set_bit() {
        let v = vocab();
        let mut r = record();
        r.year = Some(1975);
        let encoded = encode(&r, &v);
        assert_eq!(&encoded[8..10], &[0.0, 0.0]);
    }

    #[test]
    fn test_missing_year_produces_no_set_bit() {
        let v = vocab();
        let mut r = record();
        r.year = None;
        let encoded = encode(&r, &v);
        assert_eq!(&encoded[8..10], &[0.0, 0.0]);
    }

    #[test]
    fn test_empty_tag_sets_yield_zero_blocks() {
        let v = vocab();
        let r = EncodeRecord {
            media_embedding: vec![0.0, 0.0],
            user_embedding: vec![0.0, 0.0],
            genres: vec![],
            actors: vec![],
            directors: vec![],
            year: None,
            watch_sim: 0.0,
        };
        let encoded = encode(&r, &v);
        assert_eq!(&encoded[4..8], &[0.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_feature_names_mirror_encode_width() {
        let v = vocab();
        let names = feature_names(&v, 2, 2);
        assert_eq!(names.len(), encode(&record(), &v).len());
        assert_eq!(names[0], "emb_0");
        assert_eq!(names[4], "genre_Drama");
        assert_eq!(names[8], "is_1990s");
        assert_eq!(names.last().map(String::as_str), Some("watch_sim"));
    }

    #[test]
    fn test_freeze_keeps_top_k_by_frequency() {
        let genres = vec![
            vec!["Drama".to_string(), "Crime".to_string()],
            vec!["Drama".to_string()],
            vec!["Horror".to_string()],
        ];
        let v = Vocabulary::freeze(&genres, &[], &[], &[Some(1994), Some(1999), Some(2003)], 2);
        // Drama (2) then Crime/Horror tied (1) -> alphabetical
        assert_eq!(v.genres, vec!["Drama", "Crime"]);
        assert_eq!(v.decades, vec![1990, 2000]);
    }

    #[test]
    fn test_check_contract_names_missing_and_extra() {
        let expected = vec!["emb_0".to_string(), "watch_sim".to_string()];
        let actual = vec!["emb_0".to_string(), "genre_Drama".to_string()];
        let err = check_contract(&expected, &actual).unwrap_err();
        match err {
            AppError::FeatureMismatch {
                expected,
                actual,
                missing,
                extra,
            } => {
                assert_eq!(expected, 2);
                assert_eq!(actual, 2);
                assert_eq!(missing, vec!["watch_sim"]);
                assert_eq!(extra, vec!["genre_Drama"]);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_cosine_similarity_edge_cases() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
        let sim = cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]);
        assert!((sim - 1.0).abs() < 1e-6);
    }
}
