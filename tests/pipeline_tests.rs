use chrono::Utc;
use ndarray::Array2;
use pgvector::Vector;
use uuid::Uuid;

use reelrank::model::{Classifier, GbdtModel, ModelArtifact, TrainParams};
use reelrank::models::{CandidateRow, MediaType, WatchLabelRow};
use reelrank::services::attribution::attribution_rows;
use reelrank::services::encoder::{self, EncodeRecord, Vocabulary, VOCABULARY_VERSION};
use reelrank::services::labels::{label_watch_row, LabelPolicy, RowOutcome};
use reelrank::services::scoring::{assign_ranks, prepare_candidates};

const MEDIA_DIM: usize = 2;
const USER_DIM: usize = 2;

fn policy() -> LabelPolicy {
    LabelPolicy {
        engagement_threshold: 0.7,
        negative_threshold: 0.5,
        feedback_bonus: 0.1,
    }
}

fn watch_row(
    rating_key: i64,
    played_minutes: f64,
    media_minutes: f64,
    feedback: Option<&str>,
    media_embedding: Vec<f32>,
) -> WatchLabelRow {
    WatchLabelRow {
        username: "alice".to_string(),
        rating_key,
        rewatch_count: 1,
        played_duration: Some(played_minutes * 60.0),
        media_duration: Some(media_minutes * 60.0 * 1000.0),
        release_year: Some(1995),
        season_number: None,
        episode_number: None,
        genre_tags: Some("Drama, Crime".to_string()),
        actor_tags: None,
        director_tags: None,
        media_embedding: Some(Vector::from(media_embedding)),
        user_embedding: Some(Vector::from(vec![0.5, 0.5])),
        feedback: feedback.map(str::to_string),
    }
}

fn vocabulary() -> Vocabulary {
    Vocabulary {
        version: VOCABULARY_VERSION,
        top_k: 20,
        genres: vec!["Drama".to_string(), "Crime".to_string()],
        actors: vec![],
        directors: vec![],
        decades: vec![1990],
    }
}

fn record_for_example(
    example: &reelrank::models::TrainingExample,
    watch_sim: f32,
) -> EncodeRecord {
    let combined = &example.combined_embedding;
    EncodeRecord {
        media_embedding: combined[..MEDIA_DIM].to_vec(),
        user_embedding: combined[MEDIA_DIM..].to_vec(),
        genres: reelrank::models::split_tags(Some(example.genre_tags.as_str())),
        actors: reelrank::models::split_tags(Some(example.actor_tags.as_str())),
        directors: reelrank::models::split_tags(Some(example.director_tags.as_str())),
        year: example.release_year,
        watch_sim,
    }
}

fn fit_artifact(examples: &[reelrank::models::TrainingExample]) -> ModelArtifact {
    let vocabulary = vocabulary();
    let feature_names = encoder::feature_names(&vocabulary, MEDIA_DIM, USER_DIM);
    let width = feature_names.len();

    let mut flat = Vec::new();
    let mut y = Vec::new();
    let mut weights = Vec::new();
    for example in examples {
        flat.extend(encoder::encode(&record_for_example(example, 0.0), &vocabulary));
        y.push(example.label as f32);
        weights.push(example.sample_weight);
    }
    let x = Array2::from_shape_vec((examples.len(), width), flat).unwrap();
    let gbdt = GbdtModel::fit(&x, &y, &weights, &TrainParams::default()).unwrap();

    ModelArtifact {
        model_name: "gbdt_model".to_string(),
        model_id: Uuid::new_v4(),
        trained_at: Utc::now(),
        media_dim: MEDIA_DIM,
        user_dim: USER_DIM,
        vocabulary,
        feature_names,
        gbdt,
    }
}

/// Ambiguous watch is dropped from training until feedback flips it, then
/// the trained model scores an unwatched candidate into a valid rank-1 slot.
#[test]
fn test_ambiguous_watch_flips_on_feedback_then_scores() {
    // 55 of 100 minutes, no feedback: ambiguous, excluded from training
    let ambiguous = watch_row(101, 55.0, 100.0, None, vec![1.0, 0.0]);
    assert_eq!(label_watch_row(&ambiguous, &policy(), MEDIA_DIM, USER_DIM), RowOutcome::Ambiguous);

    // Thumbs-up on the same watch: labeled positive with the fixed weight
    let flipped = watch_row(101, 55.0, 100.0, Some("up"), vec![1.0, 0.0]);
    let RowOutcome::Example(positive) = label_watch_row(&flipped, &policy(), MEDIA_DIM, USER_DIM)
    else {
        panic!("thumbs-up row must be labeled");
    };
    assert_eq!(positive.label, 1);
    assert_eq!(positive.sample_weight, 2.0);
    assert!((positive.engagement_ratio - 0.65).abs() < 1e-5);

    // A disliked item gives the trainer both classes
    let disliked = watch_row(102, 90.0, 100.0, Some("down"), vec![0.0, 1.0]);
    let RowOutcome::Example(negative) = label_watch_row(&disliked, &policy(), MEDIA_DIM, USER_DIM)
    else {
        panic!("thumbs-down row must be labeled");
    };
    assert_eq!(negative.label, 0);
    assert_eq!(negative.sample_weight, 5.0);
    assert_eq!(negative.engagement_ratio, 0.0);

    let artifact = fit_artifact(&[positive, negative]);

    // Candidate B: unwatched movie sharing the vocabulary with item A
    let candidate = CandidateRow {
        rating_key: 301,
        media_type: "movie".to_string(),
        title: "B".to_string(),
        parent_rating_key: None,
        year: Some(1995),
        genre_tags: Some("Drama,Crime".to_string()),
        actor_tags: None,
        director_tags: None,
        media_embedding: Some(Vector::from(vec![1.0, 0.0])),
        user_embedding: Some(Vector::from(vec![0.5, 0.5])),
    };
    let mut prepared = prepare_candidates(&[candidate], MEDIA_DIM, USER_DIM, None);
    assert_eq!(prepared.items.len(), 1);

    let width = artifact.feature_names.len();
    let mut flat = Vec::new();
    for record in &prepared.records {
        flat.extend(encoder::encode(record, &artifact.vocabulary));
    }
    let x = Array2::from_shape_vec((1, width), flat).unwrap();
    let probabilities = artifact.predict_proba(&x).unwrap();

    assert!(probabilities[0] >= 0.0 && probabilities[0] <= 1.0);
    // The candidate resembles the liked item, not the disliked one
    assert!(probabilities[0] > 0.5);

    prepared.items[0].probability = probabilities[0];
    assign_ranks(&mut prepared.items);
    assert_eq!(prepared.items[0].rank, 1);
    assert_eq!(prepared.items[0].media_type, MediaType::Movie);
}

/// Encoding the same record against the same frozen vocabulary twice is
/// byte-identical, and an unknown tag cannot grow the vector.
#[test]
fn test_encoder_is_stable_across_calls() {
    let vocab = vocabulary();
    let record = EncodeRecord {
        media_embedding: vec![0.25, -0.5],
        user_embedding: vec![0.1, 0.9],
        genres: vec!["Crime".to_string(), "Documentary".to_string()],
        actors: vec![],
        directors: vec![],
        year: Some(1999),
        watch_sim: 0.3,
    };
    let first = encoder::encode(&record, &vocab);
    let second = encoder::encode(&record, &vocab);
    assert_eq!(first, second);
    assert_eq!(first.len(), vocab.encoded_width(MEDIA_DIM, USER_DIM));
}

/// Ranks stay a strict per-group permutation when probabilities tie, and
/// groups never share a rank sequence.
#[test]
fn test_mixed_group_ranking_is_a_permutation() {
    let rows: Vec<CandidateRow> = (0..6)
        .map(|i| CandidateRow {
            rating_key: 400 + i,
            media_type: if i % 2 == 0 { "movie" } else { "episode" }.to_string(),
            title: format!("title-{}", i),
            parent_rating_key: None,
            year: None,
            genre_tags: None,
            actor_tags: None,
            director_tags: None,
            media_embedding: Some(Vector::from(vec![1.0, 0.0])),
            user_embedding: Some(Vector::from(vec![1.0, 0.0])),
        })
        .collect();

    let mut prepared = prepare_candidates(&rows, MEDIA_DIM, USER_DIM, None);
    // Identical embeddings produce identical probabilities: all ties
    for item in prepared.items.iter_mut() {
        item.probability = 0.5;
    }
    assign_ranks(&mut prepared.items);

    for media_type in [MediaType::Movie, MediaType::Episode] {
        let mut ranks: Vec<i32> = prepared
            .items
            .iter()
            .filter(|i| i.media_type == media_type)
            .map(|i| i.rank)
            .collect();
        ranks.sort_unstable();
        assert_eq!(ranks, vec![1, 2, 3]);
    }

    // Ties resolved by retrieval order: first movie retrieved ranks first
    let movie_keys: Vec<i64> = {
        let mut movies: Vec<_> = prepared
            .items
            .iter()
            .filter(|i| i.media_type == MediaType::Movie)
            .collect();
        movies.sort_by_key(|i| i.rank);
        movies.iter().map(|i| i.rating_key).collect()
    };
    assert_eq!(movie_keys, vec![400, 402, 404]);
}

/// A fitted ensemble's attribution rows stay inside the embedding index
/// range even when a categorical column dominates the prediction.
#[test]
fn test_attribution_restricted_to_embedding_dimensions() {
    // Label is decided entirely by the genre column
    let vocab = vocabulary();
    let feature_names = encoder::feature_names(&vocab, MEDIA_DIM, USER_DIM);
    let width = feature_names.len();

    let mut flat = Vec::new();
    let mut y = Vec::new();
    for i in 0..8 {
        let liked = i % 2 == 0;
        let record = EncodeRecord {
            media_embedding: vec![0.5, 0.5],
            user_embedding: vec![0.5, 0.5],
            genres: if liked { vec!["Drama".to_string()] } else { vec![] },
            actors: vec![],
            directors: vec![],
            year: None,
            watch_sim: 0.0,
        };
        flat.extend(encoder::encode(&record, &vocab));
        y.push(if liked { 1.0 } else { 0.0 });
    }
    let x = Array2::from_shape_vec((8, width), flat).unwrap();
    let weights = vec![1.0; 8];
    let gbdt = GbdtModel::fit(&x, &y, &weights, &TrainParams::default()).unwrap();

    let artifact = ModelArtifact {
        model_name: "gbdt_model".to_string(),
        model_id: Uuid::new_v4(),
        trained_at: Utc::now(),
        media_dim: MEDIA_DIM,
        user_dim: USER_DIM,
        vocabulary: vocab,
        feature_names,
        gbdt,
    };

    let items: Vec<_> = (0..8)
        .map(|i| reelrank::services::scoring::ScoredItem {
            source_index: i,
            rating_key: 500 + i as i64,
            media_type: MediaType::Movie,
            probability: 0.5,
            cosine_similarity: 0.0,
            rank: 0,
        })
        .collect();

    let embedding_len = MEDIA_DIM + USER_DIM;
    let rows = attribution_rows(&artifact, &x, &items, embedding_len, 3, 8).unwrap();
    for row in &rows {
        assert!((row.dimension as usize) < embedding_len);
    }
}
