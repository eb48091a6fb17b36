pub mod attribution;
pub mod candidates;
pub mod embeddings;
pub mod encoder;
pub mod labels;
pub mod profile;
pub mod scoring;
pub mod trainer;

pub use embeddings::{EmbeddingProvider, OllamaClient};
pub use encoder::Vocabulary;
pub use labels::LabelPolicy;
