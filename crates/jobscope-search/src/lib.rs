//! Ranked retrieval over the knowledge store: a TF-IDF lexical index, an optional
//! embedding-backed semantic index and the coordinator that fuses them.

use serde::Serialize;
use thiserror::Error;

mod coordinator;
mod lexical;
mod semantic;
mod service;

pub use coordinator::{SearchCoordinator, DEFAULT_HYBRID_ALPHA};
pub use lexical::{tokenize, LexicalIndex, LexicalIndexEntry, LexicalStats};
pub use semantic::{
    cosine_similarity, EmbeddingBackend, OllamaEmbeddingBackend, SemanticIndex,
};
pub use service::KnowledgeService;

pub const CRATE_NAME: &str = "jobscope-search";

/// One ranked hit from an index, keyed by record fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredDoc {
    pub fingerprint: String,
    pub score: f64,
}

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("semantic index unavailable: {0}")]
    Unavailable(String),
    #[error("embedding backend error: {0}")]
    Backend(String),
}
