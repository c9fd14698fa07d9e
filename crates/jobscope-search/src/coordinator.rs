//! Fuses lexical and semantic candidates, enforces filters through the store and falls
//! back to the store's substring query when the ranked indices come up short.
//!
//! 1. Fetch `limit × 2` candidates from each available index.
//! 2. Min-max normalize each candidate set to `[0, 1]`.
//! 3. Merge: `score = (1 - α) × lexical + α × semantic` (α is 0 without semantic hits).
//! 4. Load the records, drop inactive ones and those failing the filters.
//! 5. Append store matches not already ranked, then truncate to `limit`.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use jobscope_core::{JobFilters, SearchResult, Subsystem};
use jobscope_storage::{KnowledgeStore, StorageError};
use tracing::debug;

use crate::{LexicalIndex, ScoredDoc, SemanticIndex};

pub const DEFAULT_HYBRID_ALPHA: f64 = 0.5;

pub struct SearchCoordinator {
    store: KnowledgeStore,
    lexical: Arc<LexicalIndex>,
    semantic: Option<Arc<SemanticIndex>>,
    alpha: f64,
}

fn normalize(candidates: &[ScoredDoc]) -> HashMap<&str, f64> {
    if candidates.is_empty() {
        return HashMap::new();
    }
    let min = candidates.iter().map(|c| c.score).fold(f64::INFINITY, f64::min);
    let max = candidates
        .iter()
        .map(|c| c.score)
        .fold(f64::NEG_INFINITY, f64::max);
    candidates
        .iter()
        .map(|c| {
            let norm = if (max - min).abs() < f64::EPSILON {
                1.0
            } else {
                (c.score - min) / (max - min)
            };
            (c.fingerprint.as_str(), norm)
        })
        .collect()
}

impl SearchCoordinator {
    pub fn new(
        store: KnowledgeStore,
        lexical: Arc<LexicalIndex>,
        semantic: Option<Arc<SemanticIndex>>,
    ) -> Self {
        Self {
            store,
            lexical,
            semantic,
            alpha: DEFAULT_HYBRID_ALPHA,
        }
    }

    pub fn with_alpha(mut self, alpha: f64) -> Self {
        self.alpha = alpha.clamp(0.0, 1.0);
        self
    }

    pub fn has_semantic(&self) -> bool {
        self.semantic.is_some()
    }

    pub async fn search(
        &self,
        query: &str,
        filters: &JobFilters,
        limit: usize,
    ) -> Result<Vec<SearchResult>, StorageError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let candidate_k = limit.saturating_mul(2);

        let lexical_hits = self.lexical.search(query, candidate_k).await;
        let semantic_hits = match &self.semantic {
            Some(index) => match index.search(query, candidate_k).await {
                Ok(hits) => hits,
                Err(err) => {
                    index.note_unavailable(&err);
                    Vec::new()
                }
            },
            None => Vec::new(),
        };

        let alpha = if semantic_hits.is_empty() { 0.0 } else { self.alpha };
        let lexical_norm = normalize(&lexical_hits);
        let semantic_norm = normalize(&semantic_hits);

        let mut order = Vec::new();
        let mut seen = HashSet::new();
        for hit in lexical_hits.iter().chain(&semantic_hits) {
            if seen.insert(hit.fingerprint.clone()) {
                order.push(hit.fingerprint.clone());
            }
        }
        let records = self.store.get_many(&order).await?;

        let mut ranked = order
            .iter()
            .filter_map(|fingerprint| {
                let record = records.get(fingerprint)?;
                if !record.active || !filters.matches(record) {
                    return None;
                }
                let lexical = lexical_norm.get(fingerprint.as_str()).copied();
                let semantic = semantic_norm.get(fingerprint.as_str()).copied();
                let mut subsystems = Vec::new();
                if lexical.is_some() {
                    subsystems.push(Subsystem::Lexical);
                }
                if semantic.is_some() {
                    subsystems.push(Subsystem::Semantic);
                }
                let score =
                    (1.0 - alpha) * lexical.unwrap_or(0.0) + alpha * semantic.unwrap_or(0.0);
                Some(SearchResult {
                    record: record.clone(),
                    score,
                    subsystems,
                })
            })
            .collect::<Vec<_>>();

        ranked.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| b.record.collected_at.cmp(&a.record.collected_at))
                .then_with(|| a.record.fingerprint.cmp(&b.record.fingerprint))
        });
        ranked.truncate(limit);

        let from_indices = ranked.len();
        if ranked.len() < limit {
            let present = ranked
                .iter()
                .map(|r| r.record.fingerprint.clone())
                .collect::<HashSet<_>>();
            for record in self.store.query(query, filters, limit).await? {
                if ranked.len() >= limit {
                    break;
                }
                if present.contains(&record.fingerprint) {
                    continue;
                }
                ranked.push(SearchResult {
                    record,
                    score: 0.0,
                    subsystems: vec![Subsystem::Store],
                });
            }
        }

        debug!(
            query,
            lexical = lexical_hits.len(),
            semantic = semantic_hits.len(),
            from_indices,
            returned = ranked.len(),
            "search complete"
        );
        Ok(ranked)
    }
}
