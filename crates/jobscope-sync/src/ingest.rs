//! Two-layer dedup in front of the knowledge store.
//!
//! Within a run, records sharing a title + company signature with an earlier record from
//! another source are collapsed before touching storage. The store then rejects fingerprints
//! it already holds. Neither case is an error: both are counted.

use std::collections::HashSet;
use std::sync::Arc;

use jobscope_core::JobRecord;
use jobscope_search::{LexicalIndex, SemanticIndex};
use jobscope_storage::{KnowledgeStore, StorageError, StoreOutcome};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::normalize::signature;

/// Per-run memory of what has already been accepted.
#[derive(Debug, Default)]
pub struct IngestSession {
    signatures: HashSet<String>,
    fingerprints: HashSet<String>,
}

impl IngestSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seen(&self) -> usize {
        self.fingerprints.len()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IngestReport {
    pub received: usize,
    pub inserted: usize,
    /// Already stored, or repeated within this run.
    pub duplicates: usize,
    /// Same title + company as an earlier record from another source in this run.
    pub collapsed: usize,
    /// Records the store refused. Each one is skipped; the batch carries on.
    pub failed: usize,
    pub errors: Vec<String>,
    /// Stored records left without a persisted vector; semantic search misses them until
    /// the next reindex.
    pub unembedded: usize,
    /// Records that survived the intra-run collapse, in input order.
    #[serde(skip)]
    pub accepted: Vec<JobRecord>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RebuildReport {
    pub documents: usize,
    pub vectors_loaded: usize,
    pub vectors_embedded: usize,
    pub embedding_failures: usize,
}

/// The only writer of the store and both indices.
#[derive(Clone)]
pub struct IngestPipeline {
    store: KnowledgeStore,
    lexical: Arc<LexicalIndex>,
    semantic: Option<Arc<SemanticIndex>>,
}

impl IngestPipeline {
    pub fn new(
        store: KnowledgeStore,
        lexical: Arc<LexicalIndex>,
        semantic: Option<Arc<SemanticIndex>>,
    ) -> Self {
        Self {
            store,
            lexical,
            semantic,
        }
    }

    pub fn store(&self) -> &KnowledgeStore {
        &self.store
    }

    pub fn lexical(&self) -> &Arc<LexicalIndex> {
        &self.lexical
    }

    pub fn semantic(&self) -> Option<&Arc<SemanticIndex>> {
        self.semantic.as_ref()
    }

    /// One-shot ingest with a fresh session.
    pub async fn ingest(&self, records: Vec<JobRecord>) -> IngestReport {
        let mut session = IngestSession::new();
        self.ingest_in(&mut session, records).await
    }

    /// Storage errors are per record: the failing record is counted in `failed` and
    /// forgotten by the session, and the next record is attempted.
    pub async fn ingest_in(
        &self,
        session: &mut IngestSession,
        records: Vec<JobRecord>,
    ) -> IngestReport {
        let mut report = IngestReport {
            received: records.len(),
            ..Default::default()
        };

        for record in records {
            if !session.fingerprints.insert(record.fingerprint.clone()) {
                report.duplicates += 1;
                continue;
            }
            let signature = signature(&record.title, &record.company);
            if !session.signatures.insert(signature.clone()) {
                debug!(
                    fingerprint = %record.fingerprint,
                    source_id = %record.source_id,
                    "collapsed cross-source repeat"
                );
                report.collapsed += 1;
                continue;
            }

            match self.store.store(&record).await {
                Ok(StoreOutcome::Inserted) => {
                    report.inserted += 1;
                    if !self.index(&record).await {
                        report.unembedded += 1;
                    }
                }
                Ok(StoreOutcome::Duplicate) => report.duplicates += 1,
                Err(err) => {
                    warn!(
                        fingerprint = %record.fingerprint,
                        source_id = %record.source_id,
                        error = %err,
                        "storing record failed"
                    );
                    session.fingerprints.remove(&record.fingerprint);
                    session.signatures.remove(&signature);
                    report.failed += 1;
                    report.errors.push(format!("{}: {err}", record.fingerprint));
                    continue;
                }
            }
            report.accepted.push(record);
        }

        report
    }

    /// A stored record stays stored even when its vector cannot be written; it is then
    /// only reachable lexically until the next rebuild embeds it. Returns false in that case.
    async fn index(&self, record: &JobRecord) -> bool {
        self.lexical.index(record).await;
        let Some(semantic) = &self.semantic else {
            return true;
        };
        match semantic.index(record).await {
            Ok(vector) => match self
                .store
                .store_embedding(&record.fingerprint, semantic.model_name(), &vector)
                .await
            {
                Ok(()) => true,
                Err(err) => {
                    warn!(
                        fingerprint = %record.fingerprint,
                        error = %err,
                        "persisting embedding failed"
                    );
                    false
                }
            },
            Err(err) => {
                semantic.note_unavailable(&err);
                false
            }
        }
    }

    /// Deactivates a stored posting and drops it from both indices.
    pub async fn retire(&self, fingerprint: &str) -> Result<bool, StorageError> {
        let changed = self.store.set_active(fingerprint, false).await?;
        self.lexical.remove(fingerprint).await;
        if let Some(semantic) = &self.semantic {
            semantic.remove(fingerprint).await;
        }
        Ok(changed)
    }

    /// Replays the active corpus into fresh indices. Stored vectors are reused; records
    /// without one are embedded when the backend answers.
    pub async fn rebuild_indexes(&self) -> Result<RebuildReport, StorageError> {
        let records = self.store.active_records().await?;
        let mut report = RebuildReport {
            documents: self.lexical.rebuild(&records).await,
            ..Default::default()
        };

        if let Some(semantic) = &self.semantic {
            semantic.clear().await;
            let stored = self.store.load_embeddings(semantic.model_name()).await?;
            let mut have = HashSet::new();
            for (fingerprint, vector) in stored {
                have.insert(fingerprint.clone());
                semantic.insert_vector(&fingerprint, vector).await;
                report.vectors_loaded += 1;
            }
            for record in records.iter().filter(|r| !have.contains(&r.fingerprint)) {
                match semantic.index(record).await {
                    Ok(vector) => {
                        self.store
                            .store_embedding(&record.fingerprint, semantic.model_name(), &vector)
                            .await?;
                        report.vectors_embedded += 1;
                    }
                    Err(err) => {
                        semantic.note_unavailable(&err);
                        report.embedding_failures += 1;
                    }
                }
            }
        }

        info!(
            documents = report.documents,
            vectors_loaded = report.vectors_loaded,
            vectors_embedded = report.vectors_embedded,
            "indexes rebuilt"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{normalized, refuse_inserts, KeywordBackend};
    use jobscope_core::JobFilters;

    async fn pipeline() -> IngestPipeline {
        let store = KnowledgeStore::open_in_memory().await.expect("store");
        IngestPipeline::new(store, Arc::new(LexicalIndex::new()), None)
    }

    #[tokio::test]
    async fn same_record_twice_is_stored_once() {
        let pipeline = pipeline().await;
        let record = normalized("wttj", "Data Engineer", "Qonto", "Spark et Python");

        let first = pipeline.ingest(vec![record.clone()]).await;
        assert_eq!((first.inserted, first.duplicates), (1, 0));

        let second = pipeline.ingest(vec![record]).await;
        assert_eq!((second.inserted, second.duplicates), (0, 1));
        assert_eq!(pipeline.store().stats().await.expect("stats").total_jobs, 1);
    }

    #[tokio::test]
    async fn cross_source_repeats_collapse_within_a_run() {
        let pipeline = pipeline().await;
        let mut session = IngestSession::new();
        let wttj = normalized("wttj", "Data Scientist Senior", "Qonto", "Python");
        let indeed = normalized("indeed", "Data  scientist senior", "QONTO", "Python, SQL");
        assert_ne!(wttj.fingerprint, indeed.fingerprint);

        let a = pipeline
            .ingest_in(&mut session, vec![wttj.clone(), wttj])
            .await;
        assert_eq!((a.inserted, a.duplicates, a.collapsed), (1, 1, 0));

        let b = pipeline
            .ingest_in(&mut session, vec![indeed])
            .await;
        assert_eq!((b.inserted, b.collapsed), (0, 1));
        assert!(b.accepted.is_empty());
        assert_eq!(pipeline.store().stats().await.expect("stats").total_jobs, 1);
        assert_eq!(session.seen(), 2);
    }

    #[tokio::test]
    async fn inserted_records_become_searchable_and_retire_removes_them() {
        let pipeline = pipeline().await;
        let record = normalized("wttj", "Platform Engineer", "Doctolib", "Kubernetes, Terraform");
        let fingerprint = record.fingerprint.clone();
        pipeline.ingest(vec![record]).await;

        let hits = pipeline.lexical().search("kubernetes", 5).await;
        assert_eq!(hits[0].fingerprint, fingerprint);

        assert!(pipeline.retire(&fingerprint).await.expect("retire"));
        assert!(pipeline.lexical().search("kubernetes", 5).await.is_empty());
        assert!(pipeline
            .store()
            .query("kubernetes", &JobFilters::default(), 5)
            .await
            .expect("query")
            .is_empty());
    }

    #[tokio::test]
    async fn embeddings_are_persisted_and_reused_on_rebuild() {
        let store = KnowledgeStore::open_in_memory().await.expect("store");
        let backend = Arc::new(KeywordBackend::default());
        let semantic = Arc::new(SemanticIndex::with_backend(backend.clone()));
        let pipeline = IngestPipeline::new(
            store.clone(),
            Arc::new(LexicalIndex::new()),
            Some(semantic.clone()),
        );
        pipeline
            .ingest(vec![
                normalized("wttj", "Backend Developer", "Alan", "Python APIs"),
                normalized("wttj", "Frontend Developer", "Malt", "React"),
            ])
            .await;
        assert_eq!(store.stats().await.expect("stats").embedded_jobs, 2);

        let report = pipeline.rebuild_indexes().await.expect("rebuild");
        assert_eq!(report.documents, 2);
        assert_eq!(report.vectors_loaded, 2);
        assert_eq!(report.vectors_embedded, 0);
        assert_eq!(semantic.len().await, 2);
    }

    #[tokio::test]
    async fn unreachable_backend_does_not_block_ingest() {
        let store = KnowledgeStore::open_in_memory().await.expect("store");
        let semantic = Arc::new(SemanticIndex::with_backend(Arc::new(KeywordBackend::failing())));
        let pipeline =
            IngestPipeline::new(store.clone(), Arc::new(LexicalIndex::new()), Some(semantic));
        let report = pipeline
            .ingest(vec![normalized("indeed", "Data Analyst", "BNP Paribas", "SQL")])
            .await;
        assert_eq!(report.inserted, 1);
        assert_eq!(store.stats().await.expect("stats").embedded_jobs, 0);
    }

    #[tokio::test]
    async fn a_refused_record_does_not_stop_the_batch() {
        let pipeline = pipeline().await;
        refuse_inserts(pipeline.store(), "jobs", "NEW.title = 'Boom'").await;
        let mut session = IngestSession::new();

        let report = pipeline
            .ingest_in(
                &mut session,
                vec![
                    normalized("wttj", "Data Engineer", "Qonto", "Spark"),
                    normalized("wttj", "Boom", "Qonto", "Spark"),
                    normalized("wttj", "ML Engineer", "Mistral AI", "PyTorch"),
                ],
            )
            .await;
        assert_eq!((report.inserted, report.failed), (2, 1));
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.accepted.len(), 2);
        assert_eq!(pipeline.store().stats().await.expect("stats").total_jobs, 2);
        assert_eq!(pipeline.lexical().search("pytorch", 5).await.len(), 1);

        // the refused posting is not remembered, so another source's copy is tried again
        let again = pipeline
            .ingest_in(&mut session, vec![normalized("indeed", "Boom", "Qonto", "Spark")])
            .await;
        assert_eq!((again.collapsed, again.failed), (0, 1));
    }

    #[tokio::test]
    async fn unwritable_vectors_leave_the_record_stored() {
        let store = KnowledgeStore::open_in_memory().await.expect("store");
        refuse_inserts(&store, "job_embeddings", "1").await;
        let semantic = Arc::new(SemanticIndex::with_backend(Arc::new(KeywordBackend::default())));
        let pipeline =
            IngestPipeline::new(store.clone(), Arc::new(LexicalIndex::new()), Some(semantic));

        let report = pipeline
            .ingest(vec![normalized("wttj", "Data Engineer", "Qonto", "Spark")])
            .await;
        assert_eq!((report.inserted, report.failed, report.unembedded), (1, 0, 1));
        let stats = store.stats().await.expect("stats");
        assert_eq!(stats.total_jobs, 1);
        assert_eq!(stats.embedded_jobs, 0);
    }
}
