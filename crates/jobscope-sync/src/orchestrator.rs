//! Serial, failure-isolated collection runs.
//!
//! Per source: `Pending → Collecting → Normalizing → Stored | Failed`. A source that cannot
//! log in, or whose collector errors out, fails alone; the run completes as long as one
//! source produced something. Only a request naming no usable collector at all is an error.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use jobscope_adapters::{AuthError, CollectContext, Credentials, PageRenderer, SiteCollector};
use jobscope_core::{
    CancelFlag, CollectionRun, JobRecord, SourceOutcome, SourcePhase, SourceStatus,
};
use jobscope_storage::{ArtifactStore, RequestPacer, StorageError};
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::SourceRegistry;
use crate::ingest::{IngestPipeline, IngestSession};
use crate::normalize::normalize;
use crate::report::{render_brief_markdown, CollectionRunReport};

const SAMPLE_PER_SOURCE: usize = 3;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("no usable collector among requested sources {requested:?}")]
    NoScrapers { requested: Vec<String> },
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("run report: {0}")]
    Report(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunLimits {
    pub max_jobs_per_source: usize,
    pub max_pages_per_term: usize,
}

impl Default for RunLimits {
    fn default() -> Self {
        Self {
            max_jobs_per_source: 50,
            max_pages_per_term: 3,
        }
    }
}

pub struct Orchestrator {
    collectors: BTreeMap<String, Box<dyn SiteCollector>>,
    registry: SourceRegistry,
    renderer: Arc<dyn PageRenderer>,
    pacer: RequestPacer,
    pipeline: IngestPipeline,
    reports: Option<ArtifactStore>,
    credentials: HashMap<String, Credentials>,
    limits: RunLimits,
    cancel: Option<CancelFlag>,
}

impl Orchestrator {
    pub fn new(
        collectors: Vec<Box<dyn SiteCollector>>,
        renderer: Arc<dyn PageRenderer>,
        pipeline: IngestPipeline,
    ) -> Self {
        let collectors = collectors
            .into_iter()
            .map(|c| (c.source_id().to_string(), c))
            .collect::<BTreeMap<_, _>>();
        let registry = SourceRegistry {
            sources: collectors
                .values()
                .map(|c| crate::config::SourceConfig {
                    source_id: c.source_id().to_string(),
                    display_name: c.display_name().to_string(),
                    enabled: true,
                    crawlability: c.crawlability(),
                    max_jobs: None,
                    search_terms: None,
                })
                .collect(),
        };
        Self {
            collectors,
            registry,
            renderer,
            pacer: RequestPacer::disabled(),
            pipeline,
            reports: None,
            credentials: HashMap::new(),
            limits: RunLimits::default(),
            cancel: None,
        }
    }

    pub fn with_registry(mut self, registry: SourceRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_pacer(mut self, pacer: RequestPacer) -> Self {
        self.pacer = pacer;
        self
    }

    /// Run reports land under `<root>/<run_id>/`.
    pub fn with_reports(mut self, store: ArtifactStore) -> Self {
        self.reports = Some(store);
        self
    }

    pub fn with_credentials(mut self, source_id: &str, credentials: Credentials) -> Self {
        self.credentials.insert(source_id.to_string(), credentials);
        self
    }

    pub fn with_limits(mut self, limits: RunLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn source_ids(&self) -> Vec<&str> {
        self.collectors.keys().map(String::as_str).collect()
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancelFlag::is_cancelled)
    }

    /// `sources` defaults to the registry's enabled sources; `max_jobs_per_source` to the
    /// configured limit.
    pub async fn run_full_scrape(
        &self,
        sources: Option<&[String]>,
        max_jobs_per_source: Option<usize>,
    ) -> Result<CollectionRunReport, OrchestratorError> {
        let mut requested = match sources {
            Some(ids) if !ids.is_empty() => ids.to_vec(),
            _ => self.registry.enabled_ids(),
        };
        let mut seen = HashSet::new();
        requested.retain(|id| seen.insert(id.clone()));
        let max_jobs = max_jobs_per_source.unwrap_or(self.limits.max_jobs_per_source);

        if !requested.iter().any(|id| self.collectors.contains_key(id)) {
            warn!(?requested, "no usable collector for this run");
            return Err(OrchestratorError::NoScrapers { requested });
        }

        let mut run = CollectionRun::start(requested.clone(), max_jobs);
        let run_id = run.run_id;
        info!(%run_id, sources = ?requested, max_jobs, "collection run started");

        let mut session = IngestSession::new();
        let mut accepted = Vec::new();
        let mut attempted_any = false;

        for source_id in &requested {
            if self.is_cancelled() {
                info!(%run_id, source_id, "run cancelled; remaining sources skipped");
                break;
            }
            let Some(collector) = self.collectors.get(source_id) else {
                let mut outcome = SourceOutcome::pending(source_id.clone());
                outcome.fail(SourceStatus::UnknownSource, "no collector registered");
                warn!(%run_id, source_id, "unknown source");
                run.record(outcome);
                continue;
            };
            if attempted_any {
                self.pacer.pause_between_sources().await;
            }
            attempted_any = true;

            let span = info_span!("source", %run_id, source_id = source_id.as_str());
            let (outcome, records) = self
                .run_source(&run, collector.as_ref(), max_jobs, &mut session)
                .instrument(span)
                .await;
            accepted.extend(records);
            run.record(outcome);
        }

        let run = run.finish(Utc::now());
        info!(
            %run_id,
            status = ?run.status,
            collected = run.total_collected,
            inserted = run.total_inserted,
            duplicates = run.total_duplicates,
            duration_ms = run.duration_ms,
            "collection run finished"
        );

        let mut report = CollectionRunReport::build(run, &accepted);
        self.write_report(&mut report).await?;
        Ok(report)
    }

    async fn run_source(
        &self,
        run: &CollectionRun,
        collector: &dyn SiteCollector,
        max_jobs: usize,
        session: &mut IngestSession,
    ) -> (SourceOutcome, Vec<JobRecord>) {
        let started = Instant::now();
        let source_id = collector.source_id();
        let config = self.registry.get(source_id);
        let mut outcome = SourceOutcome::pending(source_id);
        outcome.phase = SourcePhase::Collecting;

        if collector.requires_auth() {
            let credentials = self.credentials.get(source_id);
            if let Err(err) = collector
                .authenticate(run.run_id, self.renderer.as_ref(), credentials)
                .await
            {
                let status = match err {
                    AuthError::CredentialsMissing => SourceStatus::CredentialsMissing,
                    AuthError::LoginFailed(_) => SourceStatus::LoginFailed,
                };
                warn!(error = %err, "authentication failed; source skipped");
                outcome.fail(status, err.to_string());
                outcome.duration_ms = elapsed_ms(started);
                return (outcome, Vec::new());
            }
        }

        let budget = config
            .and_then(|c| c.max_jobs)
            .map_or(max_jobs, |limit| limit.min(max_jobs));
        let ctx = CollectContext {
            run_id: run.run_id,
            renderer: self.renderer.as_ref(),
            pacer: &self.pacer,
            max_records: budget,
            max_pages_per_term: self.limits.max_pages_per_term,
            search_terms: config.and_then(|c| c.search_terms.as_deref()),
            cancel: self.cancel.as_ref(),
        };
        let output = match collector.collect(&ctx).await {
            Ok(output) => output,
            Err(err) => {
                warn!(error = %err, "collector failed");
                outcome.fail(SourceStatus::Failed, err.to_string());
                outcome.duration_ms = elapsed_ms(started);
                return (outcome, Vec::new());
            }
        };
        outcome.collected = output.records.len();
        outcome.card_misses = output.card_misses;
        outcome.pages_visited = output.pages_visited;
        outcome.failed_terms = output.failed_terms.clone();

        outcome.phase = SourcePhase::Normalizing;
        let mut records = Vec::with_capacity(output.records.len());
        for raw in &output.records {
            match normalize(raw) {
                Ok(record) => records.push(record),
                Err(err) => {
                    debug!(error = %err, page_url = %raw.page_url, "raw record dropped");
                    outcome.dropped += 1;
                }
            }
        }
        outcome.normalized = records.len();

        let ingest = self.pipeline.ingest_in(session, records).await;
        outcome.inserted = ingest.inserted;
        outcome.duplicates = ingest.duplicates;
        outcome.collapsed = ingest.collapsed;
        outcome.store_failures = ingest.failed;
        if ingest.unembedded > 0 {
            warn!(unembedded = ingest.unembedded, "records stored without a vector");
        }
        outcome.sample = ingest
            .accepted
            .iter()
            .take(SAMPLE_PER_SOURCE)
            .map(JobRecord::sample)
            .collect();
        outcome.duration_ms = elapsed_ms(started);
        if ingest.failed > 0 && ingest.failed == outcome.normalized {
            warn!(failed = ingest.failed, "store refused every record");
            outcome.fail(SourceStatus::Failed, ingest.errors.join("; "));
            return (outcome, Vec::new());
        }
        if let Some(first) = ingest.errors.first() {
            outcome.error = Some(format!(
                "{} of {} records not stored; first: {first}",
                ingest.failed, outcome.normalized
            ));
        }
        outcome.phase = SourcePhase::Stored;
        outcome.status = if output.is_partial() || ingest.failed > 0 {
            SourceStatus::Partial
        } else {
            SourceStatus::Success
        };

        info!(
            status = ?outcome.status,
            collected = outcome.collected,
            dropped = outcome.dropped,
            inserted = outcome.inserted,
            duplicates = outcome.duplicates,
            collapsed = outcome.collapsed,
            store_failures = outcome.store_failures,
            card_misses = outcome.card_misses,
            failed_terms = outcome.failed_terms.len(),
            "source done"
        );
        (outcome, ingest.accepted)
    }

    /// Report files are best effort: a write failure is logged and the report is still
    /// returned.
    async fn write_report(
        &self,
        report: &mut CollectionRunReport,
    ) -> Result<(), OrchestratorError> {
        let Some(store) = &self.reports else {
            return Ok(());
        };
        let run_id = report.run.run_id;
        let brief = render_brief_markdown(report);
        if let Err(err) = store
            .write_run_file(run_id, "run_brief.md", brief.as_bytes())
            .await
        {
            warn!(%run_id, error = %err, "writing run brief failed");
        }

        let path = store.root().join(run_id.to_string()).join("run_report.json");
        report.report_path = Some(path.display().to_string());
        let json = serde_json::to_vec_pretty(report)?;
        match store.write_run_file(run_id, "run_report.json", &json).await {
            Ok(stored) => info!(
                %run_id,
                path = %stored.absolute_path.display(),
                "run report written"
            ),
            Err(err) => {
                warn!(%run_id, error = %err, "writing run report failed");
                report.report_path = None;
            }
        }
        Ok(())
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SourceConfig;
    use crate::testing::{raw, refuse_inserts, FakeCollector, SeenContext};
    use jobscope_adapters::{CollectionOutput, CollectorError, Crawlability, StaticPageRenderer};
    use jobscope_core::{RunStatus, TermFailure};
    use jobscope_search::LexicalIndex;
    use jobscope_storage::KnowledgeStore;

    async fn pipeline() -> IngestPipeline {
        let store = KnowledgeStore::open_in_memory().await.expect("store");
        IngestPipeline::new(store, Arc::new(LexicalIndex::new()), None)
    }

    fn renderer() -> Arc<dyn PageRenderer> {
        Arc::new(StaticPageRenderer::new())
    }

    fn ids(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn login_failure_is_isolated_to_its_source() {
        let a = FakeCollector::public(
            "a",
            vec![
                raw("a", "Data Engineer", "Qonto", "Spark"),
                raw("a", "Data Analyst", "Alan", "SQL"),
                raw("a", "Data Engineer", "Qonto", "Spark"),
            ],
        );
        let b = FakeCollector::gated("b", vec![raw("b", "ML Engineer", "Mistral AI", "PyTorch")]);
        let orchestrator = Orchestrator::new(vec![Box::new(a), Box::new(b)], renderer(), pipeline().await)
            .with_credentials(
                "b",
                Credentials {
                    username: "me@example.com".into(),
                    password: "wrong".into(),
                },
            );

        let report = orchestrator
            .run_full_scrape(Some(&ids(&["a", "b"])), None)
            .await
            .expect("run");
        let run = &report.run;
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.sources["a"].status, SourceStatus::Success);
        assert_eq!(run.sources["a"].phase, SourcePhase::Stored);
        assert_eq!(run.sources["b"].status, SourceStatus::LoginFailed);
        assert_eq!(run.sources["b"].phase, SourcePhase::Failed);
        assert_eq!(run.total_inserted, 2);
        assert_eq!(run.sources["a"].duplicates, 1);
        assert_eq!(report.summary.failed_sources, 1);
    }

    #[tokio::test]
    async fn missing_credentials_and_unknown_sources_are_reported() {
        let a = FakeCollector::public("a", vec![raw("a", "Data Engineer", "Qonto", "Spark")]);
        let b = FakeCollector::gated("b", Vec::new());
        let orchestrator =
            Orchestrator::new(vec![Box::new(a), Box::new(b)], renderer(), pipeline().await);

        let report = orchestrator
            .run_full_scrape(Some(&ids(&["a", "b", "zz"])), None)
            .await
            .expect("run");
        assert_eq!(report.run.sources["b"].status, SourceStatus::CredentialsMissing);
        assert_eq!(report.run.sources["zz"].status, SourceStatus::UnknownSource);
        assert_eq!(report.run.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn nothing_usable_is_a_hard_error() {
        let orchestrator = Orchestrator::new(Vec::new(), renderer(), pipeline().await);
        let err = orchestrator
            .run_full_scrape(Some(&ids(&["nope"])), None)
            .await
            .expect_err("no collectors");
        assert!(matches!(err, OrchestratorError::NoScrapers { .. }));
    }

    #[tokio::test]
    async fn failing_collector_yields_no_data_but_a_report() {
        let broken = FakeCollector::failing("a", CollectorError::SelectorMiss {
            field: "card",
            url: "https://example.test/jobs".into(),
        });
        let orchestrator = Orchestrator::new(vec![Box::new(broken)], renderer(), pipeline().await);
        let report = orchestrator.run_full_scrape(None, None).await.expect("run");
        assert_eq!(report.run.status, RunStatus::NoData);
        assert_eq!(report.run.sources["a"].status, SourceStatus::Failed);
        assert!(report.run.sources["a"].error.as_deref().unwrap_or_default().contains("card"));
    }

    #[tokio::test]
    async fn cross_source_repeats_collapse_and_partial_output_is_kept() {
        let a = FakeCollector::public("a", vec![raw("a", "Data Scientist Senior", "Qonto", "Python")]);
        let mut partial = CollectionOutput {
            records: vec![
                raw("b", "Data scientist senior", "QONTO", "Python"),
                raw("b", "Data Engineer", "Malt", "Airflow"),
            ],
            ..Default::default()
        };
        partial.failed_terms.push(TermFailure {
            term: "chef de projet".into(),
            error: "page render timed out".into(),
        });
        let b = FakeCollector::with_output("b", Crawlability::PublicHtml, partial);
        let pipeline = pipeline().await;
        let store = pipeline.store().clone();
        let orchestrator = Orchestrator::new(vec![Box::new(a), Box::new(b)], renderer(), pipeline);

        let report = orchestrator
            .run_full_scrape(Some(&ids(&["a", "b"])), None)
            .await
            .expect("run");
        let b = &report.run.sources["b"];
        assert_eq!(b.status, SourceStatus::Partial);
        assert_eq!((b.inserted, b.collapsed), (1, 1));
        assert_eq!(store.stats().await.expect("stats").total_jobs, 2);
        assert_eq!(report.run.total_duplicates, 1);
    }

    #[tokio::test]
    async fn a_refused_record_leaves_the_source_partial() {
        let a = FakeCollector::public(
            "a",
            vec![
                raw("a", "Data Engineer", "Qonto", "Spark"),
                raw("a", "Boom", "Qonto", "Python"),
                raw("a", "ML Engineer", "Mistral AI", "PyTorch"),
            ],
        );
        let pipeline = pipeline().await;
        let store = pipeline.store().clone();
        refuse_inserts(&store, "jobs", "NEW.title = 'Boom'").await;
        let orchestrator = Orchestrator::new(vec![Box::new(a)], renderer(), pipeline);

        let report = orchestrator.run_full_scrape(None, None).await.expect("run");
        let a = &report.run.sources["a"];
        assert_eq!(a.status, SourceStatus::Partial);
        assert_eq!(a.phase, SourcePhase::Stored);
        assert_eq!((a.normalized, a.inserted, a.store_failures), (3, 2, 1));
        assert!(a.error.as_deref().is_some_and(|e| e.contains("refused")));
        assert_eq!(a.sample.len(), 2);
        assert_eq!(report.run.total_inserted, 2);
        assert_eq!(report.run.status, RunStatus::Completed);
        assert_eq!(store.stats().await.expect("stats").total_jobs, 2);
    }

    #[tokio::test]
    async fn a_store_refusing_everything_fails_the_source() {
        let a = FakeCollector::public("a", vec![raw("a", "Data Engineer", "Qonto", "Spark")]);
        let pipeline = pipeline().await;
        refuse_inserts(pipeline.store(), "jobs", "1").await;
        let orchestrator = Orchestrator::new(vec![Box::new(a)], renderer(), pipeline);

        let report = orchestrator.run_full_scrape(None, None).await.expect("run");
        let a = &report.run.sources["a"];
        assert_eq!(a.status, SourceStatus::Failed);
        assert_eq!((a.inserted, a.store_failures), (0, 1));
        assert_eq!(report.run.status, RunStatus::NoData);
    }

    #[tokio::test]
    async fn repeated_source_ids_run_once() {
        let a = FakeCollector::public("a", vec![raw("a", "Data Engineer", "Qonto", "Spark")]);
        let seen = a.seen();
        let orchestrator = Orchestrator::new(vec![Box::new(a)], renderer(), pipeline().await);

        let report = orchestrator
            .run_full_scrape(Some(&ids(&["a", "a"])), None)
            .await
            .expect("run");
        assert_eq!(seen.lock().expect("lock").len(), 1);
        assert_eq!(report.run.requested_sources, ids(&["a"]));
        assert_eq!(report.run.total_inserted, 1);
        assert_eq!(report.run.total_duplicates, 0);
        assert_eq!(report.run.sources["a"].status, SourceStatus::Success);
    }

    #[tokio::test]
    async fn registry_caps_and_terms_reach_the_collector() {
        let a = FakeCollector::public("a", vec![raw("a", "Data Engineer", "Qonto", "Spark")]);
        let b = FakeCollector::public("b", vec![raw("b", "Data Analyst", "Alan", "SQL")]);
        let (seen_a, seen_b) = (a.seen(), b.seen());
        let source = |id: &str, max_jobs: Option<usize>, terms: Option<Vec<String>>| SourceConfig {
            source_id: id.to_string(),
            display_name: id.to_string(),
            enabled: true,
            crawlability: Crawlability::PublicHtml,
            max_jobs,
            search_terms: terms,
        };
        let registry = SourceRegistry {
            sources: vec![
                source("a", Some(5), Some(ids(&["rust"]))),
                source("b", None, None),
            ],
        };
        let orchestrator = Orchestrator::new(vec![Box::new(a), Box::new(b)], renderer(), pipeline().await)
            .with_registry(registry);

        orchestrator.run_full_scrape(None, Some(50)).await.expect("first run");
        orchestrator.run_full_scrape(None, Some(2)).await.expect("second run");

        let seen_a = seen_a.lock().expect("lock").clone();
        let rust = Some(ids(&["rust"]));
        assert_eq!(
            seen_a,
            vec![
                SeenContext { max_records: 5, search_terms: rust.clone() },
                SeenContext { max_records: 2, search_terms: rust },
            ]
        );
        let seen_b = seen_b.lock().expect("lock").clone();
        assert_eq!(
            seen_b,
            vec![
                SeenContext { max_records: 50, search_terms: None },
                SeenContext { max_records: 2, search_terms: None },
            ]
        );
    }

    #[tokio::test]
    async fn malformed_records_are_dropped_and_counted() {
        let mut untitled = raw("a", "", "Qonto", "Python");
        untitled.title = None;
        let a = FakeCollector::public("a", vec![untitled, raw("a", "Data Engineer", "Qonto", "Spark")]);
        let orchestrator = Orchestrator::new(vec![Box::new(a)], renderer(), pipeline().await);
        let report = orchestrator.run_full_scrape(None, None).await.expect("run");
        let a = &report.run.sources["a"];
        assert_eq!((a.collected, a.dropped, a.normalized, a.inserted), (2, 1, 1, 1));
    }

    #[tokio::test]
    async fn cancellation_marks_unstarted_sources() {
        let cancel = CancelFlag::new();
        let a = FakeCollector::public("a", vec![raw("a", "Data Engineer", "Qonto", "Spark")])
            .cancelling(cancel.clone());
        let b = FakeCollector::public("b", vec![raw("b", "Data Analyst", "Alan", "SQL")]);
        let orchestrator = Orchestrator::new(vec![Box::new(a), Box::new(b)], renderer(), pipeline().await)
            .with_cancel(cancel);

        let report = orchestrator
            .run_full_scrape(Some(&ids(&["a", "b"])), None)
            .await
            .expect("run");
        assert_eq!(report.run.sources["a"].status, SourceStatus::Success);
        assert_eq!(report.run.sources["b"].status, SourceStatus::Cancelled);
        assert_eq!(report.run.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn run_report_and_brief_are_written() {
        let dir = tempfile::tempdir().expect("tempdir");
        let a = FakeCollector::public("a", vec![raw("a", "Data Engineer", "Qonto", "Spark, Python")]);
        let orchestrator = Orchestrator::new(vec![Box::new(a)], renderer(), pipeline().await)
            .with_reports(ArtifactStore::new(dir.path()));
        let report = orchestrator.run_full_scrape(None, Some(10)).await.expect("run");

        let run_dir = dir.path().join(report.run.run_id.to_string());
        let json = std::fs::read_to_string(run_dir.join("run_report.json")).expect("report");
        let parsed: serde_json::Value = serde_json::from_str(&json).expect("json");
        assert_eq!(parsed["run"]["sources"]["a"]["status"], "success");
        assert_eq!(parsed["run"]["max_jobs_per_source"], 10);
        assert!(run_dir.join("run_brief.md").is_file());
        assert!(report.report_path.is_some());
    }
}
