//! Normalization, dedup ingest, collection runs and their reports.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use jobscope_adapters::{
    builtin_collectors, HttpPageRenderer, PageRenderer, StaticPageRenderer,
};
use jobscope_search::{
    KnowledgeService, LexicalIndex, LexicalStats, OllamaEmbeddingBackend, SearchCoordinator,
    SemanticIndex,
};
use jobscope_storage::{
    ArtifactStore, HttpClientConfig, HttpFetcher, KnowledgeStore, RequestPacer, StoreStats,
};
use serde::Serialize;
use tracing::{info, warn};

pub mod config;
pub mod export;
pub mod ingest;
pub mod normalize;
pub mod orchestrator;
pub mod report;

pub use config::{JobscopeConfig, SourceConfig, SourceRegistry};
pub use export::{export_corpus, ParquetManifest, ParquetManifestFile};
pub use ingest::{IngestPipeline, IngestReport, IngestSession, RebuildReport};
pub use normalize::{normalize, NormalizationError, TechCategory};
pub use orchestrator::{Orchestrator, OrchestratorError, RunLimits};
pub use report::{
    render_brief_markdown, report_history_markdown, CollectionRunReport, QualityAnalysis,
    RunSummary, TechnologyTrend,
};

pub const CRATE_NAME: &str = "jobscope-sync";

const EMBEDDING_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize)]
pub struct CorpusStats {
    pub store: StoreStats,
    pub lexical: LexicalStats,
    pub semantic_enabled: bool,
    pub semantic_vectors: usize,
}

/// Opened store plus warm indices: everything a command needs.
pub struct Jobscope {
    config: JobscopeConfig,
    store: KnowledgeStore,
    lexical: Arc<LexicalIndex>,
    semantic: Option<Arc<SemanticIndex>>,
}

impl Jobscope {
    /// Connects the store, probes the embedding backend once and replays the corpus into
    /// the indices.
    pub async fn open(config: JobscopeConfig) -> Result<Self> {
        let store = KnowledgeStore::connect(&config.database_url)
            .await
            .with_context(|| format!("opening knowledge store {}", config.database_url))?;

        let semantic = match &config.embedding_url {
            Some(url) => {
                let backend =
                    OllamaEmbeddingBackend::new(url, &config.embedding_model, EMBEDDING_TIMEOUT)
                        .context("building embedding client")?;
                SemanticIndex::connect(Arc::new(backend)).await.map(Arc::new)
            }
            None => {
                info!("no embedding endpoint configured; semantic index disabled");
                None
            }
        };

        let app = Self {
            config,
            store,
            lexical: Arc::new(LexicalIndex::new()),
            semantic,
        };
        app.pipeline()
            .rebuild_indexes()
            .await
            .context("rebuilding indexes")?;
        Ok(app)
    }

    pub fn config(&self) -> &JobscopeConfig {
        &self.config
    }

    pub fn store(&self) -> &KnowledgeStore {
        &self.store
    }

    pub fn pipeline(&self) -> IngestPipeline {
        IngestPipeline::new(
            self.store.clone(),
            self.lexical.clone(),
            self.semantic.clone(),
        )
    }

    pub fn coordinator(&self) -> SearchCoordinator {
        SearchCoordinator::new(
            self.store.clone(),
            self.lexical.clone(),
            self.semantic.clone(),
        )
        .with_alpha(self.config.hybrid_alpha)
    }

    pub fn knowledge_service(&self) -> KnowledgeService {
        KnowledgeService::new(Arc::new(self.coordinator()), self.store.clone())
    }

    pub fn renderer(&self) -> Result<Arc<dyn PageRenderer>> {
        if let Some(dir) = &self.config.offline_fixtures {
            let renderer = StaticPageRenderer::from_fixture_dir(dir)?;
            info!(
                dir = %dir.display(),
                pages = renderer.page_count(),
                "rendering from captured fixtures"
            );
            return Ok(Arc::new(renderer));
        }
        let fetcher = HttpFetcher::new(HttpClientConfig {
            timeout: self.config.page_timeout,
            user_agent: Some(self.config.user_agent.clone()),
            ..Default::default()
        })?;
        let mut renderer = HttpPageRenderer::new(
            Arc::new(fetcher),
            self.config.page_timeout,
            self.config.browser_mode,
        );
        if self.config.capture_pages {
            renderer = renderer.with_captures(ArtifactStore::new(&self.config.reports_dir));
        }
        Ok(Arc::new(renderer))
    }

    pub fn orchestrator(&self) -> Result<Orchestrator> {
        let registry = self.config.source_registry()?;
        for unknown in registry.unknown_ids() {
            warn!(source_id = unknown, "registry names a source without a collector");
        }
        let pacer = if self.config.offline_fixtures.is_some() {
            RequestPacer::disabled()
        } else {
            RequestPacer::new(self.config.pacing)
        };

        let renderer = self.renderer()?;
        let mut orchestrator = Orchestrator::new(builtin_collectors(), renderer, self.pipeline())
            .with_registry(registry)
            .with_pacer(pacer)
            .with_reports(ArtifactStore::new(&self.config.reports_dir))
            .with_limits(RunLimits {
                max_jobs_per_source: self.config.max_jobs_per_source,
                max_pages_per_term: self.config.max_pages_per_term,
            });
        if let Some(credentials) = &self.config.linkedin_credentials {
            orchestrator = orchestrator.with_credentials("linkedin", credentials.clone());
        }
        Ok(orchestrator)
    }

    pub async fn stats(&self) -> Result<CorpusStats> {
        let store = self.store.stats().await.context("reading store stats")?;
        let semantic_vectors = match &self.semantic {
            Some(index) => index.len().await,
            None => 0,
        };
        Ok(CorpusStats {
            store,
            lexical: self.lexical.stats().await,
            semantic_enabled: self.semantic.is_some(),
            semantic_vectors,
        })
    }
}

pub async fn run_full_scrape_from_env(
    sources: Option<&[String]>,
    max_jobs_per_source: Option<usize>,
) -> Result<CollectionRunReport> {
    let app = Jobscope::open(JobscopeConfig::from_env()).await?;
    let orchestrator = app.orchestrator()?;
    Ok(orchestrator
        .run_full_scrape(sources, max_jobs_per_source)
        .await?)
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use jobscope_adapters::{
        AuthError, CollectContext, CollectionOutput, CollectorError, Crawlability, Credentials,
        PageRenderer, SiteCollector,
    };
    use jobscope_core::{CancelFlag, JobRecord, RawJobRecord};
    use jobscope_search::{EmbeddingBackend, IndexError};
    use jobscope_storage::KnowledgeStore;
    use uuid::Uuid;

    pub fn raw(source_id: &str, title: &str, company: &str, description: &str) -> RawJobRecord {
        let mut raw = RawJobRecord::new(
            source_id,
            "data",
            format!("https://{source_id}.example.test/jobs?page=1"),
            Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0)
                .single()
                .expect("valid timestamp"),
        );
        raw.title = Some(title.to_string());
        raw.company = Some(company.to_string());
        raw.location = Some("Paris".to_string());
        raw.description = Some(description.to_string());
        raw
    }

    pub fn normalized(source_id: &str, title: &str, company: &str, description: &str) -> JobRecord {
        crate::normalize(&raw(source_id, title, company, description)).expect("normalize")
    }

    /// Makes the store reject inserts into `table` whose new row satisfies `condition`.
    pub async fn refuse_inserts(store: &KnowledgeStore, table: &str, condition: &str) {
        let sql = format!(
            "CREATE TRIGGER refuse_{table} BEFORE INSERT ON {table} WHEN {condition} \
             BEGIN SELECT RAISE(ABORT, 'refused'); END"
        );
        sqlx::query(&sql)
            .execute(store.pool())
            .await
            .expect("trigger");
    }

    /// Bag-of-keywords vectors over a fixed vocabulary.
    #[derive(Default)]
    pub struct KeywordBackend {
        fail: bool,
    }

    impl KeywordBackend {
        pub fn failing() -> Self {
            Self { fail: true }
        }
    }

    #[async_trait]
    impl EmbeddingBackend for KeywordBackend {
        fn model_name(&self) -> &str {
            "keywords"
        }

        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, IndexError> {
            if self.fail {
                return Err(IndexError::Unavailable("offline".into()));
            }
            Ok(texts
                .iter()
                .map(|text| {
                    let lowered = text.to_lowercase();
                    ["python", "react", "sql", "spark"]
                        .iter()
                        .map(|w| if lowered.contains(w) { 1.0 } else { 0.0 })
                        .chain(std::iter::once(0.1))
                        .collect()
                })
                .collect())
        }
    }

    /// What a collector was asked for on one `collect` call.
    #[derive(Debug, Clone, PartialEq)]
    pub struct SeenContext {
        pub max_records: usize,
        pub search_terms: Option<Vec<String>>,
    }

    /// Scripted collector; the gated flavour accepts the password "secret" only.
    pub struct FakeCollector {
        id: &'static str,
        crawlability: Crawlability,
        output: CollectionOutput,
        failure: Mutex<Option<CollectorError>>,
        cancel_after: Option<CancelFlag>,
        seen: Arc<Mutex<Vec<SeenContext>>>,
    }

    impl FakeCollector {
        pub fn with_output(
            id: &'static str,
            crawlability: Crawlability,
            output: CollectionOutput,
        ) -> Self {
            Self {
                id,
                crawlability,
                output,
                failure: Mutex::new(None),
                cancel_after: None,
                seen: Arc::default(),
            }
        }

        /// Shared log of every `collect` call, readable after the collector is boxed.
        pub fn seen(&self) -> Arc<Mutex<Vec<SeenContext>>> {
            self.seen.clone()
        }

        pub fn public(id: &'static str, records: Vec<RawJobRecord>) -> Self {
            Self::with_output(
                id,
                Crawlability::PublicHtml,
                CollectionOutput {
                    records,
                    pages_visited: 1,
                    ..Default::default()
                },
            )
        }

        pub fn gated(id: &'static str, records: Vec<RawJobRecord>) -> Self {
            let mut collector = Self::public(id, records);
            collector.crawlability = Crawlability::Gated;
            collector
        }

        pub fn failing(id: &'static str, error: CollectorError) -> Self {
            let collector = Self::public(id, Vec::new());
            *collector.failure.lock().expect("lock") = Some(error);
            collector
        }

        /// Trips `flag` once its own collection is done.
        pub fn cancelling(mut self, flag: CancelFlag) -> Self {
            self.cancel_after = Some(flag);
            self
        }
    }

    #[async_trait]
    impl SiteCollector for FakeCollector {
        fn source_id(&self) -> &'static str {
            self.id
        }

        fn display_name(&self) -> &'static str {
            self.id
        }

        fn crawlability(&self) -> Crawlability {
            self.crawlability
        }

        async fn authenticate(
            &self,
            _run_id: Uuid,
            _renderer: &dyn PageRenderer,
            credentials: Option<&Credentials>,
        ) -> Result<(), AuthError> {
            match credentials {
                None => Err(AuthError::CredentialsMissing),
                Some(c) if c.password == "secret" => Ok(()),
                Some(_) => Err(AuthError::LoginFailed("still on the login page".into())),
            }
        }

        async fn collect(
            &self,
            ctx: &CollectContext<'_>,
        ) -> Result<CollectionOutput, CollectorError> {
            self.seen.lock().expect("lock").push(SeenContext {
                max_records: ctx.max_records,
                search_terms: ctx.search_terms.map(<[String]>::to_vec),
            });
            if let Some(flag) = &self.cancel_after {
                flag.cancel();
            }
            if let Some(error) = self.failure.lock().expect("lock").take() {
                return Err(error);
            }
            Ok(self.output.clone())
        }
    }
}
