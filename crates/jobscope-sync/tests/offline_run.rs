use std::path::{Path, PathBuf};
use std::sync::Arc;

use jobscope_adapters::{builtin_collectors, Credentials, StaticPageRenderer};
use jobscope_core::{JobFilters, RunStatus, SourceStatus, Subsystem};
use jobscope_search::{LexicalIndex, SearchCoordinator};
use jobscope_storage::{ArtifactStore, KnowledgeStore};
use jobscope_sync::{IngestPipeline, Orchestrator, SourceRegistry};

fn fixture_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures")
}

fn registry() -> SourceRegistry {
    SourceRegistry::from_yaml_str(
        r#"
sources:
  - source_id: wttj
    display_name: Welcome to the Jungle
    enabled: true
    crawlability: public_html
    search_terms: ["data scientist"]
  - source_id: indeed
    display_name: Indeed France
    enabled: true
    crawlability: public_html
    search_terms: ["data scientist"]
  - source_id: linkedin
    display_name: LinkedIn
    enabled: true
    crawlability: gated
    search_terms: ["data scientist"]
"#,
    )
    .expect("registry")
}

fn orchestrator(
    store: &KnowledgeStore,
    lexical: Arc<LexicalIndex>,
    reports: &Path,
) -> Orchestrator {
    let renderer = StaticPageRenderer::from_fixture_dir(fixture_dir()).expect("fixtures");
    Orchestrator::new(
        builtin_collectors(),
        Arc::new(renderer),
        IngestPipeline::new(store.clone(), lexical, None),
    )
    .with_registry(registry())
    .with_reports(ArtifactStore::new(reports))
    .with_credentials(
        "linkedin",
        Credentials {
            username: "analyst@example.test".into(),
            password: "secret".into(),
        },
    )
}

#[tokio::test]
async fn captured_sites_flow_into_a_searchable_corpus() {
    let store = KnowledgeStore::open_in_memory().await.expect("store");
    let lexical = Arc::new(LexicalIndex::new());
    let reports = tempfile::tempdir().expect("tempdir");
    let orchestrator = orchestrator(&store, lexical.clone(), reports.path());

    let report = orchestrator.run_full_scrape(None, None).await.expect("run");
    let run = &report.run;
    assert_eq!(run.status, RunStatus::Completed);
    for source in ["wttj", "indeed", "linkedin"] {
        assert_eq!(run.sources[source].status, SourceStatus::Success, "{source}");
    }
    // Qonto's "Data Scientist Senior" is listed on all three sites.
    assert_eq!(run.sources["wttj"].inserted, 4);
    assert_eq!(run.sources["wttj"].card_misses, 1);
    assert_eq!(run.sources["indeed"].collapsed, 1);
    assert_eq!(run.sources["linkedin"].collapsed, 1);
    assert_eq!(run.total_inserted, 7);
    assert_eq!(store.stats().await.expect("stats").total_jobs, 7);
    assert!(report.technology_trends.iter().any(|t| t.technology == "python"));
    assert!(reports
        .path()
        .join(run.run_id.to_string())
        .join("run_report.json")
        .is_file());

    let coordinator = SearchCoordinator::new(store.clone(), lexical, None);
    let hits = coordinator
        .search("pytorch", &JobFilters::default(), 5)
        .await
        .expect("search");
    let mut companies = hits
        .iter()
        .map(|hit| hit.record.company.as_str())
        .collect::<Vec<_>>();
    companies.sort_unstable();
    assert_eq!(companies, vec!["Doctolib", "Mistral AI"]);
    assert!(hits
        .iter()
        .all(|hit| hit.subsystems == vec![Subsystem::Lexical]));
}

#[tokio::test]
async fn rerunning_the_same_capture_inserts_nothing() {
    let store = KnowledgeStore::open_in_memory().await.expect("store");
    let reports = tempfile::tempdir().expect("tempdir");
    let orchestrator = orchestrator(&store, Arc::new(LexicalIndex::new()), reports.path());

    let first = orchestrator.run_full_scrape(None, None).await.expect("first run");
    let second = orchestrator.run_full_scrape(None, None).await.expect("second run");
    assert_eq!(second.run.total_inserted, 0);
    assert_eq!(second.run.total_duplicates, first.run.total_collected);
    assert_eq!(store.stats().await.expect("stats").total_jobs, 7);
}

#[tokio::test]
async fn linkedin_without_credentials_fails_alone() {
    let store = KnowledgeStore::open_in_memory().await.expect("store");
    let renderer = StaticPageRenderer::from_fixture_dir(fixture_dir()).expect("fixtures");
    let orchestrator = Orchestrator::new(
        builtin_collectors(),
        Arc::new(renderer),
        IngestPipeline::new(store.clone(), Arc::new(LexicalIndex::new()), None),
    )
    .with_registry(registry());

    let sources = vec!["wttj".to_string(), "linkedin".to_string()];
    let report = orchestrator
        .run_full_scrape(Some(&sources), Some(2))
        .await
        .expect("run");
    assert_eq!(report.run.sources["wttj"].status, SourceStatus::Success);
    assert_eq!(report.run.sources["wttj"].inserted, 2);
    assert_eq!(
        report.run.sources["linkedin"].status,
        SourceStatus::CredentialsMissing
    );
    assert_eq!(report.run.status, RunStatus::Completed);
}
