use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use jobscope_adapters::{BrowserMode, Crawlability, Credentials, BUILTIN_SOURCES};
use jobscope_storage::PacingConfig;
use serde::{Deserialize, Serialize};

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    pub enabled: bool,
    pub crawlability: Crawlability,
    #[serde(default)]
    pub max_jobs: Option<usize>,
    #[serde(default)]
    pub search_terms: Option<Vec<String>>,
}

impl SourceRegistry {
    /// Every built-in collector enabled with its own defaults.
    pub fn builtin() -> Self {
        let sources = jobscope_adapters::builtin_collectors()
            .iter()
            .map(|collector| SourceConfig {
                source_id: collector.source_id().to_string(),
                display_name: collector.display_name().to_string(),
                enabled: true,
                crawlability: collector.crawlability(),
                max_jobs: None,
                search_terms: None,
            })
            .collect();
        Self { sources }
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing source registry")
    }

    /// `<workspace_root>/sources.yaml`, or the built-in registry when the file is absent.
    pub fn load(workspace_root: &Path) -> Result<Self> {
        let path = workspace_root.join("sources.yaml");
        if !path.exists() {
            return Ok(Self::builtin());
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn get(&self, source_id: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.source_id == source_id)
    }

    pub fn enabled_ids(&self) -> Vec<String> {
        self.sources
            .iter()
            .filter(|s| s.enabled)
            .map(|s| s.source_id.clone())
            .collect()
    }

    /// Registry entries naming no built-in collector.
    pub fn unknown_ids(&self) -> Vec<&str> {
        self.sources
            .iter()
            .map(|s| s.source_id.as_str())
            .filter(|id| !BUILTIN_SOURCES.contains(id))
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct JobscopeConfig {
    pub database_url: String,
    pub reports_dir: PathBuf,
    pub workspace_root: PathBuf,
    pub max_jobs_per_source: usize,
    pub max_pages_per_term: usize,
    pub pacing: PacingConfig,
    pub page_timeout: Duration,
    pub browser_mode: BrowserMode,
    pub user_agent: String,
    pub offline_fixtures: Option<PathBuf>,
    /// Keep a hash-addressed copy of every rendered page under `reports_dir/pages`.
    pub capture_pages: bool,
    pub linkedin_credentials: Option<Credentials>,
    pub embedding_url: Option<String>,
    pub embedding_model: String,
    pub hybrid_alpha: f64,
}

impl JobscopeConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(var: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let parsed = |key: &str| var(key).and_then(|v| v.trim().parse::<u64>().ok());
        let truthy = |key: &str| {
            var(key).is_some_and(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        };
        let non_empty = |key: &str| var(key).filter(|v| !v.trim().is_empty());

        let workspace_root = var("JOBSCOPE_WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let offline_fixtures = var("JOBSCOPE_OFFLINE_FIXTURES").map(|v| {
            if v.trim().is_empty() || matches!(v.as_str(), "1" | "true" | "TRUE" | "True") {
                workspace_root.join("fixtures")
            } else {
                PathBuf::from(v)
            }
        });
        let linkedin_credentials =
            match (non_empty("LINKEDIN_EMAIL"), non_empty("LINKEDIN_PASSWORD")) {
                (Some(username), Some(password)) => Some(Credentials { username, password }),
                _ => None,
            };

        Self {
            database_url: var("JOBSCOPE_DATABASE_URL")
                .unwrap_or_else(|| "sqlite://data/jobscope.db".to_string()),
            reports_dir: var("JOBSCOPE_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./reports")),
            max_jobs_per_source: parsed("JOBSCOPE_MAX_JOBS_PER_SOURCE").unwrap_or(50) as usize,
            max_pages_per_term: parsed("JOBSCOPE_MAX_PAGES_PER_TERM").unwrap_or(3) as usize,
            pacing: PacingConfig {
                min_delay: Duration::from_millis(
                    parsed("JOBSCOPE_REQUEST_DELAY_MIN_MS").unwrap_or(2000),
                ),
                max_delay: Duration::from_millis(
                    parsed("JOBSCOPE_REQUEST_DELAY_MAX_MS").unwrap_or(5000),
                ),
                source_delay_multiplier: parsed("JOBSCOPE_SOURCE_DELAY_MULTIPLIER")
                    .map(|v| v.min(u64::from(u32::MAX)) as u32)
                    .unwrap_or(5),
            },
            page_timeout: Duration::from_secs(parsed("JOBSCOPE_PAGE_TIMEOUT_SECS").unwrap_or(30)),
            browser_mode: match var("JOBSCOPE_BROWSER_MODE").as_deref() {
                Some("visible") => BrowserMode::Visible,
                _ => BrowserMode::Headless,
            },
            user_agent: var("JOBSCOPE_USER_AGENT")
                .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            offline_fixtures,
            capture_pages: truthy("JOBSCOPE_CAPTURE_PAGES"),
            linkedin_credentials,
            embedding_url: non_empty("JOBSCOPE_EMBEDDING_URL"),
            embedding_model: var("JOBSCOPE_EMBEDDING_MODEL")
                .unwrap_or_else(|| "nomic-embed-text".to_string()),
            hybrid_alpha: var("JOBSCOPE_HYBRID_ALPHA")
                .and_then(|v| v.trim().parse::<f64>().ok())
                .map(|a| a.clamp(0.0, 1.0))
                .unwrap_or(jobscope_search::DEFAULT_HYBRID_ALPHA),
            workspace_root,
        }
    }

    pub fn source_registry(&self) -> Result<SourceRegistry> {
        SourceRegistry::load(&self.workspace_root)
    }
}
