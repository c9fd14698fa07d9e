//! Page rendering backends. Collectors only see the [`PageRenderer`] trait.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobscope_storage::{ArtifactStore, FetchError, FetchedPage, HttpFetcher};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::CollectorError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrowserMode {
    #[default]
    Headless,
    Visible,
}

#[derive(Debug, Clone)]
pub struct RenderRequest<'a> {
    pub run_id: Uuid,
    pub source_id: &'a str,
    pub url: &'a str,
    /// Cookie/consent banners a rendering backend should dismiss before reading the DOM.
    pub consent_selectors: &'a [&'static str],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedPage {
    pub url: String,
    pub html: String,
    pub rendered_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct FormSubmission<'a> {
    pub run_id: Uuid,
    pub source_id: &'a str,
    pub action_url: &'a str,
    pub fields: Vec<(String, String)>,
}

#[async_trait]
pub trait PageRenderer: Send + Sync {
    fn mode(&self) -> BrowserMode;

    async fn render(&self, request: &RenderRequest<'_>) -> Result<RenderedPage, CollectorError>;

    async fn submit_form(
        &self,
        form: &FormSubmission<'_>,
    ) -> Result<RenderedPage, CollectorError>;
}

/// Fetches pages over HTTP and hands the served markup to the collectors.
pub struct HttpPageRenderer {
    fetcher: Arc<HttpFetcher>,
    page_timeout: Duration,
    mode: BrowserMode,
    captures: Option<ArtifactStore>,
}

impl HttpPageRenderer {
    pub fn new(fetcher: Arc<HttpFetcher>, page_timeout: Duration, mode: BrowserMode) -> Self {
        if mode == BrowserMode::Visible {
            warn!("visible browser mode requested; the HTTP renderer always runs headless");
        }
        Self {
            fetcher,
            page_timeout,
            mode,
            captures: None,
        }
    }

    /// Keep a hash-addressed copy of every rendered page (reusable as fixtures).
    pub fn with_captures(mut self, store: ArtifactStore) -> Self {
        self.captures = Some(store);
        self
    }

    async fn bounded<F>(&self, url: &str, fetch: F) -> Result<FetchedPage, CollectorError>
    where
        F: std::future::Future<Output = Result<FetchedPage, FetchError>>,
    {
        let timed_out = || CollectorError::PageTimeout {
            url: url.to_string(),
            timeout_secs: self.page_timeout.as_secs(),
        };
        match tokio::time::timeout(self.page_timeout, fetch).await {
            Err(_) => Err(timed_out()),
            Ok(Err(FetchError::Timeout { .. })) => Err(timed_out()),
            Ok(Err(err)) => Err(CollectorError::Render {
                url: url.to_string(),
                message: err.to_string(),
            }),
            Ok(Ok(page)) => Ok(page),
        }
    }

    async fn capture(&self, source_id: &str, page: &FetchedPage) {
        if let Some(store) = &self.captures {
            if let Err(err) = store.store_page(page.fetched_at, source_id, &page.body).await {
                warn!(source_id, url = %page.final_url, error = %err, "page capture failed");
            }
        }
    }
}

#[async_trait]
impl PageRenderer for HttpPageRenderer {
    fn mode(&self) -> BrowserMode {
        self.mode
    }

    async fn render(&self, request: &RenderRequest<'_>) -> Result<RenderedPage, CollectorError> {
        if !request.consent_selectors.is_empty() {
            debug!(url = request.url, "consent banners are not interactive over plain HTTP");
        }
        let page = self
            .bounded(
                request.url,
                self.fetcher
                    .fetch_text(request.run_id, request.source_id, request.url),
            )
            .await?;
        self.capture(request.source_id, &page).await;
        Ok(RenderedPage {
            url: page.final_url,
            html: page.body,
            rendered_at: page.fetched_at,
        })
    }

    async fn submit_form(
        &self,
        form: &FormSubmission<'_>,
    ) -> Result<RenderedPage, CollectorError> {
        let page = self
            .bounded(
                form.action_url,
                self.fetcher.post_form(
                    form.run_id,
                    form.source_id,
                    form.action_url,
                    &form.fields,
                ),
            )
            .await?;
        Ok(RenderedPage {
            url: page.final_url,
            html: page.body,
            rendered_at: page.fetched_at,
        })
    }
}

/// On-disk description of captured pages for one source (`fixtures/<source>/bundle.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureBundle {
    pub source_id: String,
    #[serde(default)]
    pub captured_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub pages: Vec<PageFixture>,
    #[serde(default)]
    pub login: Option<LoginFixture>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageFixture {
    pub url: String,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub inline_html: Option<String>,
    #[serde(default)]
    pub timeout: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginFixture {
    /// Where the login form submission lands.
    pub final_url: String,
}

#[derive(Debug, Clone)]
enum StaticPage {
    Html(String),
    Timeout,
}

const EMPTY_PAGE: &str = "<html><head></head><body></body></html>";

/// Serves captured markup keyed by exact URL. Unknown URLs render as an empty page, which
/// collectors read as "no more results".
#[derive(Debug, Clone)]
pub struct StaticPageRenderer {
    pages: HashMap<String, StaticPage>,
    login_results: HashMap<String, String>,
    rendered_at: DateTime<Utc>,
}

impl Default for StaticPageRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl StaticPageRenderer {
    pub fn new() -> Self {
        Self {
            pages: HashMap::new(),
            login_results: HashMap::new(),
            rendered_at: Utc::now(),
        }
    }

    pub fn at(mut self, rendered_at: DateTime<Utc>) -> Self {
        self.rendered_at = rendered_at;
        self
    }

    pub fn with_page(mut self, url: impl Into<String>, html: impl Into<String>) -> Self {
        self.pages.insert(url.into(), StaticPage::Html(html.into()));
        self
    }

    pub fn with_timeout(mut self, url: impl Into<String>) -> Self {
        self.pages.insert(url.into(), StaticPage::Timeout);
        self
    }

    /// Form posts from `source_id` land on `final_url`. Without an entry they land back on
    /// the action URL, i.e. the login is rejected.
    pub fn with_login_result(
        mut self,
        source_id: impl Into<String>,
        final_url: impl Into<String>,
    ) -> Self {
        self.login_results.insert(source_id.into(), final_url.into());
        self
    }

    pub fn load_bundle(mut self, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text =
            fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let bundle: FixtureBundle =
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));

        for page in &bundle.pages {
            let entry = if page.timeout {
                StaticPage::Timeout
            } else {
                StaticPage::Html(hydrate_page(base, page)?)
            };
            self.pages.insert(page.url.clone(), entry);
        }
        if let Some(login) = &bundle.login {
            self.login_results
                .insert(bundle.source_id.clone(), login.final_url.clone());
        }
        if let Some(captured_at) = bundle.captured_at {
            self.rendered_at = captured_at;
        }
        Ok(self)
    }

    /// Loads every `<dir>/<source>/bundle.json`.
    pub fn from_fixture_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let mut bundles = fs::read_dir(dir)
            .with_context(|| format!("reading fixture dir {}", dir.display()))?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path().join("bundle.json"))
            .filter(|path| path.is_file())
            .collect::<Vec<PathBuf>>();
        bundles.sort();

        let mut renderer = Self::new();
        for bundle in bundles {
            renderer = renderer.load_bundle(bundle)?;
        }
        Ok(renderer)
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }
}

fn hydrate_page(base: &Path, page: &PageFixture) -> Result<String> {
    if let Some(inline) = &page.inline_html {
        return Ok(inline.clone());
    }
    let Some(rel_path) = &page.path else {
        return Ok(EMPTY_PAGE.to_string());
    };
    let raw_path = base.join(rel_path);
    fs::read_to_string(&raw_path)
        .with_context(|| format!("reading fixture page {}", raw_path.display()))
}

#[async_trait]
impl PageRenderer for StaticPageRenderer {
    fn mode(&self) -> BrowserMode {
        BrowserMode::Headless
    }

    async fn render(&self, request: &RenderRequest<'_>) -> Result<RenderedPage, CollectorError> {
        let html = match self.pages.get(request.url) {
            Some(StaticPage::Html(html)) => html.clone(),
            Some(StaticPage::Timeout) => {
                return Err(CollectorError::PageTimeout {
                    url: request.url.to_string(),
                    timeout_secs: 0,
                })
            }
            None => {
                debug!(url = request.url, "no fixture for url; serving empty page");
                EMPTY_PAGE.to_string()
            }
        };
        Ok(RenderedPage {
            url: request.url.to_string(),
            html,
            rendered_at: self.rendered_at,
        })
    }

    async fn submit_form(
        &self,
        form: &FormSubmission<'_>,
    ) -> Result<RenderedPage, CollectorError> {
        let url = self
            .login_results
            .get(form.source_id)
            .cloned()
            .unwrap_or_else(|| form.action_url.to_string());
        Ok(RenderedPage {
            url,
            html: EMPTY_PAGE.to_string(),
            rendered_at: self.rendered_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fixture_dir;

    fn request(url: &str) -> RenderRequest<'_> {
        RenderRequest {
            run_id: Uuid::nil(),
            source_id: "test",
            url,
            consent_selectors: &[],
        }
    }

    #[tokio::test]
    async fn static_renderer_serves_known_pages_and_empty_unknown_ones() {
        let renderer = StaticPageRenderer::new()
            .with_page("https://a.test/1", "<p>one</p>")
            .with_timeout("https://a.test/slow");

        let page = renderer.render(&request("https://a.test/1")).await.expect("page");
        assert_eq!(page.html, "<p>one</p>");

        let empty = renderer.render(&request("https://a.test/2")).await.expect("empty");
        assert_eq!(empty.html, EMPTY_PAGE);

        let err = renderer
            .render(&request("https://a.test/slow"))
            .await
            .expect_err("timeout");
        assert!(matches!(err, CollectorError::PageTimeout { .. }));
    }

    #[tokio::test]
    async fn login_without_configured_result_stays_on_action_url() {
        let renderer = StaticPageRenderer::new().with_login_result("linkedin", "https://x.test/feed/");
        let form = |source_id| FormSubmission {
            run_id: Uuid::nil(),
            source_id,
            action_url: "https://x.test/login-submit",
            fields: Vec::new(),
        };
        let ok = renderer.submit_form(&form("linkedin")).await.expect("submit");
        assert_eq!(ok.url, "https://x.test/feed/");
        let rejected = renderer.submit_form(&form("other")).await.expect("submit");
        assert_eq!(rejected.url, "https://x.test/login-submit");
    }

    #[test]
    fn workspace_fixture_bundles_load() {
        let renderer = StaticPageRenderer::from_fixture_dir(fixture_dir()).expect("fixtures");
        assert!(renderer.page_count() >= 4);
        assert!(renderer.login_results.contains_key("linkedin"));
    }
}
