//! Site collector contract + the built-in listing-site collectors.

use std::fmt;

use async_trait::async_trait;
use jobscope_core::{CancelFlag, RawJobRecord, TermFailure};
use jobscope_storage::RequestPacer;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

mod collector;
mod extract;
mod indeed;
mod linkedin;
mod render;
mod wttj;

pub use collector::{ListingCollector, SiteProfile};
pub use extract::{CardLayout, FieldExtractor, FieldStrategy, PageExtraction, SelectorChain};
pub use indeed::indeed_collector;
pub use linkedin::{linkedin_collector, LinkedInCollector};
pub use render::{
    BrowserMode, FixtureBundle, FormSubmission, HttpPageRenderer, LoginFixture, PageFixture,
    PageRenderer, RenderRequest, RenderedPage, StaticPageRenderer,
};
pub use wttj::wttj_collector;

pub const CRATE_NAME: &str = "jobscope-adapters";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Crawlability {
    PublicHtml,
    Gated,
}

#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("no selector candidate matched `{field}` on {url}")]
    SelectorMiss { field: &'static str, url: String },
    #[error("page render timed out after {timeout_secs}s: {url}")]
    PageTimeout { url: String, timeout_secs: u64 },
    #[error("render failed for {url}: {message}")]
    Render { url: String, message: String },
    #[error("invalid selector `{selector}`: {message}")]
    InvalidSelector { selector: String, message: String },
    #[error("invalid url {url}: {message}")]
    InvalidUrl { url: String, message: String },
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("credentials missing")]
    CredentialsMissing,
    #[error("login failed: {0}")]
    LoginFailed(String),
}

#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Everything a collector needs for one `collect` call.
pub struct CollectContext<'a> {
    pub run_id: Uuid,
    pub renderer: &'a dyn PageRenderer,
    pub pacer: &'a RequestPacer,
    pub max_records: usize,
    pub max_pages_per_term: usize,
    /// Overrides the collector's built-in term list when set.
    pub search_terms: Option<&'a [String]>,
    pub cancel: Option<&'a CancelFlag>,
}

impl CollectContext<'_> {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_some_and(CancelFlag::is_cancelled)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CollectionOutput {
    pub records: Vec<RawJobRecord>,
    pub card_misses: usize,
    pub failed_terms: Vec<TermFailure>,
    pub pages_visited: usize,
    pub cancelled: bool,
}

impl CollectionOutput {
    /// Some terms failed or the run was cut short, but the collector itself survived.
    pub fn is_partial(&self) -> bool {
        !self.failed_terms.is_empty() || self.cancelled
    }
}

#[async_trait]
pub trait SiteCollector: Send + Sync {
    fn source_id(&self) -> &'static str;
    fn display_name(&self) -> &'static str;
    fn crawlability(&self) -> Crawlability;

    fn requires_auth(&self) -> bool {
        self.crawlability() == Crawlability::Gated
    }

    /// Gated sources log in before collecting. Public sources accept unconditionally.
    async fn authenticate(
        &self,
        _run_id: Uuid,
        _renderer: &dyn PageRenderer,
        _credentials: Option<&Credentials>,
    ) -> Result<(), AuthError> {
        Ok(())
    }

    async fn collect(&self, ctx: &CollectContext<'_>) -> Result<CollectionOutput, CollectorError>;
}

pub const BUILTIN_SOURCES: [&str; 3] = ["wttj", "indeed", "linkedin"];

pub fn collector_for_source(source_id: &str) -> Option<Box<dyn SiteCollector>> {
    match source_id {
        "wttj" => Some(Box::new(wttj_collector())),
        "indeed" => Some(Box::new(indeed_collector())),
        "linkedin" => Some(Box::new(linkedin_collector())),
        _ => None,
    }
}

pub fn builtin_collectors() -> Vec<Box<dyn SiteCollector>> {
    BUILTIN_SOURCES
        .iter()
        .filter_map(|id| collector_for_source(id))
        .collect()
}

#[cfg(test)]
pub(crate) mod testing {
    use std::path::{Path, PathBuf};

    pub fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    pub fn fixture_dir() -> PathBuf {
        workspace_root().join("fixtures")
    }
}
