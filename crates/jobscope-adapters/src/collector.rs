use std::collections::HashSet;

use async_trait::async_trait;
use jobscope_core::TermFailure;
use reqwest::Url;
use tracing::{debug, info, warn};

use crate::extract::{CardLayout, PageExtraction, PageMeta};
use crate::render::RenderRequest;
use crate::{CollectContext, CollectionOutput, CollectorError, Crawlability, SiteCollector};

/// Static description of one listing site: where to search and how its cards look.
#[derive(Debug, Clone)]
pub struct SiteProfile {
    pub source_id: &'static str,
    pub display_name: &'static str,
    pub crawlability: Crawlability,
    pub search_base: &'static str,
    pub search_terms: &'static [&'static str],
    pub consent_selectors: &'static [&'static str],
    /// Query parameters for a 0-based result page.
    pub query_params: fn(term: &str, page: usize) -> Vec<(&'static str, String)>,
    pub layout: CardLayout,
}

impl SiteProfile {
    pub fn search_url(&self, term: &str, page: usize) -> Result<String, CollectorError> {
        let params = (self.query_params)(term, page);
        Url::parse_with_params(self.search_base, &params)
            .map(|url| url.to_string())
            .map_err(|e| CollectorError::InvalidUrl {
                url: self.search_base.to_string(),
                message: e.to_string(),
            })
    }
}

/// Paginating term-by-term collector shared by every built-in site.
#[derive(Debug, Clone)]
pub struct ListingCollector {
    profile: SiteProfile,
}

impl ListingCollector {
    pub fn new(profile: SiteProfile) -> Self {
        Self { profile }
    }

    pub fn profile(&self) -> &SiteProfile {
        &self.profile
    }

    pub fn extract_page(
        &self,
        html: &str,
        search_term: &str,
        page_url: &str,
        extracted_at: chrono::DateTime<chrono::Utc>,
    ) -> Result<PageExtraction, CollectorError> {
        self.profile.layout.extract(
            html,
            &PageMeta {
                source_id: self.profile.source_id,
                search_term,
                page_url,
                extracted_at,
            },
        )
    }

    pub(crate) async fn collect_listing(
        &self,
        ctx: &CollectContext<'_>,
    ) -> Result<CollectionOutput, CollectorError> {
        let source_id = self.profile.source_id;
        let terms: Vec<String> = match ctx.search_terms {
            Some(terms) if !terms.is_empty() => terms.to_vec(),
            _ => self
                .profile
                .search_terms
                .iter()
                .map(|t| t.to_string())
                .collect(),
        };

        let mut output = CollectionOutput::default();
        let mut seen = HashSet::new();
        let mut terms_attempted = 0usize;
        let mut last_error: Option<CollectorError> = None;
        let mut first_request = true;

        'terms: for term in &terms {
            if ctx.is_cancelled() {
                info!(source_id, "cancellation requested; stopping before next term");
                output.cancelled = true;
                break;
            }
            if output.records.len() >= ctx.max_records {
                break;
            }
            terms_attempted += 1;

            for page in 0..ctx.max_pages_per_term.max(1) {
                if !first_request {
                    ctx.pacer.pause().await;
                }
                first_request = false;

                let url = match self.profile.search_url(term, page) {
                    Ok(url) => url,
                    Err(err) => {
                        record_term_failure(&mut output, &mut last_error, term, err);
                        continue 'terms;
                    }
                };
                let request = RenderRequest {
                    run_id: ctx.run_id,
                    source_id,
                    url: &url,
                    consent_selectors: self.profile.consent_selectors,
                };
                let rendered = match ctx.renderer.render(&request).await {
                    Ok(rendered) => rendered,
                    Err(err) => {
                        warn!(source_id, term = %term, url = %url, error = %err, "abandoning term");
                        record_term_failure(&mut output, &mut last_error, term, err);
                        continue 'terms;
                    }
                };
                output.pages_visited += 1;

                let extraction =
                    self.extract_page(&rendered.html, term, &rendered.url, rendered.rendered_at)?;
                output.card_misses += extraction.card_misses;

                if extraction.cards_found == 0 {
                    if page == 0 {
                        let err = CollectorError::SelectorMiss {
                            field: "card",
                            url: rendered.url.clone(),
                        };
                        warn!(source_id, term = %term, "no listing cards on first page");
                        record_term_failure(&mut output, &mut last_error, term, err);
                    }
                    continue 'terms;
                }
                debug!(
                    source_id,
                    term = %term,
                    page,
                    cards = extraction.cards_found,
                    misses = extraction.card_misses,
                    selector = extraction.card_selector.unwrap_or_default(),
                    "page extracted"
                );

                for record in extraction.records {
                    let key = record.url.clone().unwrap_or_else(|| {
                        format!(
                            "{}\u{1f}{}",
                            record.title.as_deref().unwrap_or_default(),
                            record.company.as_deref().unwrap_or_default()
                        )
                    });
                    if !seen.insert(key) {
                        continue;
                    }
                    output.records.push(record);
                    if output.records.len() >= ctx.max_records {
                        break 'terms;
                    }
                }
            }
        }

        if output.records.is_empty()
            && terms_attempted > 0
            && output.failed_terms.len() == terms_attempted
        {
            if let Some(err) = last_error {
                return Err(err);
            }
        }

        info!(
            source_id,
            records = output.records.len(),
            pages = output.pages_visited,
            failed_terms = output.failed_terms.len(),
            card_misses = output.card_misses,
            "collection finished"
        );
        Ok(output)
    }
}

fn record_term_failure(
    output: &mut CollectionOutput,
    last_error: &mut Option<CollectorError>,
    term: &str,
    err: CollectorError,
) {
    output.failed_terms.push(TermFailure {
        term: term.to_string(),
        error: err.to_string(),
    });
    *last_error = Some(err);
}

#[async_trait]
impl SiteCollector for ListingCollector {
    fn source_id(&self) -> &'static str {
        self.profile.source_id
    }

    fn display_name(&self) -> &'static str {
        self.profile.display_name
    }

    fn crawlability(&self) -> Crawlability {
        self.profile.crawlability
    }

    async fn collect(&self, ctx: &CollectContext<'_>) -> Result<CollectionOutput, CollectorError> {
        self.collect_listing(ctx).await
    }
}
