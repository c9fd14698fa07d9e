use async_trait::async_trait;
use reqwest::Url;
use scraper::{Html, Selector};
use tracing::{info, warn};
use uuid::Uuid;

use crate::collector::{ListingCollector, SiteProfile};
use crate::extract::{CardLayout, FieldExtractor, FieldStrategy, SelectorChain};
use crate::render::{FormSubmission, PageRenderer, RenderRequest};
use crate::{
    AuthError, CollectContext, CollectionOutput, CollectorError, Crawlability, Credentials,
    SiteCollector,
};

pub const SOURCE_ID: &str = "linkedin";

const LOGIN_URL: &str = "https://www.linkedin.com/login";
const LOGIN_SUBMIT_URL: &str = "https://www.linkedin.com/checkpoint/lg/login-submit";
const SEARCH_TERMS: &[&str] = &["développeur python", "data scientist", "chef de projet digital"];
const RESULTS_PER_PAGE: usize = 25;

fn query_params(term: &str, page: usize) -> Vec<(&'static str, String)> {
    vec![
        ("keywords", term.to_string()),
        ("location", "France".to_string()),
        ("start", (page * RESULTS_PER_PAGE).to_string()),
    ]
}

fn profile() -> SiteProfile {
    SiteProfile {
        source_id: SOURCE_ID,
        display_name: "LinkedIn",
        crawlability: Crawlability::Gated,
        search_base: "https://www.linkedin.com/jobs/search/",
        search_terms: SEARCH_TERMS,
        consent_selectors: &["button[action-type='ACCEPT']"],
        query_params,
        layout: CardLayout {
            cards: SelectorChain::new(&[
                "li.jobs-search-results__list-item",
                "div.job-card-container",
                "div.base-search-card",
            ]),
            title: FieldExtractor::new(
                "title",
                &[
                    FieldStrategy::Text("a.job-card-list__title"),
                    FieldStrategy::Text("h3.base-search-card__title"),
                    FieldStrategy::Text("h3"),
                ],
            ),
            company: FieldExtractor::new(
                "company",
                &[
                    FieldStrategy::Text(".job-card-container__primary-description"),
                    FieldStrategy::Text("h4.base-search-card__subtitle"),
                ],
            ),
            location: FieldExtractor::new(
                "location",
                &[
                    FieldStrategy::Text(".job-card-container__metadata-item"),
                    FieldStrategy::Text(".job-search-card__location"),
                ],
            ),
            description: FieldExtractor::new(
                "description",
                &[FieldStrategy::Text(".job-card-list__insight")],
            ),
            url: FieldExtractor::new(
                "url",
                &[
                    FieldStrategy::Attr("a.job-card-list__title", "href"),
                    FieldStrategy::Attr("a.base-card__full-link", "href"),
                ],
            ),
            salary: FieldExtractor::new(
                "salary",
                &[FieldStrategy::Text(".job-search-card__salary-info")],
            ),
            contract: FieldExtractor::none("contract"),
        },
    }
}

/// LinkedIn requires a logged-in session before the search pages list anything.
pub struct LinkedInCollector {
    listing: ListingCollector,
}

pub fn linkedin_collector() -> LinkedInCollector {
    LinkedInCollector {
        listing: ListingCollector::new(profile()),
    }
}

impl LinkedInCollector {
    pub fn listing(&self) -> &ListingCollector {
        &self.listing
    }
}

/// Hidden inputs (CSRF tokens and the like) carried by the login form.
fn hidden_login_fields(html: &str) -> Vec<(String, String)> {
    let document = Html::parse_document(html);
    let selector = Selector::parse("form input[type='hidden']").expect("valid selector");
    document
        .select(&selector)
        .filter_map(|input| {
            let name = input.value().attr("name")?;
            let value = input.value().attr("value").unwrap_or_default();
            Some((name.to_string(), value.to_string()))
        })
        .collect()
}

fn landed_on_feed(final_url: &str) -> bool {
    Url::parse(final_url).is_ok_and(|url| url.path().starts_with("/feed"))
}

#[async_trait]
impl SiteCollector for LinkedInCollector {
    fn source_id(&self) -> &'static str {
        SOURCE_ID
    }

    fn display_name(&self) -> &'static str {
        self.listing.profile().display_name
    }

    fn crawlability(&self) -> Crawlability {
        Crawlability::Gated
    }

    async fn authenticate(
        &self,
        run_id: Uuid,
        renderer: &dyn PageRenderer,
        credentials: Option<&Credentials>,
    ) -> Result<(), AuthError> {
        let Some(credentials) = credentials else {
            return Err(AuthError::CredentialsMissing);
        };

        let login_page = renderer
            .render(&RenderRequest {
                run_id,
                source_id: SOURCE_ID,
                url: LOGIN_URL,
                consent_selectors: self.listing.profile().consent_selectors,
            })
            .await
            .map_err(|e| AuthError::LoginFailed(e.to_string()))?;

        let mut fields = hidden_login_fields(&login_page.html);
        fields.push(("session_key".to_string(), credentials.username.clone()));
        fields.push(("session_password".to_string(), credentials.password.clone()));

        let landed = renderer
            .submit_form(&FormSubmission {
                run_id,
                source_id: SOURCE_ID,
                action_url: LOGIN_SUBMIT_URL,
                fields,
            })
            .await
            .map_err(|e| AuthError::LoginFailed(e.to_string()))?;

        if landed_on_feed(&landed.url) {
            info!(source_id = SOURCE_ID, "login succeeded");
            Ok(())
        } else {
            warn!(source_id = SOURCE_ID, landed = %landed.url, "login did not reach the feed");
            Err(AuthError::LoginFailed(format!(
                "landed on {} instead of the feed",
                landed.url
            )))
        }
    }

    async fn collect(&self, ctx: &CollectContext<'_>) -> Result<CollectionOutput, CollectorError> {
        self.listing.collect_listing(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::StaticPageRenderer;

    fn credentials() -> Credentials {
        Credentials {
            username: "analyst@example.test".into(),
            password: "secret".into(),
        }
    }

    #[tokio::test]
    async fn missing_credentials_short_circuit() {
        let renderer = StaticPageRenderer::new();
        let err = linkedin_collector()
            .authenticate(Uuid::nil(), &renderer, None)
            .await
            .expect_err("no credentials");
        assert_eq!(err, AuthError::CredentialsMissing);
    }

    #[tokio::test]
    async fn login_succeeds_when_the_feed_is_reached() {
        let renderer = StaticPageRenderer::new()
            .with_page(
                LOGIN_URL,
                r#"<form><input type="hidden" name="loginCsrfParam" value="abc"></form>"#,
            )
            .with_login_result(SOURCE_ID, "https://www.linkedin.com/feed/");
        linkedin_collector()
            .authenticate(Uuid::nil(), &renderer, Some(&credentials()))
            .await
            .expect("login");
    }

    #[tokio::test]
    async fn login_rejected_when_left_on_checkpoint() {
        let renderer = StaticPageRenderer::new();
        let err = linkedin_collector()
            .authenticate(Uuid::nil(), &renderer, Some(&credentials()))
            .await
            .expect_err("rejected");
        assert!(matches!(err, AuthError::LoginFailed(_)));
    }

    #[test]
    fn hidden_fields_are_carried_into_the_form() {
        let fields = hidden_login_fields(
            r#"<form><input type="hidden" name="csrf" value="t0k"><input type="text" name="q"></form>"#,
        );
        assert_eq!(fields, vec![("csrf".to_string(), "t0k".to_string())]);
    }

    #[test]
    fn search_url_paginates_by_25() {
        let url = linkedin_collector()
            .listing()
            .profile()
            .search_url("data scientist", 1)
            .expect("url");
        assert_eq!(
            url,
            "https://www.linkedin.com/jobs/search/?keywords=data+scientist&location=France&start=25"
        );
    }
}
