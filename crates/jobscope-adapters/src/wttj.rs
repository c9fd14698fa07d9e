use crate::collector::{ListingCollector, SiteProfile};
use crate::extract::{CardLayout, FieldExtractor, FieldStrategy, SelectorChain};
use crate::Crawlability;

pub const SOURCE_ID: &str = "wttj";

const SEARCH_TERMS: &[&str] = &["développeur", "data scientist", "chef de projet", "commercial"];

fn query_params(term: &str, page: usize) -> Vec<(&'static str, String)> {
    vec![("query", term.to_string()), ("page", (page + 1).to_string())]
}

/// Welcome to the Jungle. Class names are hashed per deploy, so the chains lean on
/// `data-testid` hooks and substring class matches.
pub fn wttj_collector() -> ListingCollector {
    ListingCollector::new(SiteProfile {
        source_id: SOURCE_ID,
        display_name: "Welcome to the Jungle",
        crawlability: Crawlability::PublicHtml,
        search_base: "https://www.welcometothejungle.com/fr/jobs",
        search_terms: SEARCH_TERMS,
        consent_selectors: &["#axeptio_btn_acceptAll", "button[data-testid='cookie-accept']"],
        query_params,
        layout: CardLayout {
            cards: SelectorChain::new(&[
                "[data-testid='search-results-list-item-wrapper']",
                "li[data-testid*='search-results']",
                "a[href*='/jobs/']",
            ]),
            title: FieldExtractor::new(
                "title",
                &[
                    FieldStrategy::Text("h4"),
                    FieldStrategy::Text("[class*='title']"),
                    FieldStrategy::Text("h3"),
                ],
            ),
            company: FieldExtractor::new(
                "company",
                &[
                    FieldStrategy::Text("[data-testid='job-card-company-name']"),
                    FieldStrategy::Text("[class*='company']"),
                ],
            ),
            location: FieldExtractor::new(
                "location",
                &[
                    FieldStrategy::Text("[data-testid='job-card-location']"),
                    FieldStrategy::Text("[class*='location']"),
                ],
            ),
            description: FieldExtractor::new(
                "description",
                &[
                    FieldStrategy::Text("[class*='description']"),
                    FieldStrategy::Text("p"),
                ],
            ),
            url: FieldExtractor::new(
                "url",
                &[
                    FieldStrategy::Attr("a[href*='/jobs/']", "href"),
                    FieldStrategy::CardAttr("href"),
                ],
            ),
            salary: FieldExtractor::new(
                "salary",
                &[FieldStrategy::Text("[data-testid='job-card-salary']")],
            ),
            contract: FieldExtractor::new(
                "contract",
                &[
                    FieldStrategy::Text("[data-testid='job-card-contract']"),
                    FieldStrategy::Text("[class*='contract']"),
                ],
            ),
        },
    })
}
