use crate::collector::{ListingCollector, SiteProfile};
use crate::extract::{CardLayout, FieldExtractor, FieldStrategy, SelectorChain};
use crate::Crawlability;

pub const SOURCE_ID: &str = "indeed";

const SEARCH_TERMS: &[&str] = &[
    "développeur python",
    "data scientist",
    "chef de projet",
    "ingénieur",
];
const RESULTS_PER_PAGE: usize = 10;

fn query_params(term: &str, page: usize) -> Vec<(&'static str, String)> {
    vec![
        ("q", term.to_string()),
        ("l", "France".to_string()),
        ("sort", "date".to_string()),
        ("fromage", "7".to_string()),
        ("start", (page * RESULTS_PER_PAGE).to_string()),
    ]
}

pub fn indeed_collector() -> ListingCollector {
    ListingCollector::new(SiteProfile {
        source_id: SOURCE_ID,
        display_name: "Indeed France",
        crawlability: Crawlability::PublicHtml,
        search_base: "https://fr.indeed.com/jobs",
        search_terms: SEARCH_TERMS,
        consent_selectors: &["#onetrust-accept-btn-handler"],
        query_params,
        layout: CardLayout {
            cards: SelectorChain::new(&[
                "div.job_seen_beacon",
                "td.resultContent",
                "[data-jk]",
            ]),
            title: FieldExtractor::new(
                "title",
                &[
                    FieldStrategy::Text("h2.jobTitle span[title]"),
                    FieldStrategy::Text("[data-testid='jobTitle']"),
                    FieldStrategy::Text("h2.jobTitle"),
                ],
            ),
            company: FieldExtractor::new(
                "company",
                &[
                    FieldStrategy::Text("[data-testid='company-name']"),
                    FieldStrategy::Text(".companyName"),
                ],
            ),
            location: FieldExtractor::new(
                "location",
                &[
                    FieldStrategy::Text("[data-testid='text-location']"),
                    FieldStrategy::Text(".companyLocation"),
                ],
            ),
            description: FieldExtractor::new(
                "description",
                &[
                    FieldStrategy::Text("[data-testid='jobsnippet_footer']"),
                    FieldStrategy::Text(".job-snippet"),
                ],
            ),
            url: FieldExtractor::new(
                "url",
                &[
                    FieldStrategy::Attr("h2.jobTitle a", "href"),
                    FieldStrategy::Attr("a[data-jk]", "href"),
                ],
            ),
            salary: FieldExtractor::new(
                "salary",
                &[
                    FieldStrategy::Text(".salary-snippet-container"),
                    FieldStrategy::Text("[data-testid='attribute_snippet_testid'].salary"),
                ],
            ),
            contract: FieldExtractor::new(
                "contract",
                &[FieldStrategy::Text("[data-testid='attribute_snippet_testid']")],
            ),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fixture_dir;
    use chrono::Utc;

    #[test]
    fn pagination_uses_result_offsets() {
        let collector = indeed_collector();
        let url = collector.profile().search_url("data scientist", 2).expect("url");
        assert_eq!(
            url,
            "https://fr.indeed.com/jobs?q=data+scientist&l=France&sort=date&fromage=7&start=20"
        );
    }

    #[test]
    fn extracts_salary_and_contract_hints() {
        let html = std::fs::read_to_string(fixture_dir().join("indeed/search_data_scientist_p1.html"))
            .expect("fixture");
        let page_url =
            "https://fr.indeed.com/jobs?q=data+scientist&l=France&sort=date&fromage=7&start=0";
        let extraction = indeed_collector()
            .extract_page(&html, "data scientist", page_url, Utc::now())
            .expect("extract");

        assert_eq!(extraction.card_selector, Some("div.job_seen_beacon"));
        assert_eq!(extraction.records.len(), 3);
        let first = &extraction.records[0];
        assert_eq!(first.title.as_deref(), Some("Data Scientist Senior"));
        assert_eq!(first.salary_text.as_deref(), Some("55 000 € - 70 000 € par an"));
        assert_eq!(first.contract_hint.as_deref(), Some("CDI"));
        assert_eq!(
            first.url.as_deref(),
            Some("https://fr.indeed.com/rc/clk?jk=a1b2c3")
        );
    }
}
