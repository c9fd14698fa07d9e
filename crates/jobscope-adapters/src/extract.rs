//! Ordered selector fallbacks for listing cards and their fields.

use chrono::{DateTime, Utc};
use jobscope_core::{FieldProvenance, RawJobRecord};
use reqwest::Url;
use scraper::{ElementRef, Html, Selector};

use crate::CollectorError;

fn parse_selector(selector: &str) -> Result<Selector, CollectorError> {
    Selector::parse(selector).map_err(|e| CollectorError::InvalidSelector {
        selector: selector.to_string(),
        message: e.to_string(),
    })
}

fn text_or_none(value: &str) -> Option<String> {
    let collapsed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

fn element_text(element: ElementRef<'_>) -> Option<String> {
    text_or_none(&element.text().collect::<Vec<_>>().join(" "))
}

/// Selector candidates tried in order; the first one that matches anything wins.
#[derive(Debug, Clone)]
pub struct SelectorChain {
    candidates: Vec<&'static str>,
}

impl SelectorChain {
    pub fn new(candidates: &[&'static str]) -> Self {
        Self {
            candidates: candidates.to_vec(),
        }
    }

    pub fn candidates(&self) -> &[&'static str] {
        &self.candidates
    }

    pub fn select<'a>(
        &self,
        scope: ElementRef<'a>,
    ) -> Result<Option<(&'static str, Vec<ElementRef<'a>>)>, CollectorError> {
        for &candidate in &self.candidates {
            let selector = parse_selector(candidate)?;
            let found = scope.select(&selector).collect::<Vec<_>>();
            if !found.is_empty() {
                return Ok(Some((candidate, found)));
            }
        }
        Ok(None)
    }
}

#[derive(Debug, Clone, Copy)]
pub enum FieldStrategy {
    /// Text of the first descendant matching the selector.
    Text(&'static str),
    /// Attribute of the first descendant matching the selector.
    Attr(&'static str, &'static str),
    /// Attribute on the card element itself.
    CardAttr(&'static str),
}

impl FieldStrategy {
    fn label(&self) -> String {
        match self {
            FieldStrategy::Text(selector) => (*selector).to_string(),
            FieldStrategy::Attr(selector, attr) => format!("{selector}@{attr}"),
            FieldStrategy::CardAttr(attr) => format!("@{attr}"),
        }
    }

    fn apply(&self, card: ElementRef<'_>) -> Result<Option<String>, CollectorError> {
        Ok(match self {
            FieldStrategy::Text(selector) => {
                let sel = parse_selector(selector)?;
                card.select(&sel).find_map(element_text)
            }
            FieldStrategy::Attr(selector, attr) => {
                let sel = parse_selector(selector)?;
                card.select(&sel)
                    .filter_map(|n| n.value().attr(attr))
                    .find_map(text_or_none)
            }
            FieldStrategy::CardAttr(attr) => card.value().attr(attr).and_then(text_or_none),
        })
    }
}

/// Ordered strategies for one field; the first non-empty result wins.
#[derive(Debug, Clone)]
pub struct FieldExtractor {
    pub field: &'static str,
    strategies: Vec<FieldStrategy>,
}

impl FieldExtractor {
    pub fn new(field: &'static str, strategies: &[FieldStrategy]) -> Self {
        Self {
            field,
            strategies: strategies.to_vec(),
        }
    }

    pub fn none(field: &'static str) -> Self {
        Self::new(field, &[])
    }

    pub fn extract(
        &self,
        card: ElementRef<'_>,
    ) -> Result<Option<(String, FieldProvenance)>, CollectorError> {
        for strategy in &self.strategies {
            if let Some(value) = strategy.apply(card)? {
                return Ok(Some((
                    value,
                    FieldProvenance {
                        field: self.field.to_string(),
                        selector: strategy.label(),
                    },
                )));
            }
        }
        Ok(None)
    }
}

/// Field layout of one site's listing cards.
#[derive(Debug, Clone)]
pub struct CardLayout {
    pub cards: SelectorChain,
    pub title: FieldExtractor,
    pub company: FieldExtractor,
    pub location: FieldExtractor,
    pub description: FieldExtractor,
    pub url: FieldExtractor,
    pub salary: FieldExtractor,
    pub contract: FieldExtractor,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageExtraction {
    pub records: Vec<RawJobRecord>,
    pub cards_found: usize,
    pub card_misses: usize,
    pub card_selector: Option<&'static str>,
}

pub(crate) struct PageMeta<'a> {
    pub source_id: &'a str,
    pub search_term: &'a str,
    pub page_url: &'a str,
    pub extracted_at: DateTime<Utc>,
}

impl CardLayout {
    /// Cards without a title are counted as misses and skipped; every other field is optional.
    pub(crate) fn extract(
        &self,
        html: &str,
        meta: &PageMeta<'_>,
    ) -> Result<PageExtraction, CollectorError> {
        let document = Html::parse_document(html);
        let Some((card_selector, cards)) = self.cards.select(document.root_element())? else {
            return Ok(PageExtraction::default());
        };

        let mut extraction = PageExtraction {
            cards_found: cards.len(),
            card_selector: Some(card_selector),
            ..Default::default()
        };

        for card in cards {
            let Some((title, title_from)) = self.title.extract(card)? else {
                extraction.card_misses += 1;
                continue;
            };
            let mut record = RawJobRecord::new(
                meta.source_id,
                meta.search_term,
                meta.page_url,
                meta.extracted_at,
            );
            record.title = Some(title);
            record.provenance.push(title_from);

            let optional = [
                (&self.company, &mut record.company),
                (&self.location, &mut record.location),
                (&self.description, &mut record.description),
                (&self.salary, &mut record.salary_text),
                (&self.contract, &mut record.contract_hint),
            ];
            let mut provenance = Vec::new();
            for (extractor, slot) in optional {
                if let Some((value, from)) = extractor.extract(card)? {
                    *slot = Some(value);
                    provenance.push(from);
                }
            }
            if let Some((href, from)) = self.url.extract(card)? {
                record.url = resolve_url(meta.page_url, &href);
                provenance.push(from);
            }
            record.provenance.extend(provenance);
            extraction.records.push(record);
        }

        Ok(extraction)
    }
}

/// Absolute URL for a card link, relative to the page it was found on.
pub(crate) fn resolve_url(page_url: &str, href: &str) -> Option<String> {
    match Url::parse(href) {
        Ok(url) => Some(url.to_string()),
        Err(_) => Url::parse(page_url)
            .and_then(|base| base.join(href))
            .ok()
            .map(|url| url.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn layout() -> CardLayout {
        CardLayout {
            cards: SelectorChain::new(&[".missing-card", "article.job"]),
            title: FieldExtractor::new(
                "title",
                &[FieldStrategy::Text(".old-title"), FieldStrategy::Text("h2")],
            ),
            company: FieldExtractor::new("company", &[FieldStrategy::Text(".company")]),
            location: FieldExtractor::new("location", &[FieldStrategy::Text(".location")]),
            description: FieldExtractor::none("description"),
            url: FieldExtractor::new(
                "url",
                &[FieldStrategy::Attr("a.link", "href"), FieldStrategy::CardAttr("data-url")],
            ),
            salary: FieldExtractor::none("salary"),
            contract: FieldExtractor::none("contract"),
        }
    }

    fn meta() -> PageMeta<'static> {
        PageMeta {
            source_id: "test",
            search_term: "rust",
            page_url: "https://jobs.example.test/search?q=rust",
            extracted_at: Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).single().expect("ts"),
        }
    }

    const PAGE: &str = r#"
        <html><body>
          <article class="job">
            <h2>  Rust   Engineer </h2>
            <span class="company">Ferris Corp</span>
            <span class="location">Nantes</span>
            <a class="link" href="/jobs/1">apply</a>
          </article>
          <article class="job" data-url="https://elsewhere.test/jobs/2">
            <h2>Backend Developer</h2>
          </article>
          <article class="job"><span class="company">No Title Inc</span></article>
        </body></html>
    "#;

    #[test]
    fn first_matching_candidate_wins_and_titleless_cards_are_misses() {
        let extraction = layout().extract(PAGE, &meta()).expect("extract");
        assert_eq!(extraction.card_selector, Some("article.job"));
        assert_eq!(extraction.cards_found, 3);
        assert_eq!(extraction.card_misses, 1);
        assert_eq!(extraction.records.len(), 2);

        let first = &extraction.records[0];
        assert_eq!(first.title.as_deref(), Some("Rust Engineer"));
        assert_eq!(first.company.as_deref(), Some("Ferris Corp"));
        assert_eq!(first.url.as_deref(), Some("https://jobs.example.test/jobs/1"));
        assert!(first
            .provenance
            .iter()
            .any(|p| p.field == "title" && p.selector == "h2"));

        let second = &extraction.records[1];
        assert_eq!(second.company, None);
        assert_eq!(second.url.as_deref(), Some("https://elsewhere.test/jobs/2"));
    }

    #[test]
    fn page_without_cards_yields_empty_extraction() {
        let extraction = layout()
            .extract("<html><body><p>Aucun résultat</p></body></html>", &meta())
            .expect("extract");
        assert_eq!(extraction, PageExtraction::default());
    }

    #[test]
    fn invalid_selector_is_reported() {
        let mut broken = layout();
        broken.cards = SelectorChain::new(&["article[[["]);
        let err = broken.extract(PAGE, &meta()).expect_err("invalid");
        assert!(matches!(err, CollectorError::InvalidSelector { .. }));
    }
}
