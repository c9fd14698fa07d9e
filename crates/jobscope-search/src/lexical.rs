//! In-memory inverted index with TF-IDF scoring.
//!
//! The index is a disposable shadow of the knowledge store: every entry is derived from a
//! [`JobRecord`] and the whole structure can be rebuilt by replaying the stored corpus
//! through [`LexicalIndex::index`].
//!
//! Scoring, per query token `t` present in the corpus:
//!
//! ```text
//! tf(t, d)  = frequency(t, d) / terms_in(d)
//! idf(t)    = ln(documents / documents_containing(t))
//! score(d) += tf(t, d) × idf(t)
//! ```
//!
//! Ties are broken by recency (newest first), then fingerprint.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use jobscope_core::JobRecord;
use serde::Serialize;
use tokio::sync::RwLock;

use crate::ScoredDoc;

const MIN_TOKEN_CHARS: usize = 3;

const STOP_WORDS: &[&str] = &[
    // fr
    "les", "des", "une", "est", "pour", "dans", "sur", "avec", "par", "pas", "que", "qui",
    "aux", "ces", "ses", "son", "sont", "nous", "vous", "ils", "elle", "elles", "leur",
    "leurs", "mais", "plus", "tout", "tous", "toute", "toutes", "cette", "notre", "nos",
    "votre", "vos", "être", "avoir", "fait", "comme", "chez", "entre", "sans", "sous",
    // en
    "the", "and", "for", "with", "you", "your", "are", "our", "will", "this", "that",
    "from", "have", "has", "not", "but", "all", "can", "who", "they", "their", "its",
    "was", "were", "been", "into", "about", "what", "which", "when", "where",
];

/// Lowercases, replaces punctuation with separators and drops stop words and tokens of
/// two characters or fewer.
pub fn tokenize(text: &str) -> Vec<String> {
    let lowered = text.to_lowercase();
    lowered
        .split(|c: char| !c.is_alphanumeric())
        .filter(|token| token.chars().count() >= MIN_TOKEN_CHARS)
        .filter(|token| !STOP_WORDS.contains(token))
        .map(str::to_string)
        .collect()
}

/// Derived posting for one (document, term) pair.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LexicalIndexEntry {
    pub fingerprint: String,
    pub term: String,
    pub frequency: usize,
    pub tf_score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LexicalStats {
    pub documents: usize,
    pub unique_terms: usize,
    /// Term present in the most documents, with its document frequency.
    pub top_term: Option<(String, usize)>,
}

#[derive(Debug, Default)]
struct DocTerms {
    collected_at: Option<DateTime<Utc>>,
    frequencies: HashMap<String, usize>,
    total_terms: usize,
}

impl DocTerms {
    fn tf(&self, term: &str) -> Option<f64> {
        let frequency = *self.frequencies.get(term)?;
        if self.total_terms == 0 {
            return None;
        }
        Some(frequency as f64 / self.total_terms as f64)
    }
}

#[derive(Debug, Default)]
struct Corpus {
    docs: HashMap<String, DocTerms>,
    postings: HashMap<String, HashSet<String>>,
}

impl Corpus {
    fn remove(&mut self, fingerprint: &str) -> bool {
        let Some(doc) = self.docs.remove(fingerprint) else {
            return false;
        };
        for term in doc.frequencies.keys() {
            if let Some(holders) = self.postings.get_mut(term) {
                holders.remove(fingerprint);
                if holders.is_empty() {
                    self.postings.remove(term);
                }
            }
        }
        true
    }

    fn insert(&mut self, record: &JobRecord) {
        self.remove(&record.fingerprint);

        let tokens = tokenize(&record.indexable_text());
        let mut frequencies: HashMap<String, usize> = HashMap::new();
        for token in &tokens {
            *frequencies.entry(token.clone()).or_default() += 1;
        }
        for term in frequencies.keys() {
            self.postings
                .entry(term.clone())
                .or_default()
                .insert(record.fingerprint.clone());
        }
        self.docs.insert(
            record.fingerprint.clone(),
            DocTerms {
                collected_at: Some(record.collected_at),
                frequencies,
                total_terms: tokens.len(),
            },
        );
    }
}

#[derive(Debug, Default)]
pub struct LexicalIndex {
    corpus: RwLock<Corpus>,
}

impl LexicalIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces the document for `record.fingerprint`.
    pub async fn index(&self, record: &JobRecord) {
        self.corpus.write().await.insert(record);
    }

    pub async fn remove(&self, fingerprint: &str) -> bool {
        self.corpus.write().await.remove(fingerprint)
    }

    /// Drops everything and replays `records`.
    pub async fn rebuild<'a, I>(&self, records: I) -> usize
    where
        I: IntoIterator<Item = &'a JobRecord>,
    {
        let mut fresh = Corpus::default();
        for record in records {
            fresh.insert(record);
        }
        let count = fresh.docs.len();
        *self.corpus.write().await = fresh;
        count
    }

    pub async fn len(&self) -> usize {
        self.corpus.read().await.docs.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn search(&self, query: &str, limit: usize) -> Vec<ScoredDoc> {
        if limit == 0 {
            return Vec::new();
        }
        let corpus = self.corpus.read().await;
        let total_docs = corpus.docs.len();
        if total_docs == 0 {
            return Vec::new();
        }

        let mut query_terms = tokenize(query);
        let mut seen = HashSet::new();
        query_terms.retain(|t| seen.insert(t.clone()));

        let mut scores: HashMap<&str, f64> = HashMap::new();
        for term in &query_terms {
            let Some(holders) = corpus.postings.get(term) else {
                continue;
            };
            let idf = (total_docs as f64 / holders.len() as f64).ln();
            for fingerprint in holders {
                let tf = corpus
                    .docs
                    .get(fingerprint)
                    .and_then(|doc| doc.tf(term))
                    .unwrap_or(0.0);
                *scores.entry(fingerprint.as_str()).or_default() += tf * idf;
            }
        }

        let mut ranked = scores.into_iter().collect::<Vec<_>>();
        ranked.sort_by(|(fa, sa), (fb, sb)| {
            sb.partial_cmp(sa)
                .unwrap_or(Ordering::Equal)
                .then_with(|| {
                    let ta = corpus.docs.get(*fa).and_then(|d| d.collected_at);
                    let tb = corpus.docs.get(*fb).and_then(|d| d.collected_at);
                    tb.cmp(&ta)
                })
                .then_with(|| fa.cmp(fb))
        });
        ranked.truncate(limit);
        ranked
            .into_iter()
            .map(|(fingerprint, score)| ScoredDoc {
                fingerprint: fingerprint.to_string(),
                score,
            })
            .collect()
    }

    /// Postings of one document, sorted by term.
    pub async fn entries(&self, fingerprint: &str) -> Vec<LexicalIndexEntry> {
        let corpus = self.corpus.read().await;
        let Some(doc) = corpus.docs.get(fingerprint) else {
            return Vec::new();
        };
        let mut entries = doc
            .frequencies
            .iter()
            .map(|(term, frequency)| LexicalIndexEntry {
                fingerprint: fingerprint.to_string(),
                term: term.clone(),
                frequency: *frequency,
                tf_score: doc.tf(term).unwrap_or(0.0),
            })
            .collect::<Vec<_>>();
        entries.sort_by(|a, b| a.term.cmp(&b.term));
        entries
    }

    pub async fn stats(&self) -> LexicalStats {
        let corpus = self.corpus.read().await;
        let top_term = corpus
            .postings
            .iter()
            .map(|(term, holders)| (term.clone(), holders.len()))
            .max_by(|(ta, na), (tb, nb)| na.cmp(nb).then_with(|| tb.cmp(ta)));
        LexicalStats {
            documents: corpus.docs.len(),
            unique_terms: corpus.postings.len(),
            top_term,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::job;

    #[test]
    fn tokenizer_drops_short_tokens_punctuation_and_stop_words() {
        assert_eq!(
            tokenize("Développeur C++/Rust, pour l'équipe & the DATA team!"),
            vec!["développeur", "rust", "équipe", "data", "team"]
        );
    }

    async fn corpus() -> LexicalIndex {
        let index = LexicalIndex::new();
        index
            .rebuild(&[
                job("a", "Backend engineer", "Python services and APIs", 9),
                job("b", "Frontend engineer", "React interfaces", 10),
                job("c", "Platform engineer", "Kubernetes operations", 11),
            ])
            .await;
        index
    }

    #[tokio::test]
    async fn rare_term_ranks_its_document_first() {
        let index = corpus().await;
        let hits = index.search("python", 10).await;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].fingerprint, "a");

        let idf = (3.0f64 / 1.0).ln();
        assert!(idf > 0.0);
        let tf = index
            .entries("a")
            .await
            .into_iter()
            .find(|e| e.term == "python")
            .expect("posting")
            .tf_score;
        assert!((hits[0].score - tf * idf).abs() < 1e-12);
    }

    #[tokio::test]
    async fn ubiquitous_terms_score_zero_and_ties_break_by_recency() {
        let index = corpus().await;
        let hits = index.search("engineer", 10).await;
        let order = hits.iter().map(|h| h.fingerprint.as_str()).collect::<Vec<_>>();
        assert_eq!(order, vec!["c", "b", "a"]);
        assert!(hits.iter().all(|h| h.score == 0.0));
    }

    #[tokio::test]
    async fn unknown_terms_are_skipped_and_empty_corpus_is_fine() {
        let index = corpus().await;
        assert!(index.search("cobol", 10).await.is_empty());
        let hits = index.search("cobol react", 10).await;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].fingerprint, "b");

        let empty = LexicalIndex::new();
        assert!(empty.search("python", 5).await.is_empty());
    }

    #[tokio::test]
    async fn reindexing_replaces_previous_postings() {
        let index = corpus().await;
        index
            .index(&job("a", "Backend engineer", "Go services", 9))
            .await;
        assert!(index.search("python", 10).await.is_empty());
        assert_eq!(index.len().await, 3);

        assert!(index.remove("a").await);
        assert_eq!(index.search("services", 10).await.len(), 0);
    }

    #[tokio::test]
    async fn stats_report_the_most_common_term() {
        let index = corpus().await;
        let stats = index.stats().await;
        assert_eq!(stats.documents, 3);
        // "acme", "engineer", "mid" and "paris" are in every document; ties go to the
        // alphabetically first term.
        assert_eq!(stats.top_term, Some(("acme".to_string(), 3)));
    }
}
