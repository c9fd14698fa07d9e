use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    Pending,
    Success,
    Partial,
    Failed,
    LoginFailed,
    CredentialsMissing,
    UnknownSource,
    Cancelled,
}

impl SourceStatus {
    /// Success or partial success; anything else produced nothing usable.
    pub fn is_usable(self) -> bool {
        matches!(self, SourceStatus::Success | SourceStatus::Partial)
    }
}

/// Per-source lifecycle inside a running collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourcePhase {
    Pending,
    Collecting,
    Normalizing,
    Stored,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermFailure {
    pub term: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSample {
    pub fingerprint: String,
    pub title: String,
    pub company: String,
    pub location: String,
    pub url: Option<String>,
    pub technologies: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceOutcome {
    pub source_id: String,
    pub status: SourceStatus,
    pub phase: SourcePhase,
    pub collected: usize,
    pub normalized: usize,
    pub dropped: usize,
    pub inserted: usize,
    pub duplicates: usize,
    pub collapsed: usize,
    /// Normalized records the store refused; the rest of the batch still went in.
    #[serde(default)]
    pub store_failures: usize,
    pub card_misses: usize,
    pub pages_visited: usize,
    pub failed_terms: Vec<TermFailure>,
    pub error: Option<String>,
    pub duration_ms: u64,
    pub sample: Vec<JobSample>,
}

impl SourceOutcome {
    pub fn pending(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            status: SourceStatus::Pending,
            phase: SourcePhase::Pending,
            collected: 0,
            normalized: 0,
            dropped: 0,
            inserted: 0,
            duplicates: 0,
            collapsed: 0,
            store_failures: 0,
            card_misses: 0,
            pages_visited: 0,
            failed_terms: Vec::new(),
            error: None,
            duration_ms: 0,
            sample: Vec::new(),
        }
    }

    pub fn fail(&mut self, status: SourceStatus, error: impl Into<String>) {
        self.status = status;
        self.phase = SourcePhase::Failed;
        self.error = Some(error.into());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    NoData,
}

/// One orchestrator execution. Built incrementally while sources run, then sealed by
/// [`CollectionRun::finish`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionRun {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub requested_sources: Vec<String>,
    pub max_jobs_per_source: usize,
    pub status: RunStatus,
    pub sources: BTreeMap<String, SourceOutcome>,
    pub total_collected: usize,
    pub total_inserted: usize,
    pub total_duplicates: usize,
    pub duration_ms: u64,
}

impl CollectionRun {
    pub fn start(requested_sources: Vec<String>, max_jobs_per_source: usize) -> Self {
        let sources = requested_sources
            .iter()
            .map(|id| (id.clone(), SourceOutcome::pending(id.clone())))
            .collect();
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: None,
            requested_sources,
            max_jobs_per_source,
            status: RunStatus::Running,
            sources,
            total_collected: 0,
            total_inserted: 0,
            total_duplicates: 0,
            duration_ms: 0,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }

    /// Records a source outcome. Ignored once the run is sealed.
    pub fn record(&mut self, outcome: SourceOutcome) {
        if self.is_finished() {
            return;
        }
        self.total_collected += outcome.collected;
        self.total_inserted += outcome.inserted;
        self.total_duplicates += outcome.duplicates + outcome.collapsed;
        self.sources.insert(outcome.source_id.clone(), outcome);
    }

    /// Sources still pending when the run ends are marked cancelled.
    pub fn finish(mut self, finished_at: DateTime<Utc>) -> Self {
        if self.is_finished() {
            return self;
        }
        for outcome in self.sources.values_mut() {
            if outcome.status == SourceStatus::Pending {
                outcome.fail(SourceStatus::Cancelled, "run ended before the source started");
            }
        }
        self.status = if self.sources.values().any(|o| o.status.is_usable()) {
            RunStatus::Completed
        } else {
            RunStatus::NoData
        };
        self.duration_ms = (finished_at - self.started_at).num_milliseconds().max(0) as u64;
        self.finished_at = Some(finished_at);
        self
    }

    pub fn successful_sources(&self) -> usize {
        self.sources.values().filter(|o| o.status.is_usable()).count()
    }
}
