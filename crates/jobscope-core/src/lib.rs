//! Core job-posting model shared by collectors, the ingest pipeline and search.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

mod insight;
mod run;

pub use insight::{CompanyCount, CompanyInsight, HiringTrend, MarketInsight, TechnologyCount};
pub use run::{
    CollectionRun, JobSample, RunStatus, SourceOutcome, SourcePhase, SourceStatus, TermFailure,
};

pub const CRATE_NAME: &str = "jobscope-core";

/// Records which selector candidate produced a raw field, for markup-drift debugging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldProvenance {
    pub field: String,
    pub selector: String,
}

/// Unprocessed posting as extracted from one listing card.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawJobRecord {
    pub source_id: String,
    pub search_term: String,
    pub page_url: String,
    pub extracted_at: DateTime<Utc>,
    pub title: Option<String>,
    pub company: Option<String>,
    pub location: Option<String>,
    pub description: Option<String>,
    pub url: Option<String>,
    pub salary_text: Option<String>,
    pub contract_hint: Option<String>,
    #[serde(default)]
    pub provenance: Vec<FieldProvenance>,
}

impl RawJobRecord {
    pub fn new(
        source_id: impl Into<String>,
        search_term: impl Into<String>,
        page_url: impl Into<String>,
        extracted_at: DateTime<Utc>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            search_term: search_term.into(),
            page_url: page_url.into(),
            extracted_at,
            title: None,
            company: None,
            location: None,
            description: None,
            url: None,
            salary_text: None,
            contract_hint: None,
            provenance: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Salary {
    Range { min: u32, max: u32, currency: String },
    Text { text: String },
}

impl Salary {
    pub fn bounds(&self) -> Option<(u32, u32)> {
        match self {
            Salary::Range { min, max, .. } => Some((*min, *max)),
            Salary::Text { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteType {
    FullRemote,
    Hybrid,
    OnSite,
    Unknown,
}

impl RemoteType {
    pub fn as_str(self) -> &'static str {
        match self {
            RemoteType::FullRemote => "full_remote",
            RemoteType::Hybrid => "hybrid",
            RemoteType::OnSite => "on_site",
            RemoteType::Unknown => "unknown",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "full_remote" => Some(RemoteType::FullRemote),
            "hybrid" => Some(RemoteType::Hybrid),
            "on_site" => Some(RemoteType::OnSite),
            "unknown" => Some(RemoteType::Unknown),
            _ => None,
        }
    }

    /// Whether the posting allows at least some remote work.
    pub fn is_remote(self) -> bool {
        matches!(self, RemoteType::FullRemote | RemoteType::Hybrid)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperienceLevel {
    Junior,
    Mid,
    Senior,
    Lead,
}

impl ExperienceLevel {
    pub const ALL: [ExperienceLevel; 4] = [
        ExperienceLevel::Junior,
        ExperienceLevel::Mid,
        ExperienceLevel::Senior,
        ExperienceLevel::Lead,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ExperienceLevel::Junior => "junior",
            ExperienceLevel::Mid => "mid",
            ExperienceLevel::Senior => "senior",
            ExperienceLevel::Lead => "lead",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        let label = label.trim().to_ascii_lowercase();
        Self::ALL.into_iter().find(|level| level.as_str() == label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractType {
    Permanent,
    FixedTerm,
    Freelance,
    Internship,
    Apprenticeship,
}

impl ContractType {
    pub fn as_str(self) -> &'static str {
        match self {
            ContractType::Permanent => "permanent",
            ContractType::FixedTerm => "fixed_term",
            ContractType::Freelance => "freelance",
            ContractType::Internship => "internship",
            ContractType::Apprenticeship => "apprenticeship",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "permanent" => Some(ContractType::Permanent),
            "fixed_term" => Some(ContractType::FixedTerm),
            "freelance" => Some(ContractType::Freelance),
            "internship" => Some(ContractType::Internship),
            "apprenticeship" => Some(ContractType::Apprenticeship),
            _ => None,
        }
    }
}

/// Canonical, normalized posting. The fingerprint is its identity in the store and indices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub fingerprint: String,
    pub title: String,
    pub company: String,
    pub location: String,
    pub description_raw: String,
    pub description: String,
    pub technologies: BTreeSet<String>,
    pub requirements: Vec<String>,
    pub salary: Option<Salary>,
    pub remote_type: RemoteType,
    pub remote_confidence: f64,
    pub experience_level: ExperienceLevel,
    pub contract_type: ContractType,
    pub quality_score: f64,
    pub source_id: String,
    pub url: Option<String>,
    pub search_term: String,
    pub collected_at: DateTime<Utc>,
    pub active: bool,
}

impl JobRecord {
    pub fn is_remote(&self) -> bool {
        self.remote_type.is_remote()
    }

    /// Text fed to the lexical and semantic indices.
    pub fn indexable_text(&self) -> String {
        let technologies = self
            .technologies
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(" ");
        [
            self.title.as_str(),
            self.company.as_str(),
            self.location.as_str(),
            self.description.as_str(),
            technologies.as_str(),
            self.experience_level.as_str(),
            self.requirements.join(" ").as_str(),
        ]
        .join(" ")
    }

    pub fn sample(&self) -> JobSample {
        JobSample {
            fingerprint: self.fingerprint.clone(),
            title: self.title.clone(),
            company: self.company.clone(),
            location: self.location.clone(),
            url: self.url.clone(),
            technologies: self.technologies.iter().cloned().collect(),
        }
    }
}

/// Conjunctive read filters; `None` means "any".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobFilters {
    pub location: Option<String>,
    pub experience_level: Option<ExperienceLevel>,
    pub remote: Option<bool>,
    pub company: Option<String>,
}

impl JobFilters {
    pub fn is_empty(&self) -> bool {
        self.location.is_none()
            && self.experience_level.is_none()
            && self.remote.is_none()
            && self.company.is_none()
    }

    pub fn matches(&self, record: &JobRecord) -> bool {
        if let Some(location) = &self.location {
            if !contains_ci(&record.location, location) {
                return false;
            }
        }
        if let Some(company) = &self.company {
            if !contains_ci(&record.company, company) {
                return false;
            }
        }
        if let Some(level) = self.experience_level {
            if record.experience_level != level {
                return false;
            }
        }
        if let Some(remote) = self.remote {
            if record.is_remote() != remote {
                return false;
            }
        }
        true
    }
}

fn contains_ci(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.trim().to_lowercase())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Subsystem {
    Lexical,
    Semantic,
    Store,
}

/// Ranked, ephemeral projection of a stored record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    pub record: JobRecord,
    pub score: f64,
    pub subsystems: Vec<Subsystem>,
}

/// Cooperative cancellation checked between sources and between search terms.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use chrono::TimeZone;

    pub fn job(fingerprint: &str, title: &str, company: &str) -> JobRecord {
        JobRecord {
            fingerprint: fingerprint.to_string(),
            title: title.to_string(),
            company: company.to_string(),
            location: "Paris".to_string(),
            description_raw: String::new(),
            description: String::new(),
            technologies: BTreeSet::new(),
            requirements: Vec::new(),
            salary: None,
            remote_type: RemoteType::Unknown,
            remote_confidence: 0.0,
            experience_level: ExperienceLevel::Mid,
            contract_type: ContractType::Permanent,
            quality_score: 0.0,
            source_id: "wttj".to_string(),
            url: None,
            search_term: "data".to_string(),
            collected_at: Utc
                .with_ymd_and_hms(2026, 3, 2, 9, 0, 0)
                .single()
                .expect("valid timestamp"),
            active: true,
        }
    }
}
