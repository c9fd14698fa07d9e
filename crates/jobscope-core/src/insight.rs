use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::JobRecord;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TechnologyCount {
    pub technology: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompanyCount {
    pub company: String,
    pub count: usize,
}

/// Corpus-wide aggregate, recomputed on demand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketInsight {
    pub total_jobs: usize,
    pub top_technologies: Vec<TechnologyCount>,
    pub remote_percentage: f64,
    pub top_companies: Vec<CompanyCount>,
    pub experience_distribution: BTreeMap<String, usize>,
    pub last_updated: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HiringTrend {
    Active,
    Limited,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompanyInsight {
    pub company: String,
    pub jobs_found: usize,
    pub remote_percentage: f64,
    pub top_technologies: Vec<String>,
    pub hiring_trend: HiringTrend,
    pub last_posted: Option<DateTime<Utc>>,
}

const TOP_TECHNOLOGIES: usize = 10;
const TOP_COMPANIES: usize = 10;
const COMPANY_TOP_TECHNOLOGIES: usize = 5;
const ACTIVE_HIRING_THRESHOLD: usize = 2;

impl MarketInsight {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a JobRecord>) -> Self {
        let mut total = 0usize;
        let mut remote = 0usize;
        let mut technologies: HashMap<&str, usize> = HashMap::new();
        let mut companies: HashMap<&str, usize> = HashMap::new();
        let mut experience: BTreeMap<String, usize> = BTreeMap::new();
        let mut last_updated: Option<DateTime<Utc>> = None;

        for record in records {
            total += 1;
            if record.is_remote() {
                remote += 1;
            }
            for tech in &record.technologies {
                *technologies.entry(tech.as_str()).or_default() += 1;
            }
            *companies.entry(record.company.as_str()).or_default() += 1;
            *experience
                .entry(record.experience_level.as_str().to_string())
                .or_default() += 1;
            last_updated = last_updated.max(Some(record.collected_at));
        }

        Self {
            total_jobs: total,
            top_technologies: top_counts(technologies, TOP_TECHNOLOGIES)
                .into_iter()
                .map(|(technology, count)| TechnologyCount { technology, count })
                .collect(),
            remote_percentage: percentage(remote, total),
            top_companies: top_counts(companies, TOP_COMPANIES)
                .into_iter()
                .map(|(company, count)| CompanyCount { company, count })
                .collect(),
            experience_distribution: experience,
            last_updated,
        }
    }
}

impl CompanyInsight {
    /// `records` are expected to be pre-filtered to the company.
    pub fn from_records<'a>(
        company: &str,
        records: impl IntoIterator<Item = &'a JobRecord>,
    ) -> Self {
        let mut jobs_found = 0usize;
        let mut remote = 0usize;
        let mut technologies: HashMap<&str, usize> = HashMap::new();
        let mut last_posted: Option<DateTime<Utc>> = None;

        for record in records {
            jobs_found += 1;
            if record.is_remote() {
                remote += 1;
            }
            for tech in &record.technologies {
                *technologies.entry(tech.as_str()).or_default() += 1;
            }
            last_posted = last_posted.max(Some(record.collected_at));
        }

        Self {
            company: company.to_string(),
            jobs_found,
            remote_percentage: percentage(remote, jobs_found),
            top_technologies: top_counts(technologies, COMPANY_TOP_TECHNOLOGIES)
                .into_iter()
                .map(|(tech, _)| tech)
                .collect(),
            hiring_trend: if jobs_found > ACTIVE_HIRING_THRESHOLD {
                HiringTrend::Active
            } else {
                HiringTrend::Limited
            },
            last_posted,
        }
    }
}

/// Highest counts first, ties broken alphabetically so output is stable.
pub(crate) fn top_counts(counts: HashMap<&str, usize>, limit: usize) -> Vec<(String, usize)> {
    let mut entries = counts
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect::<Vec<_>>();
    entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    entries.truncate(limit);
    entries
}

fn percentage(part: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    ((part as f64 / total as f64) * 1000.0).round() / 10.0
}
