use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use jobscope_core::{CollectionRun, JobRecord, JobSample, RunStatus, SourceStatus};
use serde::{Deserialize, Serialize};

use crate::normalize::{technology_category, TechCategory};

const TOP_TECHNOLOGIES: usize = 15;
const SAMPLE_JOBS: usize = 5;
pub const HIGH_QUALITY_THRESHOLD: f64 = 7.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub status: RunStatus,
    pub requested_sources: usize,
    pub successful_sources: usize,
    pub failed_sources: usize,
    pub total_collected: usize,
    pub total_dropped: usize,
    pub total_inserted: usize,
    pub total_duplicates: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityAnalysis {
    pub records: usize,
    pub average_score: f64,
    pub high_quality: usize,
    pub with_salary: usize,
    pub remote: usize,
    pub with_technologies: usize,
}

impl QualityAnalysis {
    pub fn from_records(records: &[JobRecord]) -> Self {
        if records.is_empty() {
            return Self::default();
        }
        let total = records.iter().map(|r| r.quality_score).sum::<f64>();
        Self {
            records: records.len(),
            average_score: (total / records.len() as f64 * 100.0).round() / 100.0,
            high_quality: records
                .iter()
                .filter(|r| r.quality_score >= HIGH_QUALITY_THRESHOLD)
                .count(),
            with_salary: records.iter().filter(|r| r.salary.is_some()).count(),
            remote: records.iter().filter(|r| r.is_remote()).count(),
            with_technologies: records.iter().filter(|r| !r.technologies.is_empty()).count(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TechnologyTrend {
    pub technology: String,
    pub category: Option<TechCategory>,
    pub count: usize,
}

/// Most frequent technologies, ties broken alphabetically.
pub fn technology_trends(records: &[JobRecord], top: usize) -> Vec<TechnologyTrend> {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for tech in records.iter().flat_map(|r| r.technologies.iter()) {
        *counts.entry(tech.as_str()).or_default() += 1;
    }
    let mut ranked = counts.into_iter().collect::<Vec<_>>();
    ranked.sort_by(|(ta, a), (tb, b)| b.cmp(a).then_with(|| ta.cmp(tb)));
    ranked
        .into_iter()
        .take(top)
        .map(|(technology, count)| TechnologyTrend {
            technology: technology.to_string(),
            category: technology_category(technology),
            count,
        })
        .collect()
}

/// Audit document for one run. Always well-formed, whatever happened to the sources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionRunReport {
    pub run: CollectionRun,
    pub summary: RunSummary,
    pub quality: QualityAnalysis,
    pub technology_trends: Vec<TechnologyTrend>,
    pub sample_jobs: Vec<JobSample>,
    #[serde(default)]
    pub report_path: Option<String>,
}

impl CollectionRunReport {
    /// `records` are the run's accepted (normalized, not collapsed) records.
    pub fn build(run: CollectionRun, records: &[JobRecord]) -> Self {
        let summary = RunSummary {
            status: run.status,
            requested_sources: run.requested_sources.len(),
            successful_sources: run.successful_sources(),
            failed_sources: run
                .sources
                .values()
                .filter(|o| !o.status.is_usable())
                .count(),
            total_collected: run.total_collected,
            total_dropped: run.sources.values().map(|o| o.dropped).sum(),
            total_inserted: run.total_inserted,
            total_duplicates: run.total_duplicates,
        };
        Self {
            summary,
            quality: QualityAnalysis::from_records(records),
            technology_trends: technology_trends(records, TOP_TECHNOLOGIES),
            sample_jobs: records.iter().take(SAMPLE_JOBS).map(JobRecord::sample).collect(),
            report_path: None,
            run,
        }
    }
}

fn status_label(status: SourceStatus) -> &'static str {
    match status {
        SourceStatus::Pending => "pending",
        SourceStatus::Success => "success",
        SourceStatus::Partial => "partial",
        SourceStatus::Failed => "failed",
        SourceStatus::LoginFailed => "login failed",
        SourceStatus::CredentialsMissing => "credentials missing",
        SourceStatus::UnknownSource => "unknown source",
        SourceStatus::Cancelled => "cancelled",
    }
}

pub fn render_brief_markdown(report: &CollectionRunReport) -> String {
    let run = &report.run;
    let mut lines = vec![
        "# Jobscope Run Brief".to_string(),
        String::new(),
        format!("- Run ID: `{}`", run.run_id),
        format!("- Started: {}", run.started_at.to_rfc3339()),
        format!(
            "- Finished: {}",
            run.finished_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "-".to_string())
        ),
        format!("- Status: {:?}", run.status),
        format!(
            "- Sources: {}/{} usable",
            report.summary.successful_sources, report.summary.requested_sources
        ),
        format!(
            "- Collected {}, inserted {}, duplicates {}, dropped {}",
            run.total_collected,
            run.total_inserted,
            run.total_duplicates,
            report.summary.total_dropped
        ),
        String::new(),
        "## Sources".to_string(),
    ];
    for outcome in run.sources.values() {
        let mut line = format!(
            "- {}: {} ({} collected, {} inserted, {} card misses)",
            outcome.source_id,
            status_label(outcome.status),
            outcome.collected,
            outcome.inserted,
            outcome.card_misses
        );
        if let Some(error) = &outcome.error {
            line.push_str(&format!(" - {error}"));
        }
        lines.push(line);
        for failure in &outcome.failed_terms {
            lines.push(format!("  - term `{}`: {}", failure.term, failure.error));
        }
    }

    let quality = &report.quality;
    lines.push(String::new());
    lines.push("## Quality".to_string());
    lines.push(format!("- Average score: {:.2}", quality.average_score));
    lines.push(format!("- High quality (>= 7): {}", quality.high_quality));
    lines.push(format!("- With salary: {}", quality.with_salary));
    lines.push(format!("- Remote-friendly: {}", quality.remote));

    if !report.technology_trends.is_empty() {
        lines.push(String::new());
        lines.push("## Technologies".to_string());
        for trend in &report.technology_trends {
            lines.push(format!("- {}: {}", trend.technology, trend.count));
        }
    }
    lines.push(String::new());
    lines.join("\n")
}

/// Digest of the newest `runs` run reports under `reports_dir`.
pub fn report_history_markdown(reports_dir: &Path, runs: usize) -> Result<String> {
    let mut dirs = std::fs::read_dir(reports_dir)
        .with_context(|| format!("reading {}", reports_dir.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().join("run_report.json").is_file())
        .collect::<Vec<_>>();
    dirs.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());
    dirs.reverse();

    let mut lines = vec!["# Jobscope Run History".to_string(), String::new()];
    for dir in dirs.into_iter().take(runs.max(1)) {
        let report_path = dir.path().join("run_report.json");
        let report: CollectionRunReport = serde_json::from_str(
            &std::fs::read_to_string(&report_path)
                .with_context(|| format!("reading {}", report_path.display()))?,
        )
        .with_context(|| format!("parsing {}", report_path.display()))?;

        lines.push(format!("## Run `{}`", report.run.run_id));
        lines.push(format!("- started: {}", report.run.started_at.to_rfc3339()));
        lines.push(format!("- status: {:?}", report.run.status));
        lines.push(format!(
            "- inserted: {} of {} collected",
            report.summary.total_inserted, report.summary.total_collected
        ));
        let failed = report
            .run
            .sources
            .values()
            .filter(|o| !o.status.is_usable())
            .map(|o| format!("{} ({})", o.source_id, status_label(o.status)))
            .collect::<Vec<_>>();
        if !failed.is_empty() {
            lines.push(format!("- failed sources: {}", failed.join(", ")));
        }
        if let Some(top) = report.technology_trends.first() {
            lines.push(format!("- top technology: {} ({})", top.technology, top.count));
        }
        let brief = dir.path().join("run_brief.md");
        if brief.exists() {
            lines.push(format!("- brief: `{}`", brief.display()));
        }
        lines.push(String::new());
    }

    Ok(lines.join("\n"))
}
