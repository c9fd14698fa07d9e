use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand, ValueEnum};
use jobscope_core::{CancelFlag, ExperienceLevel, JobFilters};
use jobscope_sync::{
    export_corpus, render_brief_markdown, report_history_markdown, Jobscope, JobscopeConfig,
};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "jobscope")]
#[command(about = "Job-posting collection, search and market insights")]
struct Cli {
    /// -v for debug, -vv for trace.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run every enabled collector once and ingest the results.
    Scrape {
        /// Comma-separated source ids; defaults to every enabled source.
        #[arg(long, value_delimiter = ',')]
        sources: Option<Vec<String>>,
        #[arg(long)]
        max_jobs: Option<usize>,
    },
    /// Hybrid search over the active corpus.
    Search {
        query: String,
        #[arg(long)]
        location: Option<String>,
        /// junior, mid, senior or lead.
        #[arg(long)]
        experience: Option<String>,
        #[arg(long)]
        remote: Option<bool>,
        #[arg(long)]
        company: Option<String>,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Market-wide aggregates.
    Insights,
    /// Per-company aggregates.
    Company { name: String },
    /// Rebuild both indexes from the store.
    Reindex,
    /// Write a Parquet snapshot of the active corpus.
    Export {
        #[arg(long, default_value = "exports/latest")]
        out: PathBuf,
    },
    /// Markdown history of recent runs.
    Reports {
        #[arg(long, default_value_t = 10)]
        runs: usize,
    },
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);

    let config = JobscopeConfig::from_env();
    match cli.command.unwrap_or(Commands::Stats) {
        Commands::Scrape { sources, max_jobs } => {
            let app = Jobscope::open(config).await?;
            let cancel = CancelFlag::new();
            let on_interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received; finishing the current source");
                    on_interrupt.cancel();
                }
            });

            let orchestrator = app.orchestrator()?.with_cancel(cancel);
            let report = orchestrator
                .run_full_scrape(sources.as_deref(), max_jobs)
                .await?;
            println!("{}", render_brief_markdown(&report));
            if let Some(path) = &report.report_path {
                info!(report = %path, "run report written");
            }
        }
        Commands::Search {
            query,
            location,
            experience,
            remote,
            company,
            limit,
        } => {
            let experience_level = match experience.as_deref() {
                Some(label) => match ExperienceLevel::from_label(label) {
                    Some(level) => Some(level),
                    None => bail!("unknown experience level {label:?}"),
                },
                None => None,
            };
            let filters = JobFilters {
                location,
                experience_level,
                remote,
                company,
            };
            let app = Jobscope::open(config).await?;
            let hits = app
                .knowledge_service()
                .search(&query, &filters, limit)
                .await?;
            if hits.is_empty() {
                println!("no matches for {query:?}");
            }
            for hit in hits {
                let record = &hit.record;
                println!(
                    "{:.3}  {} @ {} ({}, {})  {}",
                    hit.score,
                    record.title,
                    record.company,
                    record.location,
                    record.remote_type.as_str(),
                    record.url.as_deref().unwrap_or("-"),
                );
            }
        }
        Commands::Insights => {
            let app = Jobscope::open(config).await?;
            let market = app.knowledge_service().market_insights().await?;
            println!("{}", serde_json::to_string_pretty(&market)?);
        }
        Commands::Company { name } => {
            let app = Jobscope::open(config).await?;
            let company = app.knowledge_service().company_insights(&name).await?;
            println!("{}", serde_json::to_string_pretty(&company)?);
        }
        Commands::Reindex => {
            let app = Jobscope::open(config).await?;
            let rebuilt = app.pipeline().rebuild_indexes().await?;
            println!(
                "reindexed: documents={} vectors_loaded={} vectors_embedded={} embedding_failures={}",
                rebuilt.documents,
                rebuilt.vectors_loaded,
                rebuilt.vectors_embedded,
                rebuilt.embedding_failures
            );
        }
        Commands::Export { out } => {
            let app = Jobscope::open(config).await?;
            let manifest = export_corpus(app.store(), &out).await?;
            println!("export complete: manifest={}", manifest.display());
        }
        Commands::Reports { runs } => {
            println!("{}", report_history_markdown(&config.reports_dir, runs)?);
        }
        Commands::Stats => {
            let app = Jobscope::open(config).await?;
            println!("{}", serde_json::to_string_pretty(&app.stats().await?)?);
        }
    }

    Ok(())
}

fn init_tracing(cli: &Cli) {
    let default = match cli.verbose {
        0 => "warn,jobscope=info",
        1 => "info,jobscope=debug",
        _ => "debug,jobscope=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    match cli.log_format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init(),
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .init(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_search_filters() {
        let cli = Cli::parse_from([
            "jobscope",
            "search",
            "data engineer",
            "--experience",
            "senior",
            "--remote",
            "true",
            "--limit",
            "3",
        ]);
        match cli.command {
            Some(Commands::Search {
                query,
                experience,
                remote,
                limit,
                ..
            }) => {
                assert_eq!(query, "data engineer");
                assert_eq!(experience.as_deref(), Some("senior"));
                assert_eq!(remote, Some(true));
                assert_eq!(limit, 3);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn scrape_sources_split_on_commas() {
        let cli = Cli::parse_from(["jobscope", "-vv", "scrape", "--sources", "wttj,linkedin"]);
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Some(Commands::Scrape { sources, max_jobs }) => {
                assert_eq!(
                    sources,
                    Some(vec!["wttj".to_string(), "linkedin".to_string()])
                );
                assert_eq!(max_jobs, None);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
