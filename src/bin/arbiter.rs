#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use sbs_arbiter::consistency;
use sbs_arbiter::dataset;
use sbs_arbiter::gateway::{NoopUsageSink, ProviderGateway, StderrUsageSink};
use sbs_arbiter::rules::{bucket_of, classify, decide, top_severity, RulesConfig};
use sbs_arbiter::store;
use sbs_arbiter::{run_dataset, ChatGateway, RetryPolicy, RunOptions};

#[derive(Parser)]
#[command(name = "arbiter", version, about = "SBS transcript evaluation harness")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate a dataset end to end: run, merge, analyze
    Run {
        /// Input dataset (JSONL, one conversation pair per line)
        #[arg(long)]
        dataset: PathBuf,
        /// Rules config (YAML); omit for the built-in rules
        #[arg(long)]
        config: Option<PathBuf>,
        /// Output directory for snapshots, checkpoints, and reports
        #[arg(long)]
        out_dir: PathBuf,
        /// Judge model id
        #[arg(long, default_value = "openai/o3")]
        model: String,
        /// Worker (= partition) count
        #[arg(long, default_value_t = 5)]
        workers: usize,
        /// Pacing delay before each judge call, in milliseconds
        #[arg(long, default_value_t = 500)]
        pace_ms: u64,
        /// Parse-retry attempts per judge call
        #[arg(long, default_value_t = 3)]
        retries: u32,
        /// Log per-call usage records to stderr
        #[arg(long)]
        log_usage: bool,
        /// Skip the merge + consistency analysis after the run
        #[arg(long)]
        no_analyze: bool,
    },
    /// Merge partition snapshots into one result sheet
    Merge {
        #[arg(long)]
        out_dir: PathBuf,
        #[arg(long, default_value_t = 5)]
        partitions: usize,
        #[arg(long)]
        out: PathBuf,
    },
    /// Consistency analysis over a merged result sheet
    Analyze {
        #[arg(long)]
        results: PathBuf,
        /// Markdown report destination
        #[arg(long)]
        out: PathBuf,
        /// Optional JSON report destination
        #[arg(long)]
        json_out: Option<PathBuf>,
    },
    /// Classify a label string offline (debugging aid)
    Classify {
        /// Comma-separated issue labels
        labels: String,
        /// Optional second label set; when present, also run the winloss rules
        #[arg(long)]
        versus: Option<String>,
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn load_rules(path: Option<&Path>) -> Result<RulesConfig, Box<dyn std::error::Error>> {
    match path {
        Some(path) => Ok(RulesConfig::load(path)?),
        None => Ok(RulesConfig::default()),
    }
}

fn write_reports(
    rows: &mut Vec<store::ResultRow>,
    results_path: &Path,
    report_md: &Path,
    report_json: Option<&Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    consistency::annotate_flags(rows);
    store::save_results(results_path, rows)?;

    let report = consistency::analyze(rows);
    std::fs::write(report_md, consistency::render_markdown(&report))?;
    if let Some(json_path) = report_json {
        std::fs::write(json_path, serde_json::to_string_pretty(&report)?)?;
    }
    println!(
        "analyzed {} rows ({} dropped): binary {:.1}%, rating {:.1}%, outcome {:.1}%",
        report.analyzed_rows,
        report.dropped_rows,
        report.overall.binary_rate * 100.0,
        report.overall.rating_rate * 100.0,
        report.overall.outcome_rate * 100.0,
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            dataset: dataset_path,
            config,
            out_dir,
            model,
            workers,
            pace_ms,
            retries,
            log_usage,
            no_analyze,
        } => {
            let rules = Arc::new(load_rules(config.as_deref())?);
            let rows = dataset::load_jsonl(&dataset_path)?;
            if rows.is_empty() {
                return Err("dataset contains no rows".into());
            }

            let gateway: Arc<dyn ChatGateway> = if log_usage {
                Arc::new(ProviderGateway::from_env(Arc::new(StderrUsageSink))?)
            } else {
                Arc::new(ProviderGateway::from_env(Arc::new(NoopUsageSink))?)
            };

            let opts = RunOptions::new(model, &out_dir)
                .workers(workers)
                .retry(RetryPolicy {
                    max_attempts: retries.max(1),
                    backoff: Duration::from_secs(1),
                })
                .pace(Duration::from_millis(pace_ms));
            let partitions = opts.workers.min(rows.len());

            let summary = run_dataset(gateway, rules, rows, opts).await?;
            println!(
                "run finished: {} completed, {} dropped, {} skipped via checkpoints",
                summary.completed, summary.dropped, summary.skipped
            );
            if !summary.failed_partitions.is_empty() {
                return Err(format!(
                    "partitions {:?} could not persist their snapshots; rerun after fixing the output directory",
                    summary.failed_partitions
                )
                .into());
            }

            if !no_analyze {
                let results_path = out_dir.join("results.json");
                let mut merged = store::merge_partitions(&out_dir, partitions, &results_path)?;
                println!("merged {} rows into {}", merged.len(), results_path.display());
                write_reports(
                    &mut merged,
                    &results_path,
                    &out_dir.join("consistency.md"),
                    Some(&out_dir.join("consistency.json")),
                )?;
            }
        }

        Commands::Merge {
            out_dir,
            partitions,
            out,
        } => {
            let rows = store::merge_partitions(&out_dir, partitions, &out)?;
            println!("merged {} rows into {}", rows.len(), out.display());
        }

        Commands::Analyze {
            results,
            out,
            json_out,
        } => {
            let mut rows = store::load_results(&results)?;
            write_reports(&mut rows, &results, &out, json_out.as_deref())?;
        }

        Commands::Classify {
            labels,
            versus,
            config,
        } => {
            let rules = load_rules(config.as_deref())?;
            let verdict = classify(&labels, &rules);
            let severity = top_severity(&labels, &rules);
            println!("tier: {} ({})", verdict.tier, verdict.reason);
            println!(
                "top bucket: {} x{} ({} labels total)",
                severity.top_bucket, severity.top_count, severity.total_labels
            );
            for label in labels.split(['，', ',']).filter(|s| !s.trim().is_empty()) {
                println!("  {} -> {}", label.trim(), bucket_of(label.trim(), &rules));
            }
            if let Some(other) = versus {
                println!("decision: {:?}", decide(&labels, &other, &rules));
            }
        }
    }

    Ok(())
}
