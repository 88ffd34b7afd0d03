//! Evaluation pipeline: per-row S0→S4 state machine over statically
//! partitioned workers, with a single aggregator task owning the durable
//! snapshots and checkpoints.
//!
//! Stage order within a row is strict; rows within a partition run in
//! order; partitions are independent. No row failure may abort another
//! row — a failed row becomes a dropped output row with a reason, never a
//! missing one.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::dataset::{parse_history, render_history, DatasetRow};
use crate::gateway::ChatGateway;
use crate::judge::{ComparativeAnalysis, Judge, RetryPolicy};
use crate::rules::{classify, decide, merge_issue_sets, Decision, Outcome, RulesConfig};
use crate::store::{PartitionStore, ResultRow, RowStatus, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("worker task panicked: {0}")]
    Join(String),
}

/// Knobs for one evaluation run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Judge model id, e.g. "openai/o3".
    pub model: String,
    /// Worker count == partition count.
    pub workers: usize,
    /// Directory for partition snapshots, checkpoints, and error logs.
    pub out_dir: PathBuf,
    /// Parse-retry policy for judge calls.
    pub retry: RetryPolicy,
    /// Fixed pacing delay before each judge call.
    pub pace: Duration,
}

impl RunOptions {
    pub fn new(model: impl Into<String>, out_dir: impl Into<PathBuf>) -> Self {
        Self {
            model: model.into(),
            workers: 2,
            out_dir: out_dir.into(),
            retry: RetryPolicy::default(),
            pace: Duration::from_millis(500),
        }
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn pace(mut self, pace: Duration) -> Self {
        self.pace = pace;
        self
    }
}

/// What a run did, across resumed and fresh rows.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub completed: usize,
    pub dropped: usize,
    /// Rows skipped because a checkpoint already covered them.
    pub skipped: usize,
    pub partitions: usize,
    /// Partitions whose snapshot could no longer be persisted. Their
    /// checkpoints are not trustworthy and the run must be surfaced to the
    /// operator.
    pub failed_partitions: Vec<usize>,
}

struct RowMsg {
    partition: usize,
    row: ResultRow,
    error_notes: Vec<String>,
}

/// Evaluate a dataset: partition, fan out workers, aggregate commits.
pub async fn run_dataset(
    gateway: Arc<dyn ChatGateway>,
    rules: Arc<RulesConfig>,
    rows: Vec<DatasetRow>,
    opts: RunOptions,
) -> Result<RunSummary, PipelineError> {
    let workers = opts.workers.max(1).min(rows.len().max(1));
    let judge = Arc::new(Judge::new(
        gateway,
        opts.model.clone(),
        opts.retry,
        opts.pace,
    ));

    // Open every partition store up front: a partition that cannot even
    // open its snapshot is fatal before any judge call is spent.
    let mut stores = Vec::with_capacity(workers);
    for partition in 0..workers {
        stores.push(PartitionStore::open(&opts.out_dir, partition)?);
    }
    let checkpoints: Vec<Option<u64>> = stores.iter().map(|s| s.checkpoint()).collect();

    let total: usize = rows.len();
    info!(total, workers, "starting evaluation run");

    let (tx, mut rx) = mpsc::channel::<RowMsg>(64);

    // The aggregator exclusively owns snapshots and checkpoints; workers
    // never touch files, so there is no lock held across IO.
    let aggregator = tokio::spawn(async move {
        let mut failed_partitions: Vec<usize> = Vec::new();
        while let Some(msg) = rx.recv().await {
            let store = &mut stores[msg.partition];
            for note in &msg.error_notes {
                if let Err(err) = store.log_error(msg.row.id, note) {
                    warn!(partition = msg.partition, error = %err, "error log write failed");
                }
            }
            if let Err(err) = store.commit(msg.row) {
                error!(
                    partition = msg.partition,
                    error = %err,
                    "snapshot persist failed; partition checkpoint is no longer reliable"
                );
                if !failed_partitions.contains(&msg.partition) {
                    failed_partitions.push(msg.partition);
                }
            }
        }
        (stores, failed_partitions)
    });

    let mut workers_set = JoinSet::new();
    let mut skipped_total = 0usize;
    for (partition, chunk) in partition_rows(rows, workers).into_iter().enumerate() {
        let checkpoint = checkpoints[partition];
        let skipped = chunk
            .iter()
            .filter(|r| checkpoint.is_some_and(|ck| r.id <= ck))
            .count();
        skipped_total += skipped;

        let judge = judge.clone();
        let rules = rules.clone();
        let tx = tx.clone();
        workers_set.spawn(async move {
            for row in chunk {
                if checkpoint.is_some_and(|ck| row.id <= ck) {
                    continue;
                }
                let (result, error_notes) = process_row(&judge, &rules, &row).await;
                if tx
                    .send(RowMsg {
                        partition,
                        row: result,
                        error_notes,
                    })
                    .await
                    .is_err()
                {
                    // Aggregator is gone; nothing further to do safely.
                    return;
                }
            }
        });
    }
    drop(tx);

    while let Some(joined) = workers_set.join_next().await {
        joined.map_err(|e| PipelineError::Join(e.to_string()))?;
    }

    let (stores, failed_partitions) = aggregator
        .await
        .map_err(|e| PipelineError::Join(e.to_string()))?;

    let mut summary = RunSummary {
        partitions: workers,
        skipped: skipped_total,
        failed_partitions,
        ..Default::default()
    };
    for store in &stores {
        for row in store.rows() {
            match row.status {
                RowStatus::Completed => summary.completed += 1,
                RowStatus::Dropped => summary.dropped += 1,
            }
        }
    }

    info!(
        completed = summary.completed,
        dropped = summary.dropped,
        skipped = summary.skipped,
        failed_partitions = summary.failed_partitions.len(),
        "evaluation run finished"
    );
    Ok(summary)
}

/// Contiguous near-equal chunks; the first `len % n` chunks carry one extra
/// row.
fn partition_rows(rows: Vec<DatasetRow>, n: usize) -> Vec<Vec<DatasetRow>> {
    let len = rows.len();
    let base = len / n;
    let extra = len % n;
    let mut chunks = Vec::with_capacity(n);
    let mut iter = rows.into_iter();
    for i in 0..n {
        let size = base + usize::from(i < extra);
        chunks.push(iter.by_ref().take(size).collect());
    }
    chunks
}

/// Run one row through S0→S4. Always yields an output row: any failure not
/// explicitly degraded by a stage becomes a Dropped row carrying the error
/// text, alongside notes for the partition error log.
async fn process_row(
    judge: &Judge,
    rules: &RulesConfig,
    row: &DatasetRow,
) -> (ResultRow, Vec<String>) {
    match evaluate_row(judge, rules, row).await {
        Ok((result, notes)) => (result, notes),
        Err(reason) => {
            warn!(row = row.id, %reason, "row dropped");
            let result = ResultRow::dropped(row.id, &row.dimension, row.human.clone(), &reason);
            (result, vec![reason])
        }
    }
}

async fn evaluate_row(
    judge: &Judge,
    rules: &RulesConfig,
    row: &DatasetRow,
) -> Result<(ResultRow, Vec<String>), String> {
    let job_id = Uuid::new_v4();
    let mut error_notes: Vec<String> = Vec::new();

    // ---- S0: intake -------------------------------------------------------
    let a_turns = parse_history(&row.side_a)
        .map_err(|e| format!("side A history parse failure: {e}"))?;
    let b_turns = parse_history(&row.side_b)
        .map_err(|e| format!("side B history parse failure: {e}"))?;
    if a_turns.is_empty() {
        return Err("side A history is empty".into());
    }
    if b_turns.is_empty() {
        return Err("side B history is empty".into());
    }

    let (a_history, a_last) = render_history(&a_turns, "大模型A");
    let (b_history, b_last) = render_history(&b_turns, "大模型B");
    let run_time = row.prompt_time.as_deref().unwrap_or("").trim();

    // ---- S1: independent single-side classification -----------------------
    let (single_a, single_b) = tokio::join!(
        judge.single_side(run_time, &a_history, &a_last, &row.dimension, rules, job_id),
        judge.single_side(run_time, &b_history, &b_last, &row.dimension, rules, job_id),
    );
    let single_a = single_a.map_err(|e| format!("classification parse failure (side A): {e}"))?;
    let single_b = single_b.map_err(|e| format!("classification parse failure (side B): {e}"))?;

    let a_single_issues = single_a.main_issues.trim().to_string();
    let b_single_issues = single_b.main_issues.trim().to_string();

    // ---- S2: deterministic satisfaction mapping ---------------------------
    let a_verdict = classify(&a_single_issues, rules);
    let b_verdict = classify(&b_single_issues, rules);

    // ---- S3: comparative analysis (best effort) ---------------------------
    let analysis = match judge
        .comparative(
            &row.dimension,
            &a_history,
            &a_last,
            &b_history,
            &b_last,
            rules,
            job_id,
        )
        .await
    {
        Ok(analysis) => analysis,
        Err(err) => {
            // Degrade rather than drop: the decision stage still runs on
            // the single-side evidence alone.
            error_notes.push(format!("comparative analysis failed: {err}"));
            ComparativeAnalysis::default()
        }
    };

    // ---- S4: decision -----------------------------------------------------
    let a_merged = merge_issue_sets(&a_single_issues, &analysis.a_issues, rules);
    let b_merged = merge_issue_sets(&b_single_issues, &analysis.b_issues, rules);

    let (a_outcome, decided_by, verdict_note) = match decide(&a_merged, &b_merged, rules) {
        Decision::Decided { outcome, rationale } => (outcome, "rules", rationale),
        Decision::Undecided { rationale } => {
            match judge
                .final_verdict(&analysis, &a_single_issues, &b_single_issues, rules, job_id)
                .await
            {
                Ok(judgment) => match Outcome::parse(&judgment.verdict) {
                    Some(outcome) => (outcome, "judge", judgment.rationale),
                    None => {
                        let note = format!(
                            "final judgment returned unknown verdict {:?}",
                            judgment.verdict
                        );
                        error_notes.push(note.clone());
                        judge_failure_fallback(rules, note)?
                    }
                },
                Err(err) => {
                    let note = format!("final judgment failed: {err} ({rationale})");
                    error_notes.push(note.clone());
                    judge_failure_fallback(rules, note)?
                }
            }
        }
    };

    let rationale = compose_rationale(&single_a.rationale, &single_b.rationale, &verdict_note);

    let result = ResultRow {
        id: row.id,
        dimension: row.dimension.clone(),
        status: RowStatus::Completed,
        a_satisfaction: a_verdict.tier.as_str().to_string(),
        b_satisfaction: b_verdict.tier.as_str().to_string(),
        a_satisfied: binary_satisfied(a_verdict.tier.is_satisfied()),
        b_satisfied: binary_satisfied(b_verdict.tier.is_satisfied()),
        a_main_issues: a_merged,
        b_main_issues: b_merged,
        a_extreme_reason: extreme_reason(&single_a.extreme_reason, a_verdict.tier.is_extreme()),
        b_extreme_reason: extreme_reason(&single_b.extreme_reason, b_verdict.tier.is_extreme()),
        a_outcome: a_outcome.as_str().to_string(),
        b_outcome: a_outcome.mirror().as_str().to_string(),
        decided_by: decided_by.to_string(),
        rationale,
        a_single_issues,
        b_single_issues,
        a_sbs_issues: analysis.a_issues.trim().to_string(),
        b_sbs_issues: analysis.b_issues.trim().to_string(),
        a_triggers: analysis.a_triggers,
        b_triggers: analysis.b_triggers,
        a_patterns: analysis.a_patterns,
        b_patterns: analysis.b_patterns,
        human: row.human.clone(),
        agree_outcome: None,
        agree_rating: None,
        agree_binary: None,
    };
    Ok((result, error_notes))
}

/// A row that reached S4 must still end with a decision: default to tie
/// when configured to, otherwise drop the row.
fn judge_failure_fallback(
    rules: &RulesConfig,
    note: String,
) -> Result<(Outcome, &'static str, String), String> {
    if rules.tie_on_judge_failure {
        Ok((
            Outcome::Tie,
            "fallback",
            format!("defaulted to tie: {note}"),
        ))
    } else {
        Err(note)
    }
}

fn binary_satisfied(satisfied: bool) -> String {
    if satisfied { "1" } else { "0" }.to_string()
}

fn extreme_reason(reason: &str, is_extreme: bool) -> String {
    if is_extreme {
        reason.trim().to_string()
    } else {
        String::new()
    }
}

fn compose_rationale(a_reason: &str, b_reason: &str, verdict_note: &str) -> String {
    let parts = [
        ("A", a_reason.trim()),
        ("B", b_reason.trim()),
        ("verdict", verdict_note.trim()),
    ];
    parts
        .iter()
        .filter(|(_, text)| !text.is_empty())
        .map(|(tag, text)| format!("{tag}: {text}"))
        .collect::<Vec<_>>()
        .join(" | ")
}
