//! Durable result storage: per-partition snapshots and checkpoints.
//!
//! Commit policy is deliberately crash-safe over IO-efficient: every row
//! commit rewrites the partition's whole snapshot (temp file + rename) and
//! then its checkpoint. A resumed partition reloads the snapshot and skips
//! every row id at or below the checkpoint.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::dataset::HumanAnnotation;

/// Sentinel written into every derived field of a dropped row.
pub const DROPPED: &str = "dropped";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowStatus {
    Completed,
    Dropped,
}

/// One evaluated row, derived fields plus raw intermediates for audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultRow {
    pub id: u64,
    pub dimension: String,
    pub status: RowStatus,

    // Derived outputs.
    pub a_satisfaction: String,
    pub b_satisfaction: String,
    /// Binary satisfaction: "1" for acceptable/high-quality, else "0".
    pub a_satisfied: String,
    pub b_satisfied: String,
    /// Merged (single-side ∪ comparative) issue sets, comma-joined.
    pub a_main_issues: String,
    pub b_main_issues: String,
    /// Populated only when the side's tier is egregious or high-quality.
    pub a_extreme_reason: String,
    pub b_extreme_reason: String,
    pub a_outcome: String,
    pub b_outcome: String,
    /// Which path produced the outcome: "rules", "judge", or "fallback".
    pub decided_by: String,
    pub rationale: String,

    // Raw intermediates.
    pub a_single_issues: String,
    pub b_single_issues: String,
    pub a_sbs_issues: String,
    pub b_sbs_issues: String,
    #[serde(default)]
    pub a_triggers: Vec<String>,
    #[serde(default)]
    pub b_triggers: Vec<String>,
    #[serde(default)]
    pub a_patterns: Vec<String>,
    #[serde(default)]
    pub b_patterns: Vec<String>,

    // Human annotations carried through for the consistency analyzer.
    #[serde(default, skip_serializing_if = "HumanAnnotation::is_empty")]
    pub human: HumanAnnotation,

    // Agreement flags, filled by the consistency analyzer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agree_outcome: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agree_rating: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agree_binary: Option<bool>,
}

impl ResultRow {
    /// A terminal dropped row: every derived field carries the sentinel and
    /// the rationale records why.
    pub fn dropped(id: u64, dimension: &str, human: HumanAnnotation, reason: &str) -> Self {
        let s = DROPPED.to_string();
        Self {
            id,
            dimension: dimension.to_string(),
            status: RowStatus::Dropped,
            a_satisfaction: s.clone(),
            b_satisfaction: s.clone(),
            a_satisfied: s.clone(),
            b_satisfied: s.clone(),
            a_main_issues: s.clone(),
            b_main_issues: s.clone(),
            a_extreme_reason: s.clone(),
            b_extreme_reason: s.clone(),
            a_outcome: s.clone(),
            b_outcome: s.clone(),
            decided_by: s,
            rationale: reason.to_string(),
            a_single_issues: String::new(),
            b_single_issues: String::new(),
            a_sbs_issues: String::new(),
            b_sbs_issues: String::new(),
            a_triggers: Vec::new(),
            b_triggers: Vec::new(),
            a_patterns: Vec::new(),
            b_patterns: Vec::new(),
            human,
            agree_outcome: None,
            agree_rating: None,
            agree_binary: None,
        }
    }

    pub fn is_dropped(&self) -> bool {
        self.status == RowStatus::Dropped
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot decode error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Owns one partition's rows, snapshot file, checkpoint file, and error
/// log. Exactly one task may hold a `PartitionStore` — the aggregator —
/// so commits are serialized without any lock around file IO.
pub struct PartitionStore {
    partition: usize,
    rows: BTreeMap<u64, ResultRow>,
    checkpoint: Option<u64>,
    snapshot_path: PathBuf,
    checkpoint_path: PathBuf,
    error_log_path: PathBuf,
}

impl PartitionStore {
    /// Open (or resume) a partition under `dir`. An existing snapshot and
    /// checkpoint are reloaded; a fresh partition starts empty.
    pub fn open(dir: impl AsRef<Path>, partition: usize) -> Result<Self, StoreError> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;

        let snapshot_path = dir.join(format!("partition_{partition:03}.json"));
        let checkpoint_path = dir.join(format!("partition_{partition:03}.checkpoint"));
        let error_log_path = dir.join(format!("partition_{partition:03}.errors.log"));

        let rows = if snapshot_path.exists() {
            let text = std::fs::read_to_string(&snapshot_path)?;
            let rows: Vec<ResultRow> = serde_json::from_str(&text)?;
            rows.into_iter().map(|r| (r.id, r)).collect()
        } else {
            BTreeMap::new()
        };

        let checkpoint = match std::fs::read_to_string(&checkpoint_path) {
            Ok(text) => text.trim().parse::<u64>().ok(),
            Err(_) => None,
        };

        if checkpoint.is_some() || !rows.is_empty() {
            info!(
                partition,
                rows = rows.len(),
                checkpoint = ?checkpoint,
                "resuming partition from snapshot"
            );
        }

        Ok(Self {
            partition,
            rows,
            checkpoint,
            snapshot_path,
            checkpoint_path,
            error_log_path,
        })
    }

    pub fn partition(&self) -> usize {
        self.partition
    }

    /// Last row id committed by a previous run, if any.
    pub fn checkpoint(&self) -> Option<u64> {
        self.checkpoint
    }

    pub fn rows(&self) -> impl Iterator<Item = &ResultRow> {
        self.rows.values()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Commit one row: update the in-memory sheet, persist the full
    /// snapshot, then advance the checkpoint. The three steps are one
    /// atomic unit from the callers' perspective because only the
    /// aggregator ever calls this.
    pub fn commit(&mut self, row: ResultRow) -> Result<(), StoreError> {
        let id = row.id;
        self.rows.insert(id, row);
        self.persist_snapshot()?;
        write_atomic(&self.checkpoint_path, id.to_string().as_bytes())?;
        self.checkpoint = Some(id);
        Ok(())
    }

    /// Append a line to the partition's error log, keyed by row id.
    pub fn log_error(&self, row_id: u64, message: &str) -> Result<(), StoreError> {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.error_log_path)?;
        writeln!(file, "row {row_id}: {message}")?;
        Ok(())
    }

    fn persist_snapshot(&self) -> Result<(), StoreError> {
        let rows: Vec<&ResultRow> = self.rows.values().collect();
        let json = serde_json::to_vec_pretty(&rows)?;
        write_atomic(&self.snapshot_path, &json)
    }
}

/// Write-then-rename so a crash mid-write never corrupts the previous
/// durable copy.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);
    {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Merge all partition snapshots under `dir` into one sheet ordered by row
/// id, and write it to `out`.
pub fn merge_partitions(
    dir: impl AsRef<Path>,
    partitions: usize,
    out: impl AsRef<Path>,
) -> Result<Vec<ResultRow>, StoreError> {
    let mut merged: BTreeMap<u64, ResultRow> = BTreeMap::new();
    for partition in 0..partitions {
        let store = PartitionStore::open(&dir, partition)?;
        for row in store.rows() {
            merged.insert(row.id, row.clone());
        }
    }
    let rows: Vec<ResultRow> = merged.into_values().collect();
    let json = serde_json::to_vec_pretty(&rows)?;
    write_atomic(out.as_ref(), &json)?;
    Ok(rows)
}

/// Load a merged result sheet.
pub fn load_results(path: impl AsRef<Path>) -> Result<Vec<ResultRow>, StoreError> {
    let text = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

/// Persist a merged result sheet (used after flag annotation).
pub fn save_results(path: impl AsRef<Path>, rows: &[ResultRow]) -> Result<(), StoreError> {
    let json = serde_json::to_vec_pretty(rows)?;
    write_atomic(path.as_ref(), &json)
}
