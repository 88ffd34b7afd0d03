//! Input dataset: one row per conversation pair, JSONL on disk.

use std::io::BufRead;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// One user/model exchange inside a conversation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    #[serde(rename = "human")]
    pub user: String,
    #[serde(rename = "AI")]
    pub model: String,
}

/// Human annotations carried alongside a row, used only by the consistency
/// analyzer. Absent for unannotated datasets.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HumanAnnotation {
    #[serde(default)]
    pub a_rating: Option<String>,
    #[serde(default)]
    pub b_rating: Option<String>,
    #[serde(default)]
    pub a_satisfied: Option<String>,
    #[serde(default)]
    pub b_satisfied: Option<String>,
    #[serde(default)]
    pub a_main_issues: Option<String>,
    #[serde(default)]
    pub b_main_issues: Option<String>,
    /// Outcome for side A ("win"/"tie"/"loss", 胜/平/负 also accepted).
    #[serde(default)]
    pub a_outcome: Option<String>,
}

impl HumanAnnotation {
    pub fn is_empty(&self) -> bool {
        self.a_rating.is_none()
            && self.b_rating.is_none()
            && self.a_satisfied.is_none()
            && self.b_satisfied.is_none()
            && self.a_main_issues.is_none()
            && self.b_main_issues.is_none()
            && self.a_outcome.is_none()
    }
}

/// One input row. Side histories stay JSON-encoded as read from the sheet;
/// decoding them is the pipeline's intake stage, so a malformed history is
/// a per-row drop rather than a dataset load failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetRow {
    pub id: u64,
    #[serde(default = "default_dimension")]
    pub dimension: String,
    /// Side-A conversation history, JSON-encoded `[{"human":..,"AI":..},..]`.
    pub side_a: String,
    /// Side-B conversation history, same shape.
    pub side_b: String,
    #[serde(default)]
    pub prompt_time: Option<String>,
    #[serde(default, skip_serializing_if = "HumanAnnotation::is_empty")]
    pub human: HumanAnnotation,
}

fn default_dimension() -> String {
    "其他".to_string()
}

#[derive(Debug, thiserror::Error)]
pub enum DatasetError {
    #[error("io error reading dataset: {0}")]
    Io(#[from] std::io::Error),
    #[error("line {line}: {source}")]
    Parse {
        line: usize,
        source: serde_json::Error,
    },
}

/// Load a JSONL dataset. Blank lines are skipped; any unparseable line is a
/// load error — row-level problems live inside the history fields, which
/// are decoded later.
pub fn load_jsonl(path: impl AsRef<Path>) -> Result<Vec<DatasetRow>, DatasetError> {
    let file = std::fs::File::open(path)?;
    let reader = std::io::BufReader::new(file);
    let mut rows = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let row: DatasetRow = serde_json::from_str(&line).map_err(|source| DatasetError::Parse {
            line: idx + 1,
            source,
        })?;
        rows.push(row);
    }
    Ok(rows)
}

/// Decode a JSON-encoded conversation history.
pub fn parse_history(raw: &str) -> Result<Vec<Turn>, serde_json::Error> {
    serde_json::from_str(raw)
}

/// Render a history for prompting: everything before the last turn as
/// context, the last turn as the round under evaluation.
pub fn render_history(turns: &[Turn], side_label: &str) -> (String, String) {
    let context = turns[..turns.len().saturating_sub(1)]
        .iter()
        .map(|t| format!("问题：{}\n{side_label}的回答内容：{}", t.user, t.model))
        .collect::<Vec<_>>()
        .join("\n");

    let last_round = turns
        .last()
        .map(|t| format!("问题：{}\n{side_label}的回答内容：{}", t.user, t.model))
        .unwrap_or_default();

    (context, last_round)
}
