//! Post-hoc consistency analysis: machine decisions vs human annotations.
//!
//! Pure reporting over the completed result sheet — no decisions are made
//! here. Dropped rows and unannotated rows are excluded from every rate.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::rules::Outcome;
use crate::store::{ResultRow, DROPPED};

/// Primary code of the no-issue bucket.
const PRIMARY_NO_ISSUE: &str = "13";
/// Primary code of the "worth another look but harmless" bucket. A human
/// no-issue judgment and a machine harmless judgment (or vice versa) count
/// as agreement.
const PRIMARY_HARMLESS: &str = "9";

/// Agreement rates for one group of rows.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgreementStats {
    pub samples: usize,
    /// Binary (0/1) satisfaction agreement, both sides pooled.
    pub binary_rate: f64,
    /// Four-tier rating agreement with the lenient primary-code rules.
    pub rating_rate: f64,
    /// Win/loss/tie agreement on side A.
    pub outcome_rate: f64,
    /// Primary-issue-label agreement, both sides pooled.
    pub primary_jaccard: f64,
}

/// Recall/precision for one label value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabelPr {
    pub label: String,
    pub support: usize,
    pub recall: f64,
    pub precision: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsistencyReport {
    pub generated_at: String,
    pub total_rows: usize,
    pub analyzed_rows: usize,
    pub dropped_rows: usize,
    pub overall: AgreementStats,
    pub by_dimension: Vec<(String, AgreementStats)>,
    /// Binary-satisfaction classes, both sides pooled.
    pub binary_pr: Vec<LabelPr>,
    /// Win/tie/loss classes on side A.
    pub outcome_pr: Vec<LabelPr>,
}

/// Reduce a label token to its primary code: the leading digits when the
/// taxonomy code starts with them, otherwise the text before the first
/// underscore.
fn primary(token: &str) -> String {
    let digits: String = token.chars().take_while(|c| c.is_ascii_digit()).collect();
    if !digits.is_empty() {
        return digits;
    }
    token.split('_').next().unwrap_or(token).to_string()
}

fn primary_set(labels: &str) -> BTreeSet<String> {
    labels
        .split(['，', ','])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(primary)
        .collect()
}

fn is_harmless_pair(a: &BTreeSet<String>, b: &BTreeSet<String>) -> bool {
    a.len() == 1
        && b.len() == 1
        && a.union(b).cloned().collect::<BTreeSet<_>>()
            == BTreeSet::from([PRIMARY_NO_ISSUE.to_string(), PRIMARY_HARMLESS.to_string()])
}

/// Row-level primary-label agreement: 1.0 or 0.0.
///
/// Two empty sets agree; a bare no-issue vs bare harmless pair agrees; any
/// shared primary code agrees.
pub fn primary_label_agreement(human: &str, machine: &str) -> f64 {
    let h = primary_set(human);
    let m = primary_set(machine);

    if is_harmless_pair(&h, &m) {
        return 1.0;
    }
    if h.is_empty() && m.is_empty() {
        return 1.0;
    }
    if h.intersection(&m).next().is_some() {
        return 1.0;
    }
    0.0
}

/// Lenient tier/rating match: comma-split both into primary-code sets, then
/// apply the same agreement rules as for issue labels.
pub fn lenient_rating_match(human: &str, machine: &str) -> bool {
    primary_label_agreement(human, machine) == 1.0
}

fn normalized_outcome(raw: &str) -> String {
    Outcome::parse(raw)
        .map(|o| o.as_str().to_string())
        .unwrap_or_else(|| raw.trim().to_string())
}

fn outcome_match(human: &str, machine: &str) -> bool {
    !human.trim().is_empty() && normalized_outcome(human) == normalized_outcome(machine)
}

fn participates(row: &ResultRow) -> bool {
    if row.is_dropped() || row.human.is_empty() {
        return false;
    }
    // A human-side drop marker excludes the row just like a machine drop.
    let human_dropped = |v: &Option<String>| {
        v.as_deref()
            .is_some_and(|s| s == DROPPED || s == "剔除")
    };
    !(human_dropped(&row.human.a_satisfied) || human_dropped(&row.human.b_satisfied))
}

fn rate(hits: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        hits as f64 / total as f64
    }
}

fn stats_for(rows: &[&ResultRow]) -> AgreementStats {
    let total = rows.len();
    let mut binary_hits = 0usize;
    let mut binary_total = 0usize;
    let mut rating_hits = 0usize;
    let mut rating_total = 0usize;
    let mut outcome_hits = 0usize;
    let mut outcome_total = 0usize;
    let mut jaccard_sum = 0.0f64;
    let mut jaccard_total = 0usize;

    for row in rows {
        for (h, m) in [
            (&row.human.a_satisfied, &row.a_satisfied),
            (&row.human.b_satisfied, &row.b_satisfied),
        ] {
            if let Some(h) = h {
                binary_total += 1;
                if h.trim() == m.trim() {
                    binary_hits += 1;
                }
            }
        }
        for (h, m) in [
            (&row.human.a_rating, &row.a_satisfaction),
            (&row.human.b_rating, &row.b_satisfaction),
        ] {
            if let Some(h) = h {
                rating_total += 1;
                if lenient_rating_match(h, m) {
                    rating_hits += 1;
                }
            }
        }
        if let Some(h) = &row.human.a_outcome {
            outcome_total += 1;
            if outcome_match(h, &row.a_outcome) {
                outcome_hits += 1;
            }
        }
        for (h, m) in [
            (&row.human.a_main_issues, &row.a_main_issues),
            (&row.human.b_main_issues, &row.b_main_issues),
        ] {
            if let Some(h) = h {
                jaccard_total += 1;
                jaccard_sum += primary_label_agreement(h, m);
            }
        }
    }

    AgreementStats {
        samples: total,
        binary_rate: rate(binary_hits, binary_total),
        rating_rate: rate(rating_hits, rating_total),
        outcome_rate: rate(outcome_hits, outcome_total),
        primary_jaccard: if jaccard_total == 0 {
            0.0
        } else {
            jaccard_sum / jaccard_total as f64
        },
    }
}

fn precision_recall(pairs: &[(String, String)], labels: &[&str]) -> Vec<LabelPr> {
    labels
        .iter()
        .map(|label| {
            let tp = pairs
                .iter()
                .filter(|(t, p)| t == label && p == label)
                .count();
            let fn_ = pairs
                .iter()
                .filter(|(t, p)| t == label && p != label)
                .count();
            let fp = pairs
                .iter()
                .filter(|(t, p)| t != label && p == label)
                .count();
            LabelPr {
                label: label.to_string(),
                support: tp + fn_,
                recall: rate(tp, tp + fn_),
                precision: rate(tp, tp + fp),
            }
        })
        .collect()
}

/// Compute the full consistency report over a merged result sheet.
pub fn analyze(rows: &[ResultRow]) -> ConsistencyReport {
    let dropped_rows = rows.iter().filter(|r| r.is_dropped()).count();
    let analyzed: Vec<&ResultRow> = rows.iter().filter(|r| participates(r)).collect();

    let overall = stats_for(&analyzed);

    let mut groups: BTreeMap<String, Vec<&ResultRow>> = BTreeMap::new();
    for row in &analyzed {
        groups.entry(row.dimension.clone()).or_default().push(row);
    }
    let by_dimension = groups
        .into_iter()
        .map(|(dim, rows)| (dim, stats_for(&rows)))
        .collect();

    let mut binary_pairs: Vec<(String, String)> = Vec::new();
    for row in &analyzed {
        for (h, m) in [
            (&row.human.a_satisfied, &row.a_satisfied),
            (&row.human.b_satisfied, &row.b_satisfied),
        ] {
            if let Some(h) = h {
                binary_pairs.push((h.trim().to_string(), m.trim().to_string()));
            }
        }
    }

    let outcome_pairs: Vec<(String, String)> = analyzed
        .iter()
        .filter_map(|row| {
            row.human
                .a_outcome
                .as_ref()
                .map(|h| (normalized_outcome(h), normalized_outcome(&row.a_outcome)))
        })
        .collect();

    ConsistencyReport {
        generated_at: Utc::now().to_rfc3339(),
        total_rows: rows.len(),
        analyzed_rows: analyzed.len(),
        dropped_rows,
        overall,
        by_dimension,
        binary_pr: precision_recall(&binary_pairs, &["0", "1"]),
        outcome_pr: precision_recall(&outcome_pairs, &["win", "tie", "loss"]),
    }
}

/// Write per-row agree/disagree flags into the sheet, for spot-checking
/// individual rows. Rows outside the analysis scope keep `None`.
pub fn annotate_flags(rows: &mut [ResultRow]) {
    for row in rows.iter_mut() {
        if !participates(row) {
            continue;
        }
        if let Some(h) = &row.human.a_outcome {
            row.agree_outcome = Some(outcome_match(h, &row.a_outcome));
        }
        let rating_pairs = [
            (&row.human.a_rating, &row.a_satisfaction),
            (&row.human.b_rating, &row.b_satisfaction),
        ];
        let rating_checks: Vec<bool> = rating_pairs
            .iter()
            .filter_map(|(h, m)| h.as_ref().map(|h| lenient_rating_match(h, m)))
            .collect();
        if !rating_checks.is_empty() {
            row.agree_rating = Some(rating_checks.iter().all(|b| *b));
        }
        let binary_pairs = [
            (&row.human.a_satisfied, &row.a_satisfied),
            (&row.human.b_satisfied, &row.b_satisfied),
        ];
        let binary_checks: Vec<bool> = binary_pairs
            .iter()
            .filter_map(|(h, m)| h.as_ref().map(|h| h.trim() == m.trim()))
            .collect();
        if !binary_checks.is_empty() {
            row.agree_binary = Some(binary_checks.iter().all(|b| *b));
        }
    }
}

/// Render the report as markdown.
pub fn render_markdown(report: &ConsistencyReport) -> String {
    let mut out = String::new();
    out.push_str("# Human/machine consistency report\n\n");
    out.push_str(&format!("Generated: {}\n\n", report.generated_at));
    out.push_str(&format!(
        "Rows: {} total, {} analyzed, {} dropped\n\n",
        report.total_rows, report.analyzed_rows, report.dropped_rows
    ));

    out.push_str("## Overall agreement\n\n");
    out.push_str("| metric | rate |\n|---|---|\n");
    out.push_str(&format!(
        "| binary satisfaction | {:.2}% |\n",
        report.overall.binary_rate * 100.0
    ));
    out.push_str(&format!(
        "| four-tier rating | {:.2}% |\n",
        report.overall.rating_rate * 100.0
    ));
    out.push_str(&format!(
        "| win/loss/tie | {:.2}% |\n",
        report.overall.outcome_rate * 100.0
    ));
    out.push_str(&format!(
        "| primary issue labels | {:.2}% |\n\n",
        report.overall.primary_jaccard * 100.0
    ));

    out.push_str("## By dimension\n\n");
    out.push_str("| dimension | samples | binary | rating | outcome | labels |\n");
    out.push_str("|---|---|---|---|---|---|\n");
    for (dim, stats) in &report.by_dimension {
        out.push_str(&format!(
            "| {dim} | {} | {:.2}% | {:.2}% | {:.2}% | {:.2}% |\n",
            stats.samples,
            stats.binary_rate * 100.0,
            stats.rating_rate * 100.0,
            stats.outcome_rate * 100.0,
            stats.primary_jaccard * 100.0,
        ));
    }
    out.push('\n');

    for (title, table) in [
        ("## Binary satisfaction recall/precision", &report.binary_pr),
        ("## Outcome recall/precision", &report.outcome_pr),
    ] {
        out.push_str(title);
        out.push_str("\n\n| label | support | recall | precision |\n|---|---|---|---|\n");
        for pr in table {
            out.push_str(&format!(
                "| {} | {} | {:.2}% | {:.2}% |\n",
                pr.label,
                pr.support,
                pr.recall * 100.0,
                pr.precision * 100.0,
            ));
        }
        out.push('\n');
    }

    out
}
