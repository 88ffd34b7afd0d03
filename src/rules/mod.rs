//! Deterministic label classification and winloss decision rules.
//!
//! Everything in this module is a pure function of the label text and the
//! loaded [`RulesConfig`] — no judge calls, no IO, total over arbitrary
//! input strings.

pub mod bucket;
pub mod config;
pub mod satisfaction;
pub mod severity;
pub mod winloss;

pub use bucket::bucket_of;
pub use config::{DimensionSpec, KeywordRule, RulesConfig, RulesConfigError, SatisfactionMap};
pub use satisfaction::{classify, SatisfactionTier, TierVerdict};
pub use severity::{top_severity, SeverityResolution};
pub use winloss::{decide, Decision, Outcome};

use std::collections::BTreeSet;

/// Split a raw annotation string into trimmed, non-empty label tokens.
///
/// Accepts ASCII commas, fullwidth commas, and newlines as separators —
/// judges and human annotators use all three interchangeably.
pub fn split_labels(raw: &str) -> Vec<String> {
    raw.split(['，', ',', '\n'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Merge a side's single-side label set with its comparative label set.
///
/// The union drops the no-issue label whenever any other label is present,
/// so a merged set never claims "no issue" alongside a concrete issue. An
/// empty union collapses back to the no-issue label. Output is sorted and
/// joined with a fullwidth comma, matching the annotation format.
pub fn merge_issue_sets(single: &str, comparative: &str, cfg: &RulesConfig) -> String {
    let mut merged: BTreeSet<String> = split_labels(single).into_iter().collect();
    merged.extend(split_labels(comparative));

    if merged.len() > 1 {
        merged.remove(&cfg.no_issue_bucket);
    }
    if merged.is_empty() {
        return cfg.no_issue_bucket.clone();
    }
    merged.into_iter().collect::<Vec<_>>().join("，")
}
