//! Severity resolver: label set → most severe bucket present.

use serde::{Deserialize, Serialize};

use super::bucket::bucket_of;
use super::config::RulesConfig;
use super::split_labels;

/// Resolution of one side's label set against the severity order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeverityResolution {
    /// First bucket in severity order with a nonzero count, or the
    /// no-issue bucket when nothing ranked matched.
    pub top_bucket: String,
    /// Occurrences in the top bucket (0 for the no-issue fallback).
    pub top_count: usize,
    /// Counts per configured bucket, in severity order.
    pub histogram: Vec<(String, usize)>,
    /// Every split label, including ones whose bucket is unranked.
    pub total_labels: usize,
}

impl SeverityResolution {
    /// Sum of the ranked histogram entries.
    pub fn ranked_total(&self) -> usize {
        self.histogram.iter().map(|(_, n)| n).sum()
    }
}

/// Bucket every label and scan the severity order front-to-back for the
/// first bucket present.
///
/// Total over malformed input: labels whose bucket is not in the order
/// simply fail to increment any histogram entry, but still count toward
/// `total_labels` for downstream tie-breaks.
pub fn top_severity(labels: &str, cfg: &RulesConfig) -> SeverityResolution {
    let issues = split_labels(labels);
    let mut histogram: Vec<(String, usize)> = cfg
        .severity_order
        .iter()
        .map(|b| (b.clone(), 0usize))
        .collect();

    for label in &issues {
        let bucket = bucket_of(label, cfg);
        if let Some(entry) = histogram.iter_mut().find(|(b, _)| *b == bucket) {
            entry.1 += 1;
        }
    }

    let top = histogram
        .iter()
        .find(|(_, count)| *count > 0)
        .map(|(bucket, count)| (bucket.clone(), *count));
    let (top_bucket, top_count) = top.unwrap_or((cfg.no_issue_bucket.clone(), 0));

    SeverityResolution {
        top_bucket,
        top_count,
        histogram,
        total_labels: issues.len(),
    }
}
