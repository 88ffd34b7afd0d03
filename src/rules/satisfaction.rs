//! Satisfaction classifier: a side's label set → four-tier verdict.

use serde::{Deserialize, Serialize};

use super::bucket::bucket_of;
use super::config::RulesConfig;
use super::split_labels;

/// Four-tier quality verdict for one side, plus an unclassified state for
/// rows the configured map does not cover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SatisfactionTier {
    Egregious,
    Unacceptable,
    Acceptable,
    HighQuality,
    Unclassified,
}

impl SatisfactionTier {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Egregious => "egregious",
            Self::Unacceptable => "unacceptable",
            Self::Acceptable => "acceptable",
            Self::HighQuality => "high_quality",
            Self::Unclassified => "unclassified",
        }
    }

    /// Binary satisfaction: acceptable and high-quality count as satisfied.
    pub fn is_satisfied(self) -> bool {
        matches!(self, Self::Acceptable | Self::HighQuality)
    }

    /// The tier deserves a specific reason in the output row.
    pub fn is_extreme(self) -> bool {
        matches!(self, Self::Egregious | Self::HighQuality)
    }
}

impl std::fmt::Display for SatisfactionTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification result with the reason the tier was assigned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierVerdict {
    pub tier: SatisfactionTier,
    pub reason: String,
}

impl TierVerdict {
    fn new(tier: SatisfactionTier, reason: impl Into<String>) -> Self {
        Self {
            tier,
            reason: reason.into(),
        }
    }
}

/// Map a raw main-issues string to a satisfaction tier.
///
/// Precedence: dimension-quality labels, then the egregious keyword, then
/// the literal high-quality code, then the configured tier patterns in
/// severity order. Pure function of the label set — identical input always
/// yields the identical verdict.
pub fn classify(main_issues: &str, cfg: &RulesConfig) -> TierVerdict {
    let issues = split_labels(main_issues);
    if issues.is_empty() {
        return TierVerdict::new(SatisfactionTier::Unclassified, "no issues annotated");
    }

    if issues.iter().any(|l| {
        cfg.dimension_quality_prefixes
            .iter()
            .any(|p| l.starts_with(p.as_str()))
    }) {
        return TierVerdict::new(
            SatisfactionTier::HighQuality,
            "matched dimension-quality label",
        );
    }

    if issues
        .iter()
        .any(|l| l.starts_with(&cfg.egregious_bucket) || l.contains(&cfg.egregious_keyword))
    {
        return TierVerdict::new(SatisfactionTier::Egregious, "matched egregious keyword");
    }
    if issues.iter().any(|l| l.starts_with(&cfg.high_quality_bucket)) {
        return TierVerdict::new(
            SatisfactionTier::HighQuality,
            format!("matched {} label", cfg.high_quality_bucket),
        );
    }

    let buckets: Vec<String> = issues.iter().map(|l| bucket_of(l, cfg)).collect();

    let tiers = [
        (SatisfactionTier::Egregious, &cfg.satisfaction_map.egregious),
        (
            SatisfactionTier::Unacceptable,
            &cfg.satisfaction_map.unacceptable,
        ),
        (
            SatisfactionTier::Acceptable,
            &cfg.satisfaction_map.acceptable,
        ),
        (
            SatisfactionTier::HighQuality,
            &cfg.satisfaction_map.high_quality,
        ),
    ];
    for (tier, patterns) in tiers {
        for pattern in patterns {
            let raw_hit = issues
                .iter()
                .any(|l| l.starts_with(pattern.as_str()) || l.contains(pattern.as_str()));
            let bucket_hit = buckets
                .iter()
                .any(|b| b == pattern || b.starts_with(pattern.as_str()));
            if raw_hit || bucket_hit {
                return TierVerdict::new(
                    tier,
                    format!("matched {} pattern: {pattern}", tier.as_str()),
                );
            }
        }
    }

    TierVerdict::new(
        SatisfactionTier::Unclassified,
        "no configured pattern matched",
    )
}
