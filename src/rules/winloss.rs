//! Deterministic winloss rule engine.

use serde::{Deserialize, Serialize};

use super::config::RulesConfig;
use super::severity::top_severity;

/// Outcome for side A; side B always gets the mirror image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Win,
    Tie,
    Loss,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Win => "win",
            Self::Tie => "tie",
            Self::Loss => "loss",
        }
    }

    pub fn mirror(self) -> Self {
        match self {
            Self::Win => Self::Loss,
            Self::Tie => Self::Tie,
            Self::Loss => Self::Win,
        }
    }

    /// Lenient parse of a judge-emitted verdict. Accepts our own vocabulary
    /// and the annotation-sheet forms 胜/平/负.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "win" | "胜" => Some(Self::Win),
            "tie" | "平" => Some(Self::Tie),
            "loss" | "负" => Some(Self::Loss),
            _ => None,
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of the deterministic comparison.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Decision {
    /// The rules separated the two sides.
    Decided { outcome: Outcome, rationale: String },
    /// No deterministic distinction; the caller must obtain an external
    /// judgment rather than guess.
    Undecided { rationale: String },
}

impl Decision {
    pub fn is_undecided(&self) -> bool {
        matches!(self, Self::Undecided { .. })
    }

    pub fn rationale(&self) -> &str {
        match self {
            Self::Decided { rationale, .. } | Self::Undecided { rationale } => rationale,
        }
    }
}

/// Compare two sides' label sets, strictly in order, each step
/// short-circuiting:
///
/// 1. more severe top bucket loses
/// 2. same top bucket: more occurrences in it loses
/// 3. still equal: more labels in total loses
/// 4. otherwise undecided
///
/// Buckets absent from `severity_order` rank after the last configured
/// bucket, so an unranked label can never outweigh a ranked one. Rationales
/// cite the rule that fired and the buckets/counts compared.
pub fn decide(a_labels: &str, b_labels: &str, cfg: &RulesConfig) -> Decision {
    let a = top_severity(a_labels, cfg);
    let b = top_severity(b_labels, cfg);

    let a_rank = cfg.rank(&a.top_bucket);
    let b_rank = cfg.rank(&b.top_bucket);

    if a_rank < b_rank {
        return Decision::Decided {
            outcome: Outcome::Loss,
            rationale: format!(
                "A's top issue [{}] outranks B's [{}] in severity",
                a.top_bucket, b.top_bucket
            ),
        };
    }
    if a_rank > b_rank {
        return Decision::Decided {
            outcome: Outcome::Win,
            rationale: format!(
                "B's top issue [{}] outranks A's [{}] in severity",
                b.top_bucket, a.top_bucket
            ),
        };
    }

    if a.top_count > b.top_count {
        return Decision::Decided {
            outcome: Outcome::Loss,
            rationale: format!(
                "same top issue [{}]: A has {} occurrences vs B's {}",
                a.top_bucket, a.top_count, b.top_count
            ),
        };
    }
    if a.top_count < b.top_count {
        return Decision::Decided {
            outcome: Outcome::Win,
            rationale: format!(
                "same top issue [{}]: B has {} occurrences vs A's {}",
                b.top_bucket, b.top_count, a.top_count
            ),
        };
    }

    if a.total_labels > b.total_labels {
        return Decision::Decided {
            outcome: Outcome::Loss,
            rationale: format!(
                "equal top issue [{}]: A carries {} labels in total vs B's {}",
                a.top_bucket, a.total_labels, b.total_labels
            ),
        };
    }
    if a.total_labels < b.total_labels {
        return Decision::Decided {
            outcome: Outcome::Win,
            rationale: format!(
                "equal top issue [{}]: B carries {} labels in total vs A's {}",
                b.top_bucket, b.total_labels, a.total_labels
            ),
        };
    }

    Decision::Undecided {
        rationale: format!(
            "rules cannot separate the sides (top issue [{}], {} in bucket, {} total each); \
             external judgment required",
            a.top_bucket, a.top_count, a.total_labels
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_rank_decides_first() {
        let cfg = RulesConfig::default();
        match decide("12弱智", "4冗长", &cfg) {
            Decision::Decided { outcome, rationale } => {
                assert_eq!(outcome, Outcome::Loss);
                assert!(rationale.contains("12弱智"));
                assert!(rationale.contains("4冗长"));
            }
            other => panic!("expected decided loss, got {other:?}"),
        }
    }

    #[test]
    fn count_in_top_bucket_breaks_severity_ties() {
        let cfg = RulesConfig::default();
        match decide("4冗长，4冗长拓展过多", "4冗长", &cfg) {
            Decision::Decided { outcome, rationale } => {
                assert_eq!(outcome, Outcome::Loss);
                assert!(rationale.contains("2 occurrences"));
            }
            other => panic!("expected decided loss, got {other:?}"),
        }
    }

    #[test]
    fn total_label_count_breaks_remaining_ties() {
        let cfg = RulesConfig::default();
        // Same single verbose label each, but A has an extra lesser issue.
        match decide("4冗长，7格式及呈现不佳", "4冗长", &cfg) {
            Decision::Decided { outcome, .. } => assert_eq!(outcome, Outcome::Loss),
            other => panic!("expected decided loss, got {other:?}"),
        }
    }

    #[test]
    fn identical_sides_are_undecided_not_tie() {
        let cfg = RulesConfig::default();
        let decision = decide("13无问题", "13无问题", &cfg);
        assert!(decision.is_undecided());
        assert!(decision.rationale().contains("external judgment"));
    }

    #[test]
    fn empty_sides_route_through_no_issue_and_stay_undecided() {
        let cfg = RulesConfig::default();
        assert!(decide("", "", &cfg).is_undecided());
    }

    #[test]
    fn severity_monotonicity_ignores_counts() {
        let cfg = RulesConfig::default();
        // A has one severe label; B has many mild ones. A still loses.
        let decision = decide("1未提供需要信息", "4冗长，5简略，7格式及呈现不佳", &cfg);
        match decision {
            Decision::Decided { outcome, .. } => assert_eq!(outcome, Outcome::Loss),
            other => panic!("expected decided loss, got {other:?}"),
        }
    }

    #[test]
    fn no_issue_side_beats_issue_side() {
        let cfg = RulesConfig::default();
        match decide("13无问题", "4冗长", &cfg) {
            Decision::Decided { outcome, .. } => assert_eq!(outcome, Outcome::Win),
            other => panic!("expected decided win, got {other:?}"),
        }
    }

    #[test]
    fn unranked_bucket_ranks_below_everything() {
        let cfg = RulesConfig::default();
        // A's label is unrankable; B carries a real (mild) issue. B's ranked
        // issue is more severe than A's unranked one, so A wins.
        match decide("9其他_奇怪情况", "8内容要素不佳", &cfg) {
            Decision::Decided { outcome, .. } => assert_eq!(outcome, Outcome::Win),
            other => panic!("expected decided win, got {other:?}"),
        }
    }

    #[test]
    fn outcome_mirror_is_an_involution() {
        for o in [Outcome::Win, Outcome::Tie, Outcome::Loss] {
            assert_eq!(o.mirror().mirror(), o);
        }
    }

    #[test]
    fn outcome_parses_both_vocabularies() {
        assert_eq!(Outcome::parse("胜"), Some(Outcome::Win));
        assert_eq!(Outcome::parse(" tie "), Some(Outcome::Tie));
        assert_eq!(Outcome::parse("负"), Some(Outcome::Loss));
        assert_eq!(Outcome::parse("unknown"), None);
    }
}
