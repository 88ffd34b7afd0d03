//! Typed rules configuration, loaded once per run.
//!
//! The original scoring rules live in a YAML document; this module gives
//! them an explicit schema and validates them at load time so that
//! classification never has to handle a malformed table mid-row. Keyword
//! rules are an ordered list, not a map: match precedence follows list
//! order and is part of the contract.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// One fuzzy keyword → bucket rule. First matching rule in the list wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeywordRule {
    pub keyword: String,
    pub bucket: String,
}

/// Secondary containment rule: any of `any_of` appearing in the label maps
/// it to `bucket`. A guard pass behind the primary keyword list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainsRule {
    pub any_of: Vec<String>,
    pub bucket: String,
}

/// Bucket/prefix patterns per satisfaction tier, evaluated most severe
/// first (egregious → unacceptable → acceptable → high quality).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SatisfactionMap {
    #[serde(default)]
    pub egregious: Vec<String>,
    #[serde(default)]
    pub unacceptable: Vec<String>,
    #[serde(default)]
    pub acceptable: Vec<String>,
    #[serde(default)]
    pub high_quality: Vec<String>,
}

/// Per-dimension annotation guidance, injected into judge prompts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DimensionSpec {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub notes: Vec<String>,
    /// Allowed high-quality sub-labels for this dimension.
    #[serde(default)]
    pub high_quality_labels: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum RulesConfigError {
    #[error("io error reading rules config: {0}")]
    Io(#[from] std::io::Error),
    #[error("yaml error in rules config: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("severity_order must not be empty")]
    EmptySeverityOrder,
    #[error("severity_order contains duplicate bucket {0:?}")]
    DuplicateBucket(String),
    #[error("bucket {0:?} is referenced but missing from severity_order")]
    MissingBucket(String),
}

/// The full rules document: severity ranking, tier mapping, keyword
/// normalization tables, and dimension definitions.
///
/// Immutable for the duration of a run; the pipeline and all classifiers
/// take it by reference — there is no ambient global copy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RulesConfig {
    /// Buckets from most severe to least, terminating in the no-issue and
    /// high-quality buckets.
    pub severity_order: Vec<String>,
    pub satisfaction_map: SatisfactionMap,
    /// Ordered keyword → bucket dictionary (first match wins).
    pub keyword_buckets: Vec<KeywordRule>,
    /// Secondary containment pass behind the keyword dictionary.
    pub fallback_contains: Vec<ContainsRule>,
    /// Label prefixes that mark a dimension-specific high-quality label.
    pub dimension_quality_prefixes: Vec<String>,
    /// Literal bucket codes with special handling in classification.
    pub egregious_bucket: String,
    pub no_issue_bucket: String,
    pub high_quality_bucket: String,
    /// Keyword whose presence anywhere in a label forces the egregious tier.
    pub egregious_keyword: String,
    /// Per-dimension definitions keyed by dimension tag.
    pub dimensions: BTreeMap<String, DimensionSpec>,
    /// When the final-judgment call exhausts its retries, default the row to
    /// a tie instead of dropping it.
    pub tie_on_judge_failure: bool,
}

impl RulesConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, RulesConfigError> {
        let text = std::fs::read_to_string(path)?;
        let cfg: Self = serde_yaml::from_str(&text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Check structural invariants that classification relies on. A defect
    /// here is a configuration error and must surface at load time, never
    /// per-row.
    pub fn validate(&self) -> Result<(), RulesConfigError> {
        if self.severity_order.is_empty() {
            return Err(RulesConfigError::EmptySeverityOrder);
        }
        let mut seen = std::collections::BTreeSet::new();
        for bucket in &self.severity_order {
            if !seen.insert(bucket) {
                return Err(RulesConfigError::DuplicateBucket(bucket.clone()));
            }
        }
        for bucket in [&self.no_issue_bucket, &self.high_quality_bucket] {
            if !self.severity_order.contains(bucket) {
                return Err(RulesConfigError::MissingBucket(bucket.clone()));
            }
        }
        Ok(())
    }

    /// Position of a bucket in the severity order; unranked buckets sort
    /// after the last configured bucket.
    pub fn rank(&self, bucket: &str) -> usize {
        self.severity_order
            .iter()
            .position(|b| b == bucket)
            .unwrap_or(self.severity_order.len())
    }

    pub fn dimension(&self, tag: &str) -> DimensionSpec {
        self.dimensions.get(tag).cloned().unwrap_or_default()
    }
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            severity_order: vec![
                "12弱智".into(),
                "1未提供需要信息".into(),
                "2内容质量差_1.内容错误".into(),
                "2内容质量差".into(),
                "3多轮效果不佳".into(),
                "4冗长".into(),
                "5简略".into(),
                "6语言表达不佳".into(),
                "7格式及呈现不佳".into(),
                "8内容要素不佳".into(),
                "13无问题".into(),
                "14优质".into(),
            ],
            satisfaction_map: SatisfactionMap {
                egregious: vec!["12弱智".into()],
                unacceptable: vec![
                    "1未提供需要信息".into(),
                    "2内容质量差_1.内容错误".into(),
                    "2内容质量差_2.内容过时".into(),
                    "3多轮效果不佳".into(),
                ],
                acceptable: vec![
                    "2内容质量差".into(),
                    "4冗长".into(),
                    "5简略".into(),
                    "6语言表达不佳".into(),
                    "7格式及呈现不佳".into(),
                    "8内容要素不佳".into(),
                    "13无问题".into(),
                ],
                high_quality: vec!["14优质".into()],
            },
            keyword_buckets: default_keyword_buckets(),
            fallback_contains: default_fallback_contains(),
            dimension_quality_prefixes: vec![
                "技能_".into(),
                "生文_".into(),
                "问答_".into(),
                "闲聊_".into(),
            ],
            egregious_bucket: "12弱智".into(),
            no_issue_bucket: "13无问题".into(),
            high_quality_bucket: "14优质".into(),
            egregious_keyword: "弱智".into(),
            dimensions: BTreeMap::new(),
            tie_on_judge_failure: true,
        }
    }
}

fn kw(keyword: &str, bucket: &str) -> KeywordRule {
    KeywordRule {
        keyword: keyword.into(),
        bucket: bucket.into(),
    }
}

/// The built-in fuzzy normalization table. Order matters: more specific
/// keywords sit before the generic family keyword they would otherwise
/// shadow.
fn default_keyword_buckets() -> Vec<KeywordRule> {
    vec![
        kw("弱智", "12弱智"),
        kw("未提供需要信息", "1未提供需要信息"),
        kw("答非所问", "1未提供需要信息"),
        kw("不跟随指令", "1未提供需要信息"),
        kw("不合理拒答", "1未提供需要信息"),
        kw("内容错误", "2内容质量差_1.内容错误"),
        kw("实体错误", "2内容质量差_1.内容错误"),
        kw("信息过时", "2内容质量差_2.内容过时"),
        kw("内容过时", "2内容质量差_2.内容过时"),
        kw("内容质量差", "2内容质量差"),
        kw("要点不全面", "2内容质量差"),
        kw("实用性不佳", "2内容质量差"),
        kw("逻辑不清", "2内容质量差"),
        kw("执行深度不足", "2内容质量差"),
        kw("多轮效果不佳", "3多轮效果不佳"),
        kw("多轮记忆错误", "3多轮效果不佳"),
        kw("多轮逻辑错误", "3多轮效果不佳"),
        kw("任务不持续", "3多轮效果不佳"),
        kw("冗长", "4冗长"),
        kw("拓展过多", "4冗长"),
        kw("篇幅过长", "4冗长"),
        kw("内容重复", "4冗长"),
        kw("无关内容过多", "4冗长"),
        kw("简略", "5简略"),
        kw("篇幅过短", "5简略"),
        kw("拓展过少", "5简略"),
        kw("表达过于精简", "5简略"),
        kw("语言表达不佳", "6语言表达不佳"),
        kw("AI感强", "6语言表达不佳"),
        kw("风格不一致", "6语言表达不佳"),
        kw("无免责声明", "6语言表达不佳"),
        kw("有攻击性", "6语言表达不佳_4.有攻击性"),
        kw("格式", "7格式及呈现不佳"),
        kw("格式及呈现不佳", "7格式及呈现不佳"),
        kw("界面呈现不佳", "7格式及呈现不佳"),
        kw("文字格式不佳", "7格式及呈现不佳"),
        kw("富媒体", "8内容要素不佳"),
        kw("无用资源", "8内容要素不佳"),
        kw("内容要素不佳", "8内容要素不佳"),
        kw("组织内容形式少", "8内容要素不佳"),
        kw("有趣好聊", "14优质"),
        kw("专业有深度", "14优质"),
        kw("观点独到", "14优质"),
    ]
}

/// Canonical bucket-name substrings checked when the keyword table misses.
fn default_fallback_contains() -> Vec<ContainsRule> {
    fn rule(any_of: &[&str], bucket: &str) -> ContainsRule {
        ContainsRule {
            any_of: any_of.iter().map(|s| s.to_string()).collect(),
            bucket: bucket.into(),
        }
    }
    vec![
        rule(
            &["内容质量差_1.内容错误", "内容错误"],
            "2内容质量差_1.内容错误",
        ),
        rule(&["内容质量差"], "2内容质量差"),
        rule(&["未提供需要信息"], "1未提供需要信息"),
        rule(&["多轮效果不佳"], "3多轮效果不佳"),
        rule(&["冗长"], "4冗长"),
        rule(&["简略"], "5简略"),
        rule(&["语言表达不佳"], "6语言表达不佳"),
        rule(&["格式及呈现不佳", "格式"], "7格式及呈现不佳"),
        rule(&["内容要素不佳", "富媒体"], "8内容要素不佳"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        RulesConfig::default().validate().expect("default config");
    }

    #[test]
    fn rank_of_unknown_bucket_is_past_the_end() {
        let cfg = RulesConfig::default();
        assert_eq!(cfg.rank("12弱智"), 0);
        assert_eq!(cfg.rank("不存在的桶"), cfg.severity_order.len());
    }

    #[test]
    fn duplicate_severity_bucket_is_rejected() {
        let mut cfg = RulesConfig::default();
        cfg.severity_order.push("12弱智".into());
        assert!(matches!(
            cfg.validate(),
            Err(RulesConfigError::DuplicateBucket(_))
        ));
    }

    #[test]
    fn no_issue_bucket_must_be_ranked() {
        let mut cfg = RulesConfig::default();
        cfg.severity_order.retain(|b| b != "13无问题");
        assert!(matches!(
            cfg.validate(),
            Err(RulesConfigError::MissingBucket(_))
        ));
    }

    #[test]
    fn yaml_round_trip_preserves_keyword_order() {
        let cfg = RulesConfig::default();
        let yaml = serde_yaml::to_string(&cfg).expect("serialize");
        let back: RulesConfig = serde_yaml::from_str(&yaml).expect("deserialize");
        let keys: Vec<_> = back.keyword_buckets.iter().map(|k| &k.keyword).collect();
        let orig: Vec<_> = cfg.keyword_buckets.iter().map(|k| &k.keyword).collect();
        assert_eq!(keys, orig);
    }
}
