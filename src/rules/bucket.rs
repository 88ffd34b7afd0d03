//! Label bucketizer: free-text issue labels → severity buckets.

use tracing::debug;

use super::config::RulesConfig;

/// Normalize an arbitrary issue label or phrase into a bucket identifier.
///
/// Resolution order, first match wins:
/// 1. dimension-quality prefix → high-quality bucket
/// 2. literal egregious / high-quality / no-issue bucket-code prefix
/// 3. ordered keyword dictionary, by substring containment
/// 4. secondary canonical-substring pass
/// 5. structural fallback: truncate at the first `_`
///
/// Total and pure: always returns a non-empty bucket string for non-empty
/// input. The structural fallback can produce a bucket that is absent from
/// `severity_order`; such buckets never participate in severity ranking.
pub fn bucket_of(label: &str, cfg: &RulesConfig) -> String {
    if label.trim().is_empty() {
        // Label splitting drops empties; a blank label reaching this point
        // still gets a ranked answer rather than an empty bucket.
        return cfg.no_issue_bucket.clone();
    }

    if cfg
        .dimension_quality_prefixes
        .iter()
        .any(|p| label.starts_with(p.as_str()))
    {
        return cfg.high_quality_bucket.clone();
    }

    if label.starts_with(&cfg.egregious_bucket) {
        return cfg.egregious_bucket.clone();
    }
    if label.starts_with(&cfg.high_quality_bucket) {
        return cfg.high_quality_bucket.clone();
    }
    if label.starts_with(&cfg.no_issue_bucket) {
        return cfg.no_issue_bucket.clone();
    }

    for rule in &cfg.keyword_buckets {
        if label.contains(rule.keyword.as_str()) {
            return rule.bucket.clone();
        }
    }

    for rule in &cfg.fallback_contains {
        if rule.any_of.iter().any(|s| label.contains(s.as_str())) {
            return rule.bucket.clone();
        }
    }

    // Last resort: the text before the first underscore becomes a synthetic
    // bucket. It will usually be unranked, so it cannot outweigh any real
    // bucket in a comparison.
    let synthetic = label.split('_').next().unwrap_or(label).to_string();
    if !cfg.severity_order.contains(&synthetic) {
        debug!(label, bucket = %synthetic, "label fell through to unranked synthetic bucket");
    }
    synthetic
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dimension_quality_prefix_wins_over_everything() {
        let cfg = RulesConfig::default();
        // Contains an egregious-looking keyword but the prefix rules first.
        assert_eq!(bucket_of("技能_弱智梗玩得好", &cfg), "14优质");
        assert_eq!(bucket_of("问答_专业有深度", &cfg), "14优质");
    }

    #[test]
    fn literal_bucket_codes_resolve_directly() {
        let cfg = RulesConfig::default();
        assert_eq!(bucket_of("12弱智_1.前后矛盾", &cfg), "12弱智");
        assert_eq!(bucket_of("13无问题", &cfg), "13无问题");
        assert_eq!(bucket_of("14优质_观点独到", &cfg), "14优质");
    }

    #[test]
    fn keyword_dictionary_order_decides_ties() {
        let cfg = RulesConfig::default();
        // "内容错误" precedes the generic "内容质量差" entry.
        assert_eq!(bucket_of("回答里有内容错误", &cfg), "2内容质量差_1.内容错误");
        assert_eq!(bucket_of("整体内容质量差", &cfg), "2内容质量差");
        assert_eq!(bucket_of("答非所问", &cfg), "1未提供需要信息");
    }

    #[test]
    fn fallback_truncates_at_underscore() {
        let cfg = RulesConfig::default();
        assert_eq!(bucket_of("9其他_奇怪情况", &cfg), "9其他");
    }

    #[test]
    fn totality_over_arbitrary_strings() {
        let cfg = RulesConfig::default();
        for s in ["", "_", "???", "完全自由的描述", "a_b_c"] {
            let bucket = bucket_of(s, &cfg);
            // Never panics, and twice gives the same answer.
            assert_eq!(bucket, bucket_of(s, &cfg));
        }
    }
}
