//! Judge-call layer: prompt construction, JSON extraction, typed parsing,
//! and bounded retry around the gateway.
//!
//! The gateway retries transport failures; this layer retries *semantic*
//! failures — a judge that answered but not in the contracted JSON shape.
//! Both ceilings are bounded, and every call is preceded by a fixed pacing
//! delay to respect provider rate limits.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::gateway::{Attribution, ChatGateway, ChatModel, ChatRequest, Message, ProviderError};
use crate::rules::{DimensionSpec, RulesConfig};

/// Bounded-retry policy for judge calls whose responses fail to parse.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts per call (first try included).
    pub max_attempts: u32,
    /// Fixed delay between attempts.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JudgeError {
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("unparseable judge response: {0}")]
    Parse(String),
    #[error("{caller} failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        caller: &'static str,
        attempts: u32,
        last_error: String,
    },
}

// =============================================================================
// Judge payloads
// =============================================================================

/// Output of one single-side classification call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SingleSideJudgment {
    /// Comma-separated issue labels from the configured vocabulary.
    #[serde(rename = "主要问题", default)]
    pub main_issues: String,
    /// Concrete reason, populated only for egregious / high-quality rows.
    #[serde(rename = "优质弱智主要问题", default)]
    pub extreme_reason: String,
    #[serde(rename = "标注理由", default)]
    pub rationale: String,
}

/// Output of the comparative-analysis call: evidence only, no verdict.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComparativeAnalysis {
    #[serde(rename = "大模型A_SBS主要问题", default)]
    pub a_issues: String,
    #[serde(rename = "大模型B_SBS主要问题", default)]
    pub b_issues: String,
    #[serde(rename = "大模型A_命中的失败触发器", default)]
    pub a_triggers: Vec<String>,
    #[serde(rename = "大模型B_命中的失败触发器", default)]
    pub b_triggers: Vec<String>,
    #[serde(rename = "大模型A_符合的胜利模式", default)]
    pub a_patterns: Vec<String>,
    #[serde(rename = "大模型B_符合的胜利模式", default)]
    pub b_patterns: Vec<String>,
}

/// Output of the final-verdict call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FinalJudgment {
    /// 胜/平/负 for side A.
    #[serde(rename = "大模型A竞品对比", default)]
    pub verdict: String,
    #[serde(rename = "裁判说明", default)]
    pub rationale: String,
}

// =============================================================================
// JSON extraction
// =============================================================================

/// Extract the first balanced JSON object from a judge response. Handles
/// markdown fences and surrounding prose.
pub fn extract_json(raw: &str) -> &str {
    let trimmed = raw.trim();

    if let Some(start) = trimmed.find('{') {
        let remainder = &trimmed[start..];
        let mut depth = 0;
        for (i, c) in remainder.char_indices() {
            match c {
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        return &remainder[..=i];
                    }
                }
                _ => {}
            }
        }
    }

    trimmed
}

/// Parse a judge response into a typed payload.
pub fn parse_judge_json<T: DeserializeOwned>(raw: &str) -> Result<T, JudgeError> {
    serde_json::from_str(extract_json(raw)).map_err(|e| JudgeError::Parse(e.to_string()))
}

// =============================================================================
// Judge
// =============================================================================

/// The three judge calls the pipeline makes, with pacing and parse-retry
/// baked in. Prompt *content* is data; only the JSON contract above is API.
pub struct Judge {
    gateway: Arc<dyn ChatGateway>,
    model: String,
    retry: RetryPolicy,
    /// Fixed delay inserted before every call.
    pace: Duration,
}

impl Judge {
    pub fn new(
        gateway: Arc<dyn ChatGateway>,
        model: impl Into<String>,
        retry: RetryPolicy,
        pace: Duration,
    ) -> Self {
        Self {
            gateway,
            model: model.into(),
            retry,
            pace,
        }
    }

    /// Stage S1: independent issue labelling for one side.
    pub async fn single_side(
        &self,
        run_time: &str,
        history: &str,
        last_round: &str,
        dimension: &str,
        cfg: &RulesConfig,
        job_id: Uuid,
    ) -> Result<SingleSideJudgment, JudgeError> {
        let prompt = single_side_prompt(run_time, history, last_round, dimension, cfg);
        self.call_and_parse(prompt, "judge::single_side", job_id)
            .await
    }

    /// Stage S3: comparative evidence collection across both sides.
    pub async fn comparative(
        &self,
        dimension: &str,
        a_history: &str,
        a_last: &str,
        b_history: &str,
        b_last: &str,
        cfg: &RulesConfig,
        job_id: Uuid,
    ) -> Result<ComparativeAnalysis, JudgeError> {
        let prompt = comparative_prompt(dimension, a_history, a_last, b_history, b_last, cfg);
        self.call_and_parse(prompt, "judge::comparative", job_id)
            .await
    }

    /// Stage S4 fallback: final verdict when the rules cannot separate the
    /// sides.
    pub async fn final_verdict(
        &self,
        analysis: &ComparativeAnalysis,
        a_single_issues: &str,
        b_single_issues: &str,
        cfg: &RulesConfig,
        job_id: Uuid,
    ) -> Result<FinalJudgment, JudgeError> {
        let analysis_json =
            serde_json::to_string_pretty(analysis).map_err(|e| JudgeError::Parse(e.to_string()))?;
        let prompt = final_verdict_prompt(&analysis_json, a_single_issues, b_single_issues, cfg);
        self.call_and_parse(prompt, "judge::final_verdict", job_id)
            .await
    }

    async fn call_and_parse<T: DeserializeOwned>(
        &self,
        prompt: String,
        caller: &'static str,
        job_id: Uuid,
    ) -> Result<T, JudgeError> {
        let mut last_error = String::new();

        for attempt in 0..self.retry.max_attempts {
            if attempt > 0 {
                tokio::time::sleep(self.retry.backoff).await;
            }
            tokio::time::sleep(self.pace).await;

            let request = ChatRequest::new(
                ChatModel::openrouter(&self.model),
                vec![Message::user(&prompt)],
                Attribution::new(caller).with_job(job_id),
            )
            .json();

            // Transport failures already went through the gateway's own
            // retry ceiling; treat whatever comes back like a bad response
            // and spend a parse attempt on it.
            let raw = match self.gateway.chat(request).await {
                Ok(resp) => resp.content,
                Err(err) => {
                    warn!(caller, attempt, error = %err, "judge call failed");
                    last_error = err.to_string();
                    continue;
                }
            };

            match parse_judge_json::<T>(&raw) {
                Ok(parsed) => return Ok(parsed),
                Err(err) => {
                    warn!(caller, attempt, error = %err, "judge response did not parse");
                    last_error = err.to_string();
                }
            }
        }

        Err(JudgeError::RetriesExhausted {
            caller,
            attempts: self.retry.max_attempts,
            last_error,
        })
    }
}

// =============================================================================
// Prompts
// =============================================================================
//
// Condensed from the production annotation prompts. The wording is tuned
// for annotation recall, not engineering elegance; treat it as data.

fn dimension_block(tag: &str, spec: &DimensionSpec) -> String {
    format!(
        "【当前维度】{tag}\n- 维度说明：{}\n- 注意事项：{}\n- 该维度可用优质标签：{}",
        spec.description,
        spec.notes.join("；"),
        spec.high_quality_labels.join("，"),
    )
}

fn label_vocabulary(cfg: &RulesConfig) -> String {
    cfg.severity_order.join("，")
}

fn single_side_prompt(
    run_time: &str,
    history: &str,
    last_round: &str,
    dimension: &str,
    cfg: &RulesConfig,
) -> String {
    let spec = cfg.dimension(dimension);
    format!(
        "【你的角色和心态】\n\
         你是一名经验丰富的互联网标注员。你的评判核心是效率和用户体感，抓大放小，\
         只有遇到真正影响理解和使用的明显错误时才给出负面评价。\n\n\
         【任务指令】\n\
         现在是 {run_time}。请仅基于该模型的多轮对话，对最后一轮回答的多轮记忆、\
         内容、格式等方面标注存在的【主要问题】：\n\
         - 选择1-3个最相关的问题标签，多选用中文逗号分隔；\n\
         - 若为“{egregious}”或“{high_quality}”，请在“优质弱智主要问题”中给出具体原因；\n\
         - 若没有任何问题，标注“{no_issue}”；\n\
         - 禁止输出不在清单内的标签。\n\n\
         {dim_block}\n\n\
         【主要问题标签全集】（只能从中选择）：\n{vocabulary}\n\n\
         【对话上下文（不含最后一轮）】：\n{history}\n\n\
         【本轮用户-模型问答对】：\n{last_round}\n\n\
         请输出严格 JSON：\n\
         {{\n  \"主要问题\": \"多个标签用中文逗号分隔\",\n  \
         \"优质弱智主要问题\": \"若包含{egregious}或{high_quality}请写具体原因，否则留空\",\n  \
         \"标注理由\": \"一句话解释判断理由\"\n}}",
        egregious = cfg.egregious_bucket,
        high_quality = cfg.high_quality_bucket,
        no_issue = cfg.no_issue_bucket,
        dim_block = dimension_block(dimension, &spec),
        vocabulary = label_vocabulary(cfg),
    )
}

fn comparative_prompt(
    dimension: &str,
    a_history: &str,
    a_last: &str,
    b_history: &str,
    b_last: &str,
    cfg: &RulesConfig,
) -> String {
    let spec = cfg.dimension(dimension);
    format!(
        "【你的角色】\n\
         你是一位客观、只相信证据的评测分析员。完整记录双方的表现，\
         但绝对不要做出任何胜/平/负的结论性判断。\n\n\
         【核心任务】\n\
         1. 对比问题标注：从标签集合中为两个模型分别选择最能体现其相对优劣的问题标签，\
            没有明显问题则标注“{no_issue}”；\n\
         2. 失败触发器检查：列出双方命中的不可容忍的严重错误；\n\
         3. 胜利模式评估：列出双方体现出的决定性亮点。\n\n\
         {dim_block}\n\n\
         【SBS标签集合】（只能从中选择）：\n{vocabulary}\n\n\
         【大模型A：上下文】\n{a_history}\n\n【大模型A：本轮】\n{a_last}\n\n\
         【大模型B：上下文】\n{b_history}\n\n【大模型B：本轮】\n{b_last}\n\n\
         你的输出必须且只能是一个严格的JSON对象：\n\
         {{\n  \"大模型A_SBS主要问题\": \"可多选，中文逗号分隔\",\n  \
         \"大模型B_SBS主要问题\": \"可多选，中文逗号分隔\",\n  \
         \"大模型A_命中的失败触发器\": [],\n  \"大模型B_命中的失败触发器\": [],\n  \
         \"大模型A_符合的胜利模式\": [],\n  \"大模型B_符合的胜利模式\": []\n}}",
        no_issue = cfg.no_issue_bucket,
        dim_block = dimension_block(dimension, &spec),
        vocabulary = label_vocabulary(cfg),
    )
}

fn final_verdict_prompt(
    analysis_json: &str,
    a_single_issues: &str,
    b_single_issues: &str,
    cfg: &RulesConfig,
) -> String {
    format!(
        "【你的角色】\n\
         你是一位逻辑严谨的高级评测法官。基于下属分析员提交的结构化【案件档案】，\
         做出最终的胜/平/负裁决并给出简洁理由。\n\n\
         【案件档案】\n{analysis_json}\n\n\
         【判定规则】（严格按顺序）：\n\
         1. 任何一方命中失败触发器，直接判负；双方都命中则更严重或更多的一方判负；\n\
         2. 双方均无致命错误时，胜利模式更多或更具决定性的一方判胜；\n\
         3. 仍不明朗时，综合双方全部问题标签：按严重程度排序（{severity}），\
            更严重者判负；同级比该级数量，再比总数，多者判负；\n\
         4. 以上都无法区分则判“平”。\n\n\
         【辅助信息：单模初步诊断】\n\
         大模型A：{a_single_issues}\n大模型B：{b_single_issues}\n\n\
         只输出严格 JSON：\n\
         {{\n  \"大模型A竞品对比\": \"胜/平/负\",\n  \"裁判说明\": \"一句话核心决策依据\"\n}}",
        severity = cfg.severity_order.join(" > "),
    )
}
