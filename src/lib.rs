#![forbid(unsafe_code)]

//! # sbs-arbiter
//!
//! Side-by-side (SBS) quality comparison of two conversational-model
//! transcripts against a severity taxonomy.
//!
//! Instead of asking an LLM judge to pick a winner directly (unreliable,
//! miscalibrated), sbs-arbiter first collects structured issue labels per
//! side, normalizes them into a ranked severity taxonomy, and decides
//! win/loss/tie deterministically whenever the label evidence separates the
//! two sides. Only genuinely ambiguous rows are escalated to a final
//! judgment call. Runs are partitioned, checkpointed, and resumable.

pub mod consistency;
pub mod dataset;
pub mod gateway;
pub mod judge;
pub mod pipeline;
pub mod rules;
pub mod store;

pub use gateway::{Attribution, ChatGateway, ProviderGateway};
pub use judge::{Judge, JudgeError, RetryPolicy};
pub use pipeline::{run_dataset, PipelineError, RunOptions, RunSummary};
pub use rules::{
    bucket_of, classify, decide, merge_issue_sets, top_severity, Decision, Outcome, RulesConfig,
    SatisfactionTier,
};
pub use store::{PartitionStore, ResultRow, RowStatus, StoreError};
