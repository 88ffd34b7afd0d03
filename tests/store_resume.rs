//! Checkpoint/resume semantics for partition stores and the run loop.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use sbs_arbiter::dataset::{DatasetRow, HumanAnnotation};
use sbs_arbiter::gateway::{ChatGateway, ChatRequest, ChatResponse, FinishReason, ProviderError};
use sbs_arbiter::rules::RulesConfig;
use sbs_arbiter::store::{self, PartitionStore, ResultRow};
use sbs_arbiter::{run_dataset, RetryPolicy, RunOptions};

fn history_json() -> String {
    json!([{"human": "问", "AI": "答"}]).to_string()
}

fn row(id: u64) -> DatasetRow {
    DatasetRow {
        id,
        dimension: "闲聊".into(),
        side_a: history_json(),
        side_b: history_json(),
        prompt_time: None,
        human: HumanAnnotation::default(),
    }
}

/// Returns the same scripted judgments for every row, and counts which row
/// ids actually reached the judge (derived from send order: single-side
/// responses are popped per row).
struct CountingGateway {
    single: Mutex<VecDeque<String>>,
    comparative: String,
    finals: String,
    calls: AtomicUsize,
}

impl CountingGateway {
    fn for_rows(n: usize, issue: &str) -> Arc<Self> {
        let single = json!({"主要问题": issue, "标注理由": ""}).to_string();
        Arc::new(Self {
            // Two single-side calls per row.
            single: Mutex::new((0..2 * n).map(|_| single.clone()).collect()),
            comparative: json!({
                "大模型A_SBS主要问题": issue,
                "大模型B_SBS主要问题": issue,
            })
            .to_string(),
            finals: json!({"大模型A竞品对比": "平", "裁判说明": "一致"}).to_string(),
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatGateway for CountingGateway {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let content = match req.attribution.caller {
            "judge::single_side" => self
                .single
                .lock()
                .unwrap()
                .pop_front()
                .expect("more single-side calls than scripted"),
            "judge::comparative" => self.comparative.clone(),
            "judge::final_verdict" => self.finals.clone(),
            other => panic!("unexpected caller {other}"),
        };
        Ok(ChatResponse {
            content,
            input_tokens: 1,
            output_tokens: 1,
            latency: Duration::from_millis(1),
            finish_reason: FinishReason::Stop,
        })
    }
}

fn fast_opts(out_dir: &std::path::Path) -> RunOptions {
    RunOptions::new("test/judge", out_dir)
        .workers(1)
        .retry(RetryPolicy {
            max_attempts: 1,
            backoff: Duration::from_millis(0),
        })
        .pace(Duration::from_millis(0))
}

#[test]
fn commit_persists_snapshot_and_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = PartitionStore::open(dir.path(), 0).unwrap();
    assert!(store.checkpoint().is_none());
    assert!(store.is_empty());

    store
        .commit(ResultRow::dropped(3, "闲聊", HumanAnnotation::default(), "测试"))
        .unwrap();
    store
        .commit(ResultRow::dropped(5, "闲聊", HumanAnnotation::default(), "测试"))
        .unwrap();

    // A fresh open sees both rows and the last checkpoint.
    let reopened = PartitionStore::open(dir.path(), 0).unwrap();
    assert_eq!(reopened.len(), 2);
    assert_eq!(reopened.checkpoint(), Some(5));
}

#[test]
fn recommit_overwrites_the_same_row() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = PartitionStore::open(dir.path(), 0).unwrap();
    store
        .commit(ResultRow::dropped(1, "闲聊", HumanAnnotation::default(), "第一次"))
        .unwrap();
    store
        .commit(ResultRow::dropped(1, "闲聊", HumanAnnotation::default(), "第二次"))
        .unwrap();

    let reopened = PartitionStore::open(dir.path(), 0).unwrap();
    assert_eq!(reopened.len(), 1);
    assert_eq!(reopened.rows().next().unwrap().rationale, "第二次");
}

#[tokio::test]
async fn resume_skips_rows_at_or_below_the_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let rows: Vec<DatasetRow> = (0..4).map(row).collect();

    // First run: complete everything, remember the outputs.
    let gateway = CountingGateway::for_rows(4, "13无问题");
    let summary = run_dataset(
        gateway.clone(),
        Arc::new(RulesConfig::default()),
        rows.clone(),
        fast_opts(dir.path()),
    )
    .await
    .unwrap();
    assert_eq!(summary.completed, 4);
    assert_eq!(summary.skipped, 0);
    let first_calls = gateway.calls();
    assert!(first_calls > 0);

    // Second run over the same directory: the checkpoint covers every row,
    // so no judge call is made and nothing is reprocessed.
    let gateway2 = CountingGateway::for_rows(0, "13无问题");
    let summary2 = run_dataset(
        gateway2.clone(),
        Arc::new(RulesConfig::default()),
        rows,
        fast_opts(dir.path()),
    )
    .await
    .unwrap();
    assert_eq!(summary2.completed, 4);
    assert_eq!(summary2.skipped, 4);
    assert_eq!(gateway2.calls(), 0);
}

#[tokio::test]
async fn interrupted_run_resumes_and_matches_an_uninterrupted_run() {
    let rows: Vec<DatasetRow> = (0..4).map(row).collect();
    let rules = Arc::new(RulesConfig::default());

    // Reference: one uninterrupted run.
    let full_dir = tempfile::tempdir().unwrap();
    let gateway = CountingGateway::for_rows(4, "13无问题");
    run_dataset(
        gateway,
        rules.clone(),
        rows.clone(),
        fast_opts(full_dir.path()),
    )
    .await
    .unwrap();
    let full = store::merge_partitions(full_dir.path(), 1, full_dir.path().join("r.json")).unwrap();

    // Interrupted: rows 0 and 1 were committed before a crash (checkpoint
    // = 1); the resumed run must only process rows 2 and 3.
    let resume_dir = tempfile::tempdir().unwrap();
    {
        let mut store = PartitionStore::open(resume_dir.path(), 0).unwrap();
        store.commit(full[0].clone()).unwrap();
        store.commit(full[1].clone()).unwrap();
    }
    let gateway = CountingGateway::for_rows(2, "13无问题");
    let summary = run_dataset(
        gateway.clone(),
        rules,
        rows,
        fast_opts(resume_dir.path()),
    )
    .await
    .unwrap();
    assert_eq!(summary.skipped, 2);
    // 2 rows × (2 single-side + 1 comparative + 1 final) = 8 calls.
    assert_eq!(gateway.calls(), 8);

    let resumed =
        store::merge_partitions(resume_dir.path(), 1, resume_dir.path().join("r.json")).unwrap();
    assert_eq!(resumed.len(), full.len());
    for (a, b) in full.iter().zip(resumed.iter()) {
        assert_eq!(
            serde_json::to_value(a).unwrap(),
            serde_json::to_value(b).unwrap()
        );
    }
}

#[tokio::test]
async fn merge_orders_rows_across_partitions() {
    let dir = tempfile::tempdir().unwrap();
    let mut p0 = PartitionStore::open(dir.path(), 0).unwrap();
    let mut p1 = PartitionStore::open(dir.path(), 1).unwrap();
    p0.commit(ResultRow::dropped(2, "闲聊", HumanAnnotation::default(), "x"))
        .unwrap();
    p1.commit(ResultRow::dropped(1, "闲聊", HumanAnnotation::default(), "y"))
        .unwrap();
    p0.commit(ResultRow::dropped(4, "闲聊", HumanAnnotation::default(), "z"))
        .unwrap();

    let merged = store::merge_partitions(dir.path(), 2, dir.path().join("merged.json")).unwrap();
    let ids: Vec<u64> = merged.iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![1, 2, 4]);

    // The merged sheet loads back identically.
    let loaded = store::load_results(dir.path().join("merged.json")).unwrap();
    assert_eq!(loaded.len(), 3);
}
