//! Consistency analyzer over a synthetic merged sheet.

use sbs_arbiter::consistency::{analyze, annotate_flags, primary_label_agreement, render_markdown};
use sbs_arbiter::dataset::HumanAnnotation;
use sbs_arbiter::store::{ResultRow, RowStatus};

fn completed_row(id: u64, dimension: &str) -> ResultRow {
    let mut row = ResultRow::dropped(id, dimension, HumanAnnotation::default(), "");
    row.status = RowStatus::Completed;
    row.a_satisfaction = "acceptable".into();
    row.b_satisfaction = "acceptable".into();
    row.a_satisfied = "1".into();
    row.b_satisfied = "1".into();
    row.a_main_issues = "13无问题".into();
    row.b_main_issues = "13无问题".into();
    row.a_outcome = "tie".into();
    row.b_outcome = "tie".into();
    row.decided_by = "rules".into();
    row.rationale = String::new();
    row
}

fn annotated(mut row: ResultRow, outcome: &str) -> ResultRow {
    row.human = HumanAnnotation {
        a_rating: Some("acceptable".into()),
        b_rating: Some("acceptable".into()),
        a_satisfied: Some("1".into()),
        b_satisfied: Some("1".into()),
        a_main_issues: Some("13无问题".into()),
        b_main_issues: Some("13无问题".into()),
        a_outcome: Some(outcome.into()),
    };
    row
}

#[test]
fn jaccard_exception_cases_from_the_contract() {
    assert_eq!(primary_label_agreement("9", "13"), 1.0);
    assert_eq!(primary_label_agreement("13", "9"), 1.0);
    assert_eq!(primary_label_agreement("", ""), 1.0);
    assert_eq!(primary_label_agreement("2", "5"), 0.0);
}

#[test]
fn perfect_agreement_scores_one_everywhere() {
    let rows: Vec<ResultRow> = (0..3)
        .map(|i| annotated(completed_row(i, "闲聊"), "平"))
        .collect();
    let report = analyze(&rows);

    assert_eq!(report.analyzed_rows, 3);
    assert_eq!(report.dropped_rows, 0);
    assert!((report.overall.binary_rate - 1.0).abs() < 1e-9);
    assert!((report.overall.rating_rate - 1.0).abs() < 1e-9);
    assert!((report.overall.outcome_rate - 1.0).abs() < 1e-9);
    assert!((report.overall.primary_jaccard - 1.0).abs() < 1e-9);
}

#[test]
fn outcome_disagreement_lowers_only_the_outcome_rate() {
    let rows = vec![
        annotated(completed_row(0, "闲聊"), "平"),
        annotated(completed_row(1, "闲聊"), "胜"), // machine says tie
    ];
    let report = analyze(&rows);

    assert!((report.overall.outcome_rate - 0.5).abs() < 1e-9);
    assert!((report.overall.binary_rate - 1.0).abs() < 1e-9);
}

#[test]
fn dropped_and_unannotated_rows_are_excluded() {
    let dropped = ResultRow::dropped(0, "闲聊", HumanAnnotation::default(), "解析失败");
    let unannotated = completed_row(1, "闲聊");
    let good = annotated(completed_row(2, "闲聊"), "平");

    let report = analyze(&[dropped, unannotated, good]);
    assert_eq!(report.total_rows, 3);
    assert_eq!(report.analyzed_rows, 1);
    assert_eq!(report.dropped_rows, 1);
}

#[test]
fn human_drop_marker_excludes_the_row() {
    let mut row = annotated(completed_row(0, "闲聊"), "平");
    row.human.a_satisfied = Some("剔除".into());
    let report = analyze(&[row]);
    assert_eq!(report.analyzed_rows, 0);
}

#[test]
fn per_dimension_grouping_splits_the_rates() {
    let rows = vec![
        annotated(completed_row(0, "闲聊"), "平"),
        annotated(completed_row(1, "知识问答"), "胜"),
    ];
    let report = analyze(&rows);
    assert_eq!(report.by_dimension.len(), 2);
    let chat = report
        .by_dimension
        .iter()
        .find(|(d, _)| d == "闲聊")
        .map(|(_, s)| s)
        .unwrap();
    assert!((chat.outcome_rate - 1.0).abs() < 1e-9);
    let qa = report
        .by_dimension
        .iter()
        .find(|(d, _)| d == "知识问答")
        .map(|(_, s)| s)
        .unwrap();
    assert!((qa.outcome_rate - 0.0).abs() < 1e-9);
}

#[test]
fn outcome_pr_counts_supports_per_class() {
    let rows = vec![
        annotated(completed_row(0, "闲聊"), "平"),
        annotated(completed_row(1, "闲聊"), "平"),
        annotated(completed_row(2, "闲聊"), "负"),
    ];
    let report = analyze(&rows);
    let tie = report.outcome_pr.iter().find(|p| p.label == "tie").unwrap();
    assert_eq!(tie.support, 2);
    assert!((tie.recall - 1.0).abs() < 1e-9);
    // Machine always answered tie, so tie precision is 2/3.
    assert!((tie.precision - 2.0 / 3.0).abs() < 1e-9);
    let loss = report.outcome_pr.iter().find(|p| p.label == "loss").unwrap();
    assert_eq!(loss.support, 1);
    assert!((loss.recall - 0.0).abs() < 1e-9);
}

#[test]
fn flags_are_written_only_for_analyzed_rows() {
    let mut rows = vec![
        ResultRow::dropped(0, "闲聊", HumanAnnotation::default(), "解析失败"),
        annotated(completed_row(1, "闲聊"), "平"),
        annotated(completed_row(2, "闲聊"), "胜"),
    ];
    annotate_flags(&mut rows);

    assert!(rows[0].agree_outcome.is_none());
    assert_eq!(rows[1].agree_outcome, Some(true));
    assert_eq!(rows[2].agree_outcome, Some(false));
    assert_eq!(rows[1].agree_rating, Some(true));
    assert_eq!(rows[1].agree_binary, Some(true));
}

#[test]
fn markdown_report_renders_all_sections() {
    let rows = vec![annotated(completed_row(0, "闲聊"), "平")];
    let report = analyze(&rows);
    let md = render_markdown(&report);
    assert!(md.contains("# Human/machine consistency report"));
    assert!(md.contains("## Overall agreement"));
    assert!(md.contains("## By dimension"));
    assert!(md.contains("闲聊"));
    assert!(md.contains("## Outcome recall/precision"));
}
