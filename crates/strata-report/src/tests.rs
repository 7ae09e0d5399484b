#![allow(clippy::expect_used)]

use std::collections::BTreeSet;

use serde_json::json;
use strata_domain::{
    Change, ChangeAction, Changeset, EnvironmentName, NodeId, NodeOutcome, NodeResult, NodeStatus,
    Phase, ResourceType, RunReport,
};

use super::{ColorChoice, OutputFormat, RenderOptions, redact_sensitive, render_plan, render_run};

#[test]
fn redact_basic_replacement() {
    let mut sensitive = BTreeSet::new();
    sensitive.insert("my-secret-token".to_string());
    let input = "token is my-secret-token here";
    assert_eq!(
        redact_sensitive(input, &sensitive),
        "token is [REDACTED] here"
    );
}

#[test]
fn redact_short_value_skipped() {
    let mut sensitive = BTreeSet::new();
    sensitive.insert("ab".to_string());
    sensitive.insert("x".to_string());
    let input = "ab and x remain";
    assert_eq!(redact_sensitive(input, &sensitive), input);
}

#[test]
fn redact_prefers_longest_value() {
    let mut sensitive = BTreeSet::new();
    sensitive.insert("secret".to_string());
    sensitive.insert("secret-password".to_string());
    assert_eq!(
        redact_sensitive("pw=secret-password", &sensitive),
        "pw=[REDACTED]"
    );
}

#[test]
fn redact_json_escaped_value() {
    let mut sensitive = BTreeSet::new();
    sensitive.insert("pa\"ss\\word".to_string());
    let rendered = serde_json::to_string(&json!({ "password": "pa\"ss\\word" })).expect("json");
    let redacted = redact_sensitive(&rendered, &sensitive);
    assert_eq!(redacted, r#"{"password":"[REDACTED]"}"#);
}

fn base_options() -> RenderOptions {
    RenderOptions {
        color: ColorChoice::Never,
        verbose: false,
        command: None,
        target: Some("infra/staging".to_string()),
    }
}

fn verbose_options() -> RenderOptions {
    RenderOptions {
        verbose: true,
        ..base_options()
    }
}

fn node(name: &str) -> NodeId {
    NodeId::try_from(name).expect("node id")
}

fn change(name: &str, resource_type: ResourceType, action: ChangeAction, phase: Phase) -> Change {
    Change {
        node: node(name),
        resource_type,
        action,
        phase,
        replacement: false,
        reason: None,
        inputs: json!({}),
        resolved_inputs: None,
        fingerprint: None,
        provider_id: None,
        probe: false,
        depends_on: Vec::new(),
    }
}

fn sample_changeset() -> Changeset {
    let mut update = change("app", ResourceType::Deployment, ChangeAction::Update, Phase::Apply);
    update.reason = Some("inputs changed: image".to_string());
    update.depends_on = vec![0];
    Changeset {
        operations: vec![
            change("db", ResourceType::Database, ChangeAction::Create, Phase::Apply),
            update,
            change("cache", ResourceType::Bucket, ChangeAction::NoOp, Phase::Apply),
            change("assets", ResourceType::Bucket, ChangeAction::NoOp, Phase::Apply),
            change("old", ResourceType::Volume, ChangeAction::Delete, Phase::Cleanup),
        ],
        warnings: vec!["resource `old` is stranded".to_string()],
    }
}

fn line(symbol: &str, label: &str, detail: &str) -> String {
    format!("  {symbol} {label:<18}{detail}")
}

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

#[test]
fn plan_text_lists_changes_and_tally() {
    let output = render_plan(&sample_changeset(), OutputFormat::Text, &base_options())
        .expect("render plan");

    assert!(output.starts_with("plan infra/staging\n"), "{output}");
    assert!(output.contains(&line("+", "create", "db (database)")), "{output}");
    assert!(
        output.contains(&format!(
            "{}  inputs changed: image",
            line("~", "update", "app (deployment)")
        )),
        "{output}"
    );
    assert!(output.contains(&line("-", "delete", "old (volume)")), "{output}");
    assert!(output.contains("  2 unchanged (2 bucket)"), "{output}");
    assert!(output.contains("  warn: resource `old` is stranded"), "{output}");
    assert!(
        output.ends_with("Plan: 1 to create, 1 to update, 1 to delete, 2 unchanged\n"),
        "{output}"
    );
    assert!(!output.contains("cache"), "{output}");
}

#[test]
fn plan_text_verbose_shows_noops_and_ordering() {
    let output = render_plan(&sample_changeset(), OutputFormat::Text, &verbose_options())
        .expect("render plan");

    assert!(output.contains(&line("=", "unchanged", "cache (bucket)")), "{output}");
    assert!(output.contains("    #1 apply after #0"), "{output}");
    assert!(output.contains("    #4 cleanup"), "{output}");
    assert!(!output.contains("2 unchanged (2 bucket)"), "{output}");
}

#[test]
fn plan_text_marks_replacements() {
    let mut delete = change("db", ResourceType::Database, ChangeAction::Delete, Phase::Teardown);
    delete.replacement = true;
    let mut create = change("db", ResourceType::Database, ChangeAction::Create, Phase::Apply);
    create.replacement = true;
    create.depends_on = vec![0];
    let changeset = Changeset {
        operations: vec![delete, create],
        warnings: Vec::new(),
    };

    let output = render_plan(&changeset, OutputFormat::Text, &base_options()).expect("render plan");
    assert!(
        output.contains(&line("-", "replace (delete)", "db (database)")),
        "{output}"
    );
    assert!(
        output.contains(&line("+", "replace (create)", "db (database)")),
        "{output}"
    );
}

#[test]
fn plan_text_empty_changeset() {
    let output = render_plan(&Changeset::default(), OutputFormat::Text, &base_options())
        .expect("render plan");
    assert_eq!(output, "plan infra/staging\n  Nothing to do.\n");
}

#[test]
fn plan_text_only_noops_collapses_to_counts() {
    let changeset = Changeset {
        operations: vec![change(
            "db",
            ResourceType::Database,
            ChangeAction::NoOp,
            Phase::Apply,
        )],
        warnings: Vec::new(),
    };
    let output = render_plan(&changeset, OutputFormat::Text, &base_options()).expect("render plan");
    assert!(output.contains("  1 unchanged (1 database)"), "{output}");
    assert!(output.ends_with("Plan: 1 unchanged\n"), "{output}");
}

#[test]
fn plan_json_is_the_changeset() {
    let changeset = sample_changeset();
    let output = render_plan(&changeset, OutputFormat::Json, &base_options()).expect("render json");
    let parsed: Changeset = serde_json::from_str(&output).expect("parse json");
    assert_eq!(parsed, changeset);
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

fn result(index: usize, change: &Change, outcome: NodeOutcome) -> NodeResult {
    let (status, transitions) = match outcome {
        NodeOutcome::Applied => (
            NodeStatus::Complete,
            vec![
                NodeStatus::Pending,
                NodeStatus::Initializing,
                NodeStatus::Creating,
                NodeStatus::Created,
            ],
        ),
        NodeOutcome::Failed => (
            NodeStatus::Error,
            vec![
                NodeStatus::Pending,
                NodeStatus::Initializing,
                NodeStatus::Updating,
                NodeStatus::Error,
            ],
        ),
        NodeOutcome::Unchanged => (NodeStatus::Complete, Vec::new()),
        NodeOutcome::Blocked | NodeOutcome::Cancelled => {
            (NodeStatus::Pending, vec![NodeStatus::Pending])
        }
    };
    NodeResult {
        index,
        node: change.node.clone(),
        action: change.action,
        phase: change.phase,
        outcome,
        status,
        transitions,
        error: None,
        timed_out: false,
        blocked_by: None,
        promoted: false,
    }
}

fn partial_failure_report() -> RunReport {
    let changeset = Changeset {
        operations: vec![
            change("db", ResourceType::Database, ChangeAction::Create, Phase::Apply),
            change("cache", ResourceType::Bucket, ChangeAction::Update, Phase::Apply),
            change("app", ResourceType::Deployment, ChangeAction::Create, Phase::Apply),
            change("assets", ResourceType::Bucket, ChangeAction::NoOp, Phase::Apply),
        ],
        warnings: Vec::new(),
    };
    let ops = &changeset.operations;
    let mut failed = result(1, &ops[1], NodeOutcome::Failed);
    failed.error = Some("update failed: quota exceeded".to_string());
    let mut blocked = result(2, &ops[2], NodeOutcome::Blocked);
    blocked.blocked_by = Some(node("cache"));
    let results = vec![
        result(0, &ops[0], NodeOutcome::Applied),
        failed,
        blocked,
        result(3, &ops[3], NodeOutcome::Unchanged),
    ];
    RunReport {
        environment: EnvironmentName::default(),
        changeset,
        results,
        failed: vec![node("cache")],
        cancelled: false,
    }
}

#[test]
fn run_text_reports_failures_and_blocked_nodes() {
    let output = render_run(&partial_failure_report(), OutputFormat::Text, &base_options())
        .expect("render run");

    assert!(output.starts_with("apply infra/staging\n"), "{output}");
    assert!(output.contains(&line("+", "created", "db (database)")), "{output}");
    assert!(output.contains(&line("!", "failed", "cache (bucket)")), "{output}");
    assert!(output.contains("update failed: quota exceeded"), "{output}");
    assert!(output.contains(&line("!", "blocked", "app (deployment)")), "{output}");
    assert!(output.contains("blocked by cache"), "{output}");
    assert!(output.contains("  1 unchanged (1 bucket)"), "{output}");
    assert!(
        output.contains("Applied: 1 created, 1 failed, 1 blocked, 1 unchanged\n"),
        "{output}"
    );
    assert!(output.ends_with("Partially failed: cache\n"), "{output}");
}

#[test]
fn run_text_verbose_shows_transitions() {
    let output = render_run(&partial_failure_report(), OutputFormat::Text, &verbose_options())
        .expect("render run");
    assert!(
        output.contains("    #0 pending -> initializing -> creating -> created"),
        "{output}"
    );
    assert!(output.contains(&line("=", "unchanged", "assets (bucket)")), "{output}");
}

#[test]
fn run_text_timeout_and_drift() {
    let changeset = Changeset {
        operations: vec![
            change("db", ResourceType::Database, ChangeAction::NoOp, Phase::Apply),
            change("app", ResourceType::Deployment, ChangeAction::Create, Phase::Apply),
        ],
        warnings: Vec::new(),
    };
    let ops = &changeset.operations;
    let mut drifted = result(0, &ops[0], NodeOutcome::Applied);
    drifted.promoted = true;
    let mut timed_out = result(1, &ops[1], NodeOutcome::Failed);
    timed_out.timed_out = true;
    timed_out.error = Some("create timed out after 900s".to_string());
    let report = RunReport {
        environment: EnvironmentName::default(),
        changeset,
        results: vec![drifted, timed_out],
        failed: vec![node("app")],
        cancelled: false,
    };

    let output = render_run(&report, OutputFormat::Text, &base_options()).expect("render run");
    assert!(
        output.contains(&line("~", "updated (drift)", "db (database)")),
        "{output}"
    );
    assert!(output.contains(&line("!", "timed out", "app (deployment)")), "{output}");
    assert!(output.contains("Applied: 1 updated, 1 failed\n"), "{output}");
}

#[test]
fn run_text_cancelled() {
    let changeset = Changeset {
        operations: vec![
            change("db", ResourceType::Database, ChangeAction::Create, Phase::Apply),
            change("app", ResourceType::Deployment, ChangeAction::Create, Phase::Apply),
        ],
        warnings: Vec::new(),
    };
    let ops = &changeset.operations;
    let results = vec![
        result(0, &ops[0], NodeOutcome::Applied),
        result(1, &ops[1], NodeOutcome::Cancelled),
    ];
    let report = RunReport {
        environment: EnvironmentName::default(),
        changeset,
        results,
        failed: Vec::new(),
        cancelled: true,
    };

    let output = render_run(&report, OutputFormat::Text, &base_options()).expect("render run");
    assert!(output.contains(&line("-", "not started", "app (deployment)")), "{output}");
    assert!(output.contains("Applied: 1 created, 1 not started\n"), "{output}");
    assert!(
        output.ends_with("Cancelled: pending nodes were not started\n"),
        "{output}"
    );
}

#[test]
fn run_json_round_trips() {
    let report = partial_failure_report();
    let output = render_run(&report, OutputFormat::Json, &base_options()).expect("render json");
    let parsed: RunReport = serde_json::from_str(&output).expect("parse json");
    assert_eq!(parsed, report);
    assert!(output.contains("\"outcome\": \"blocked\""), "{output}");
}

#[test]
fn run_text_without_target() {
    let options = RenderOptions {
        target: None,
        ..base_options()
    };
    let report = RunReport {
        environment: EnvironmentName::default(),
        changeset: Changeset::default(),
        results: Vec::new(),
        failed: Vec::new(),
        cancelled: false,
    };
    let output = render_run(&report, OutputFormat::Text, &options).expect("render run");
    assert_eq!(output, "apply\n  Nothing to do.\n");

    let destroy = RenderOptions {
        command: Some("destroy".to_string()),
        ..options
    };
    let output = render_run(&report, OutputFormat::Text, &destroy).expect("render run");
    assert_eq!(output, "destroy\n  Nothing to do.\n");
}
