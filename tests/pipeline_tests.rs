//! Runner-level behavior that does not need a container runtime: template
//! validation, run-directory lifecycle, and resume/stop interplay.

use allrun::dag::{StepState, StepStatus, TaskRecord};
use allrun::task::{
    container_id, find_run_dir_by_task_id, read_task_record, run_dir, write_task_record,
};
use allrun::{Error, Paths, Runner, RunNode};
use std::fs;
use std::path::Path;
use tokio_util::sync::CancellationToken;

fn test_paths(root: &Path) -> Paths {
    let paths = Paths::under(root);
    fs::create_dir_all(&paths.pipelines_dir).unwrap();
    paths
}

fn write_template(paths: &Paths, name: &str, body: &str) {
    fs::write(
        paths.pipelines_dir.join(format!("{name}.template.json")),
        body,
    )
    .unwrap();
}

fn one_node() -> Vec<RunNode> {
    vec![RunNode {
        ip: "1.2.3.4".to_string(),
        port: "22".to_string(),
        username: "root".to_string(),
        password: "secret".to_string(),
        labels: Vec::new(),
    }]
}

#[tokio::test]
async fn run_rejects_empty_node_list() {
    let root = tempfile::tempdir().unwrap();
    let paths = test_paths(root.path());
    write_template(&paths, "demo", r#"[{"name": "a", "image": "alpine"}]"#);

    let runner = Runner::new(&paths);
    let cancel = CancellationToken::new();
    match runner.run("demo", &[], None, &cancel).await {
        Err(Error::InvalidInput(_)) => {}
        other => panic!("expected InvalidInput, got {other:?}"),
    }
}

#[tokio::test]
async fn run_rejects_missing_template() {
    let root = tempfile::tempdir().unwrap();
    let paths = test_paths(root.path());

    let runner = Runner::new(&paths);
    let cancel = CancellationToken::new();
    match runner.run("ghost", &one_node(), None, &cancel).await {
        Err(Error::TemplateNotFound { .. }) => {}
        other => panic!("expected TemplateNotFound, got {other:?}"),
    }
}

#[tokio::test]
async fn run_rejects_cycle_before_creating_a_run_dir() {
    let root = tempfile::tempdir().unwrap();
    let paths = test_paths(root.path());
    write_template(
        &paths,
        "cyclic",
        r#"[
            {"name": "a", "image": "alpine", "nodes": ["b"]},
            {"name": "b", "image": "alpine", "nodes": ["a"]}
        ]"#,
    );

    let runner = Runner::new(&paths);
    let cancel = CancellationToken::new();
    match runner.run("cyclic", &one_node(), None, &cancel).await {
        Err(Error::InvalidDag) => {}
        other => panic!("expected InvalidDag, got {other:?}"),
    }
    assert!(
        !paths.ar_root().join("cyclic").exists(),
        "no run directory may exist after a rejected template"
    );
}

#[tokio::test]
async fn run_rejects_empty_template() {
    let root = tempfile::tempdir().unwrap();
    let paths = test_paths(root.path());
    write_template(&paths, "empty", "[]");

    let runner = Runner::new(&paths);
    let cancel = CancellationToken::new();
    assert!(matches!(
        runner.run("empty", &one_node(), None, &cancel).await,
        Err(Error::InvalidInput(_))
    ));
}

#[tokio::test]
async fn resume_of_a_fully_successful_task_is_a_no_op() {
    let root = tempfile::tempdir().unwrap();
    let paths = test_paths(root.path());

    let dir = run_dir(&paths.ar_root(), "demo", "task1");
    fs::create_dir_all(&dir).unwrap();
    write_task_record(
        &dir,
        &TaskRecord {
            task_id: "task1".to_string(),
            pipeline_name: "demo".to_string(),
            steps: vec![StepState {
                name: "a".to_string(),
                image: "alpine".to_string(),
                status: StepStatus::Success,
                entrypoint: None,
                args: Vec::new(),
                env: Vec::new(),
                nodes: Vec::new(),
            }],
        },
    )
    .unwrap();

    let runner = Runner::new(&paths);
    let cancel = CancellationToken::new();
    runner.resume("task1", &cancel).await.unwrap();

    let record = read_task_record(&dir).unwrap();
    assert_eq!(record.steps[0].status, StepStatus::Success);
}

#[tokio::test]
async fn resume_of_unknown_task_fails() {
    let root = tempfile::tempdir().unwrap();
    let paths = test_paths(root.path());
    fs::create_dir_all(paths.ar_root().join("demo")).unwrap();

    let runner = Runner::new(&paths);
    let cancel = CancellationToken::new();
    assert!(matches!(
        runner.resume("nope", &cancel).await,
        Err(Error::TaskNotFound(_))
    ));
}

#[test]
fn stop_then_record_matches_container_ids_used_at_run_time() {
    // Container ids recomputed during stop must equal the ids the runner
    // would have used: pure function of pipeline, step, and index.
    let root = tempfile::tempdir().unwrap();
    let paths = test_paths(root.path());

    let dir = run_dir(&paths.ar_root(), "deploy prod", "t9");
    fs::create_dir_all(&dir).unwrap();
    write_task_record(
        &dir,
        &TaskRecord {
            task_id: "t9".to_string(),
            pipeline_name: "deploy prod".to_string(),
            steps: vec![
                StepState {
                    name: "fetch".to_string(),
                    image: "alpine".to_string(),
                    status: StepStatus::Running,
                    entrypoint: None,
                    args: Vec::new(),
                    env: Vec::new(),
                    nodes: Vec::new(),
                },
                StepState {
                    name: "apply".to_string(),
                    image: "alpine".to_string(),
                    status: StepStatus::Pending,
                    entrypoint: None,
                    args: Vec::new(),
                    env: Vec::new(),
                    nodes: Vec::new(),
                },
            ],
        },
    )
    .unwrap();

    assert_eq!(container_id("deploy prod", "fetch", 0), "ar_deployprod_fetch_1");

    allrun::task::stop_task(&paths.ar_root(), &paths.runtime_state_root, "t9").unwrap();
    let record = read_task_record(&dir).unwrap();
    assert_eq!(record.steps[0].status, StepStatus::Cancelled);
    assert_eq!(record.steps[1].status, StepStatus::Cancelled);

    let found = find_run_dir_by_task_id(&paths.ar_root(), "t9").unwrap();
    assert_eq!(found, dir);
}
