//! # Task Store and Lifecycle
//!
//! The durable task record lives at `<run_dir>/pipeline.json` and is the
//! authority across process restarts. Writes go through a temp file plus
//! rename, so a reader sees either the previous or the new content, never
//! a truncated document.
//!
//! This module also composes the lifecycle operations that only need the
//! record and the sweeper: discovering a run directory by task id,
//! listing running tasks, stopping a task, and reading container logs.

use crate::constants::{CONTAINER_ID_PREFIX, LOG_FOLLOW_INTERVAL, TASK_RECORD_FILE};
use crate::dag::{StepStatus, TaskRecord};
use crate::error::{Error, Result};
use crate::store::{atomic_write, sanitize_pipeline_name};
use crate::sweeper;
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

// =============================================================================
// Naming
// =============================================================================

/// Generates a unique task id: lowercase hex of the current unix-epoch
/// nanoseconds.
pub fn generate_task_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    format!("{nanos:x}")
}

/// The run directory of a task: `<ar_root>/<sanitised_pipeline>/<task_id>`.
pub fn run_dir(ar_root: &Path, pipeline_name: &str, task_id: &str) -> PathBuf {
    ar_root
        .join(sanitize_pipeline_name(pipeline_name))
        .join(task_id)
}

/// The per-step node directory, 1-based: `<run_dir>/node<i>`. Bind-mounted
/// into the step container as `/current-task`.
pub fn node_dir(run_dir: &Path, step_index: usize) -> PathBuf {
    run_dir.join(format!("node{}", step_index + 1))
}

/// The log directory of a run: `<run_dir>/logs`.
pub fn logs_dir(run_dir: &Path) -> PathBuf {
    run_dir.join("logs")
}

/// Deterministic container id of a step:
/// `ar_<sanitised_pipeline>_<step_name>_<1-based index>`. Recomputable
/// from the task record alone, which is what stop and resume rely on.
pub fn container_id(pipeline_name: &str, step_name: &str, step_index: usize) -> String {
    format!(
        "{CONTAINER_ID_PREFIX}{}_{}_{}",
        sanitize_pipeline_name(pipeline_name),
        step_name,
        step_index + 1
    )
}

// =============================================================================
// Task Record I/O
// =============================================================================

/// Persists a task record to `<run_dir>/pipeline.json` atomically.
pub fn write_task_record(run_dir: &Path, record: &TaskRecord) -> Result<()> {
    let path = run_dir.join(TASK_RECORD_FILE);
    let bytes = serde_json::to_vec_pretty(record)?;
    atomic_write(&path, |file| file.write_all(&bytes))?;
    debug!("wrote {}", path.display());
    Ok(())
}

/// Reads the task record from `<run_dir>/pipeline.json`.
pub fn read_task_record(run_dir: &Path) -> Result<TaskRecord> {
    let path = run_dir.join(TASK_RECORD_FILE);
    let data = fs::read(&path).map_err(|e| Error::io_at(&path, e))?;
    Ok(serde_json::from_slice(&data)?)
}

/// Scans the immediate pipeline directories under `ar_root` for the run
/// directory holding `task_id`. Task ids are globally unique, so the first
/// match wins.
pub fn find_run_dir_by_task_id(ar_root: &Path, task_id: &str) -> Result<PathBuf> {
    if task_id.trim().is_empty() {
        return Err(Error::InvalidInput("task id must not be empty".into()));
    }
    let entries = fs::read_dir(ar_root).map_err(|e| Error::io_at(ar_root, e))?;
    for entry in entries {
        let entry = entry.map_err(Error::Io)?;
        if !entry.path().is_dir() {
            continue;
        }
        let candidate = entry.path().join(task_id);
        if candidate.join(TASK_RECORD_FILE).is_file() {
            return Ok(candidate);
        }
    }
    Err(Error::TaskNotFound(task_id.to_string()))
}

// =============================================================================
// Task List
// =============================================================================

/// One running step reported by [`list_running_tasks`].
#[derive(Debug, Clone)]
pub struct RunningStepRow {
    pub pipeline_name: String,
    pub task_id: String,
    pub step_name: String,
    pub container_id: String,
}

/// Scans every run directory under `ar_root` and reports a row per step in
/// `running` status. `filter_pipeline` restricts to one pipeline (matched
/// by sanitised directory name). Unreadable records are skipped with a
/// warning.
pub fn list_running_tasks(
    ar_root: &Path,
    filter_pipeline: Option<&str>,
) -> Result<Vec<RunningStepRow>> {
    let filter = match filter_pipeline {
        Some(name) => {
            let sanitized = sanitize_pipeline_name(name);
            if sanitized.is_empty() {
                return Err(Error::InvalidInput(format!(
                    "invalid pipeline name: {name:?}"
                )));
            }
            Some(sanitized)
        }
        None => None,
    };

    let mut rows = Vec::new();
    let entries = match fs::read_dir(ar_root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(rows),
        Err(e) => return Err(Error::io_at(ar_root, e)),
    };

    for entry in entries {
        let entry = entry.map_err(Error::Io)?;
        if !entry.path().is_dir() {
            continue;
        }
        let Some(pipeline_dir_name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if let Some(filter) = &filter
            && &pipeline_dir_name != filter
        {
            continue;
        }

        let task_entries = match fs::read_dir(entry.path()) {
            Ok(task_entries) => task_entries,
            Err(e) => {
                warn!("failed to read pipeline dir {}: {e}", entry.path().display());
                continue;
            }
        };
        for task_entry in task_entries {
            let Ok(task_entry) = task_entry else { continue };
            if !task_entry.path().is_dir() {
                continue;
            }
            let Some(task_id) = task_entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let record = match read_task_record(&task_entry.path()) {
                Ok(record) => record,
                Err(e) => {
                    debug!(
                        "skipping {} without a readable task record: {e}",
                        task_entry.path().display()
                    );
                    continue;
                }
            };
            for (i, step) in record.steps.iter().enumerate() {
                if step.status != StepStatus::Running {
                    continue;
                }
                rows.push(RunningStepRow {
                    pipeline_name: record.pipeline_name.clone(),
                    task_id: task_id.clone(),
                    step_name: step.name.clone(),
                    container_id: container_id(&record.pipeline_name, &step.name, i),
                });
            }
        }
    }
    Ok(rows)
}

// =============================================================================
// Stop
// =============================================================================

/// Stops a task: running steps get their container swept (exact-id prefix)
/// and become `cancelled`, pending steps become `cancelled`, every other
/// status is preserved. The updated record is persisted once at the end.
pub fn stop_task(ar_root: &Path, runtime_root: &Path, task_id: &str) -> Result<()> {
    let run_dir = find_run_dir_by_task_id(ar_root, task_id)?;
    let mut record = read_task_record(&run_dir)?;

    for i in 0..record.steps.len() {
        match record.steps[i].status {
            StepStatus::Running => {
                let cid = container_id(&record.pipeline_name, &record.steps[i].name, i);
                sweeper::stop_and_remove(runtime_root, &cid);
                record.steps[i].status = StepStatus::Cancelled;
            }
            StepStatus::Pending => {
                record.steps[i].status = StepStatus::Cancelled;
            }
            _ => {}
        }
    }

    write_task_record(&run_dir, &record)?;
    info!("stopped pipeline task {task_id} ({})", run_dir.display());
    Ok(())
}

// =============================================================================
// Logs
// =============================================================================

/// Prints the stdout and stderr logs of one container, or of every step
/// container of the task when `container_id` is `None`. `tail` limits the
/// initial output to the last N lines (`None` prints everything);
/// `follow` then polls for appended bytes once per second and never
/// returns.
pub fn show_task_logs(
    ar_root: &Path,
    task_id: &str,
    container: Option<&str>,
    follow: bool,
    tail: Option<usize>,
    out: &mut impl Write,
) -> Result<()> {
    let run_dir = find_run_dir_by_task_id(ar_root, task_id)?;

    match container {
        Some(cid) => print_container_logs(&run_dir, cid, follow, tail, out),
        None => {
            let record = read_task_record(&run_dir)?;
            for (i, step) in record.steps.iter().enumerate() {
                let cid = container_id(&record.pipeline_name, &step.name, i);
                print_container_logs(&run_dir, &cid, follow, tail, out)?;
            }
            Ok(())
        }
    }
}

fn print_container_logs(
    run_dir: &Path,
    container_id: &str,
    follow: bool,
    tail: Option<usize>,
    out: &mut impl Write,
) -> Result<()> {
    let logs = logs_dir(run_dir);
    for (title, path) in [
        ("STDOUT", logs.join(format!("{container_id}.stdout"))),
        ("STDERR", logs.join(format!("{container_id}.stderr"))),
    ] {
        print_log_file(container_id, title, &path, follow, tail, out)?;
    }
    Ok(())
}

fn print_log_file(
    container_id: &str,
    title: &str,
    path: &Path,
    follow: bool,
    tail: Option<usize>,
    out: &mut impl Write,
) -> Result<()> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!("{title} log does not exist: {}", path.display());
            return Ok(());
        }
        Err(e) => return Err(Error::io_at(path, e)),
    };

    writeln!(out, "===== {container_id} {title} ({}) =====", path.display()).map_err(Error::Io)?;

    let mut data = String::new();
    file.read_to_string(&mut data).map_err(|e| Error::io_at(path, e))?;
    match tail {
        Some(0) => {}
        Some(n) => {
            let lines: Vec<&str> = data.lines().collect();
            let start = lines.len().saturating_sub(n);
            for line in &lines[start..] {
                writeln!(out, "{line}").map_err(Error::Io)?;
            }
        }
        None => {
            out.write_all(data.as_bytes()).map_err(Error::Io)?;
        }
    }

    if !follow {
        writeln!(out).map_err(Error::Io)?;
        return Ok(());
    }

    // Follow mode: poll for appended bytes from the current end of file.
    let mut offset = file.seek(SeekFrom::End(0)).map_err(|e| Error::io_at(path, e))?;
    loop {
        std::thread::sleep(LOG_FOLLOW_INTERVAL);

        let len = match fs::metadata(path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("{title} log was removed: {}", path.display());
                return Ok(());
            }
            Err(e) => return Err(Error::io_at(path, e)),
        };
        if len <= offset {
            continue;
        }

        file.seek(SeekFrom::Start(offset)).map_err(|e| Error::io_at(path, e))?;
        let mut chunk = vec![0u8; (len - offset) as usize];
        let n = file.read(&mut chunk).map_err(|e| Error::io_at(path, e))?;
        if n > 0 {
            out.write_all(&chunk[..n]).map_err(Error::Io)?;
            out.flush().map_err(Error::Io)?;
            offset += n as u64;
        }
    }
}
