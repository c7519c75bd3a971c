//! # DAG Runner
//!
//! Executes a pipeline task: loads the template, orders the steps
//! topologically, renders them against the target node, and runs each
//! step's container sequentially, persisting the task record after every
//! status transition. Step *i+1* starts strictly after step *i*'s
//! container has been reaped and its terminal status written.

use crate::bundle::{self, BundleRole, StepProcess};
use crate::config::Paths;
use crate::dag::{
    self, build_task_record, load_template, topo_order, RunNode, StepStatus, TaskRecord,
};
use crate::driver;
use crate::error::{Error, Result};
use crate::rootfs::extract_rootfs;
use crate::store::ImageStore;
use crate::task::{
    container_id, find_run_dir_by_task_id, generate_task_id, logs_dir, node_dir, run_dir,
    write_task_record,
};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Pipeline executor backed by the image store and the OCI runtime.
#[derive(Debug, Clone)]
pub struct Runner {
    ar_root: PathBuf,
    pipelines_dir: PathBuf,
    store: ImageStore,
    runtime_root: PathBuf,
}

impl Runner {
    pub fn new(paths: &Paths) -> Self {
        Self {
            ar_root: paths.ar_root(),
            pipelines_dir: paths.pipelines_dir.clone(),
            store: ImageStore::new(&paths.images_store_dir),
            runtime_root: paths.runtime_state_root.clone(),
        }
    }

    /// Runs a pipeline against `nodes` and returns the task id.
    ///
    /// Every step currently executes on `nodes[0]`; the node list shape is
    /// kept for templates that will fan steps out across nodes later. A
    /// caller may pass a pre-generated `task_id` so its cancel registry
    /// and the on-disk record agree; `None` generates one.
    pub async fn run(
        &self,
        pipeline_name: &str,
        nodes: &[RunNode],
        task_id: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let node = nodes.first().ok_or_else(|| {
            Error::InvalidInput("node list must not be empty (pass a nodes JSON file)".into())
        })?;

        let steps = load_template(&self.pipelines_dir, pipeline_name)?;
        let ordered = topo_order(&steps)?;

        let task_id = task_id.unwrap_or_else(generate_task_id);
        let run_dir = run_dir(&self.ar_root, pipeline_name, &task_id);
        fs::create_dir_all(&run_dir).map_err(|e| Error::io_at(&run_dir, e))?;

        let mut record = build_task_record(&task_id, pipeline_name, &ordered, node);
        write_task_record(&run_dir, &record)?;

        info!(
            "starting pipeline {pipeline_name} task {task_id} ({} steps) in {}",
            record.steps.len(),
            run_dir.display()
        );
        self.execute_steps(&run_dir, &mut record, 0, cancel).await?;

        info!("pipeline {pipeline_name} task {task_id} finished");
        Ok(task_id)
    }

    /// Resumes a task from its first step whose status is not `success`.
    ///
    /// The step may have been left `running` (crash) or `cancelled`
    /// (stop); it is re-executed from scratch either way, so step payloads
    /// must tolerate at-least-once execution.
    pub async fn resume(&self, task_id: &str, cancel: &CancellationToken) -> Result<()> {
        let run_dir = find_run_dir_by_task_id(&self.ar_root, task_id)?;
        let mut record = crate::task::read_task_record(&run_dir)?;

        let start = record
            .steps
            .iter()
            .position(|s| s.status != StepStatus::Success);
        let Some(start) = start else {
            info!("pipeline task {task_id} already completed, nothing to resume");
            return Ok(());
        };

        info!(
            "resuming pipeline {} task {task_id} from step {} ({})",
            record.pipeline_name,
            start + 1,
            record.steps[start].name
        );
        self.execute_steps(&run_dir, &mut record, start, cancel).await?;

        info!("pipeline task {task_id} resumed to completion");
        Ok(())
    }

    /// Runs steps `start..` sequentially, persisting every transition.
    /// A failing step becomes `failed` (or `cancelled` when the ambient
    /// token fired) and aborts the task; later steps stay as they are.
    async fn execute_steps(
        &self,
        run_dir: &Path,
        record: &mut TaskRecord,
        start: usize,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let pipeline_name = record.pipeline_name.clone();

        for i in start..record.steps.len() {
            let step_name = record.steps[i].name.clone();
            let node_dir = node_dir(run_dir, i);
            fs::create_dir_all(&node_dir).map_err(|e| Error::io_at(&node_dir, e))?;

            record.steps[i].status = StepStatus::Running;
            write_task_record(run_dir, record)?;

            let cid = container_id(&pipeline_name, &step_name, i);
            let result = self
                .run_step(run_dir, &node_dir, &cid, &record.steps[i].clone(), cancel)
                .await;

            match result {
                Ok(()) => {
                    record.steps[i].status = StepStatus::Success;
                    write_task_record(run_dir, record)?;
                    info!("step {step_name} succeeded");
                }
                Err(e) => {
                    // A stop command may have written `cancelled` already;
                    // agree with it rather than overwriting with `failed`.
                    record.steps[i].status = if matches!(e, Error::Cancelled { .. }) {
                        StepStatus::Cancelled
                    } else {
                        StepStatus::Failed
                    };
                    if let Err(persist_err) = write_task_record(run_dir, record) {
                        warn!("failed to persist task record after step failure: {persist_err}");
                    }
                    return Err(Error::step(step_name, e));
                }
            }
        }
        Ok(())
    }

    /// Step executor: opens the step image, extracts a fresh rootfs under
    /// `bundles/<step>`, writes a runner-role bundle config, and drives
    /// the container with its output teed into the run's log files.
    async fn run_step(
        &self,
        run_dir: &Path,
        node_dir: &Path,
        container_id: &str,
        step: &dag::StepState,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let image = self.store.open(&step.image)?;

        let bundle_dir = run_dir.join("bundles").join(&step.name);
        if bundle_dir.exists() {
            fs::remove_dir_all(&bundle_dir).map_err(|e| Error::io_at(&bundle_dir, e))?;
        }
        let rootfs_dir = bundle_dir.join("rootfs");
        fs::create_dir_all(&rootfs_dir).map_err(|e| Error::io_at(&rootfs_dir, e))?;

        info!("unpacking step image {} -> {}", step.image, rootfs_dir.display());
        extract_rootfs(&image, &rootfs_dir)?;

        bundle::write_bundle_config(
            &bundle_dir,
            &image,
            BundleRole::Run { run_dir, node_dir },
            Some(&StepProcess {
                entrypoint: step.entrypoint.as_deref(),
                args: &step.args,
                env: &step.env,
            }),
        )?;

        let logs = logs_dir(run_dir);
        fs::create_dir_all(&logs).map_err(|e| Error::io_at(&logs, e))?;
        let stdout = File::create(logs.join(format!("{container_id}.stdout")))
            .map_err(|e| Error::io_at(&logs, e))?;
        let stderr = File::create(logs.join(format!("{container_id}.stderr")))
            .map_err(|e| Error::io_at(&logs, e))?;

        driver::run_one_shot(
            &self.runtime_root,
            &bundle_dir,
            container_id,
            Box::new(stdout),
            Box::new(stderr),
            cancel,
        )
        .await
    }
}
