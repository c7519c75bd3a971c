//! # One-Shot Container Driver
//!
//! Runs a single container to completion through youki's `libcontainer`:
//! create from bundle, start the init process, wait for exit, destroy,
//! report the exit code. The container is destroyed on every path -
//! success, failure, and cancellation.
//!
//! ## Output Capture
//!
//! `libcontainer` forks the container init during `build()`, and the child
//! inherits this process's stdio. The driver therefore swaps its own
//! stdout/stderr for pipe write ends around the `build()` call and
//! restores them immediately after; pump threads tee the read ends into
//! the caller-supplied writers and into an in-memory buffer that is
//! embedded in any failure message.
//!
//! ## Cancellation
//!
//! The wait loop polls the init pid at 100 ms intervals and checks the
//! ambient cancellation token on every round. Cancellation sends SIGKILL
//! to the whole container, reaps the init process, destroys the container,
//! and surfaces `Error::Cancelled` with the captured output.
//!
//! ## Platform Support
//!
//! Linux only. On other targets [`run_one_shot`] returns
//! `Error::NotSupported`.

use std::io::Write;

#[cfg(target_os = "linux")]
pub use self::linux::run_one_shot;

#[cfg(not(target_os = "linux"))]
pub use self::stub::run_one_shot;

/// Writer type accepted for the stdout/stderr tees.
pub type OutputWriter = Box<dyn Write + Send>;

#[cfg(target_os = "linux")]
mod linux {
    use super::OutputWriter;
    use crate::bundle::{self, RuntimeSpec};
    use crate::constants::WAIT_POLL_INTERVAL;
    use crate::error::{Error, Result};
    use libcontainer::container::builder::ContainerBuilder;
    use libcontainer::container::Container;
    use libcontainer::signal::Signal as LibcontainerSignal;
    use libcontainer::syscall::syscall::SyscallType;
    use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
    use nix::unistd::{dup, dup2, geteuid, getegid, pipe, Pid};
    use std::fs;
    use std::io::{Read, Write};
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
    use std::path::{Path, PathBuf};
    use std::sync::{Arc, Mutex};
    use std::thread::JoinHandle;
    use tokio_util::sync::CancellationToken;
    use tracing::{debug, info, warn};

    /// Runs one container from `bundle_dir` to completion.
    ///
    /// Returns `Ok(())` on a clean zero exit. A non-zero exit surfaces as
    /// [`Error::ContainerExitNonZero`], cancellation as
    /// [`Error::Cancelled`]; both carry the merged output captured during
    /// the run.
    pub async fn run_one_shot(
        runtime_root: &Path,
        bundle_dir: &Path,
        container_id: &str,
        stdout: OutputWriter,
        stderr: OutputWriter,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut spec = prepare_bundle_spec(bundle_dir)?;
        if geteuid().as_raw() != 0 {
            bundle::apply_rootless(&mut spec, geteuid().as_raw(), getegid().as_raw());
            write_spec(bundle_dir, &spec)?;
        }

        create_state_root(runtime_root)?;

        // libcontainer resolves the spec's relative "rootfs" against the
        // process cwd, so enter the bundle for the container's lifetime.
        let _cwd = CwdGuard::enter(bundle_dir)?;

        let (out_read, out_write) = pipe().map_err(|e| Error::CreateFailed {
            id: container_id.to_string(),
            reason: format!("stdout pipe: {e}"),
        })?;
        let (err_read, err_write) = pipe().map_err(|e| Error::CreateFailed {
            id: container_id.to_string(),
            reason: format!("stderr pipe: {e}"),
        })?;

        let captured = Arc::new(Mutex::new(Vec::new()));
        let pumps = vec![
            spawn_pump(out_read, stdout, Arc::clone(&captured)),
            spawn_pump(err_read, stderr, Arc::clone(&captured)),
        ];

        debug!("creating container {container_id} from {}", bundle_dir.display());
        let build_result = match StdioRedirect::begin(&out_write, &err_write) {
            Ok(redirect) => {
                let result = ContainerBuilder::new(container_id.to_string(), SyscallType::default())
                    .with_root_path(runtime_root)
                    .map_err(|e| Error::CreateFailed {
                        id: container_id.to_string(),
                        reason: format!("invalid runtime root: {e}"),
                    })
                    .and_then(|builder| {
                        builder.validate_id().map_err(|e| Error::CreateFailed {
                            id: container_id.to_string(),
                            reason: format!("invalid container id: {e}"),
                        })
                    })
                    .and_then(|builder| {
                        builder
                            .as_init(bundle_dir)
                            .with_systemd(false)
                            .build()
                            .map_err(|e| Error::CreateFailed {
                                id: container_id.to_string(),
                                reason: e.to_string(),
                            })
                    });
                redirect.restore();
                result
            }
            Err(e) => Err(Error::CreateFailed {
                id: container_id.to_string(),
                reason: format!("stdio redirect: {e}"),
            }),
        };
        // Parent-side write ends must close so the pumps see EOF once the
        // container exits.
        drop(out_write);
        drop(err_write);

        let mut container = match build_result {
            Ok(container) => container,
            Err(e) => {
                join_pumps(pumps);
                return Err(e);
            }
        };

        if let Err(e) = container.start() {
            let error = Error::StartFailed {
                id: container_id.to_string(),
                reason: e.to_string(),
            };
            destroy_container(&mut container, container_id);
            join_pumps(pumps);
            return Err(error);
        }

        let init_pid = match container.pid() {
            Some(pid) => pid,
            None => {
                let error = Error::StartFailed {
                    id: container_id.to_string(),
                    reason: "container has no init pid after start".to_string(),
                };
                destroy_container(&mut container, container_id);
                join_pumps(pumps);
                return Err(error);
            }
        };
        info!("container {container_id} running with init pid {init_pid}");

        let outcome = wait_or_cancel(&mut container, container_id, init_pid, cancel).await;

        destroy_container(&mut container, container_id);
        join_pumps(pumps);
        let output = drain_captured(&captured);

        match outcome {
            WaitOutcome::Exited(0) => Ok(()),
            WaitOutcome::Exited(code) => Err(Error::ContainerExitNonZero {
                id: container_id.to_string(),
                code,
                output,
            }),
            WaitOutcome::Cancelled => Err(Error::Cancelled {
                id: container_id.to_string(),
                output,
            }),
        }
    }

    enum WaitOutcome {
        Exited(i32),
        Cancelled,
    }

    /// Polls the init pid until it exits or the token fires. On
    /// cancellation the whole container gets SIGKILL and the init process
    /// is reaped before returning.
    async fn wait_or_cancel(
        container: &mut Container,
        container_id: &str,
        init_pid: Pid,
        cancel: &CancellationToken,
    ) -> WaitOutcome {
        loop {
            if cancel.is_cancelled() {
                warn!("cancellation requested, killing container {container_id}");
                match LibcontainerSignal::try_from("SIGKILL") {
                    Ok(signal) => {
                        if let Err(e) = container.kill(signal, true) {
                            warn!("failed to SIGKILL container {container_id}: {e}");
                        }
                    }
                    Err(e) => warn!("failed to resolve SIGKILL: {e}"),
                }
                match waitpid(init_pid, None) {
                    Ok(status) => debug!("reaped cancelled container {container_id}: {status:?}"),
                    Err(e) => warn!("failed to reap container {container_id}: {e}"),
                }
                return WaitOutcome::Cancelled;
            }

            match waitpid(init_pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => {}
                Ok(WaitStatus::Exited(_, code)) => return WaitOutcome::Exited(code),
                Ok(WaitStatus::Signaled(_, signal, _)) => {
                    return WaitOutcome::Exited(128 + signal as i32);
                }
                Ok(other) => debug!("container {container_id} wait status: {other:?}"),
                Err(e) => {
                    // ECHILD means someone else reaped the init process;
                    // treat the container as finished cleanly.
                    warn!("waitpid for container {container_id} failed: {e}");
                    return WaitOutcome::Exited(0);
                }
            }

            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
        }
    }

    /// Reads and validates the bundle's `config.json`, normalising a blank
    /// cwd to `/`. Rejects terminal containers and empty argv.
    fn prepare_bundle_spec(bundle_dir: &Path) -> Result<RuntimeSpec> {
        let config_path = bundle_dir.join("config.json");
        let data = fs::read(&config_path).map_err(|_| Error::InvalidBundle {
            path: bundle_dir.to_path_buf(),
            reason: "config.json not found".to_string(),
        })?;
        let mut spec: RuntimeSpec = serde_json::from_slice(&data)?;

        if spec.process.args.is_empty() {
            return Err(Error::InvalidBundle {
                path: bundle_dir.to_path_buf(),
                reason: "process.args is empty".to_string(),
            });
        }
        if spec.process.terminal {
            return Err(Error::InvalidBundle {
                path: bundle_dir.to_path_buf(),
                reason: "terminal containers are not supported".to_string(),
            });
        }
        if spec.process.cwd.trim().is_empty() {
            spec.process.cwd = "/".to_string();
            write_spec(bundle_dir, &spec)?;
        }
        Ok(spec)
    }

    fn write_spec(bundle_dir: &Path, spec: &RuntimeSpec) -> Result<()> {
        let config_path = bundle_dir.join("config.json");
        let bytes = serde_json::to_vec_pretty(spec)?;
        fs::write(&config_path, bytes).map_err(|e| Error::io_at(&config_path, e))
    }

    fn create_state_root(runtime_root: &Path) -> Result<()> {
        use std::os::unix::fs::DirBuilderExt;
        if runtime_root.exists() {
            return Ok(());
        }
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(runtime_root)
            .map_err(|e| Error::io_at(runtime_root, e))
    }

    /// Destroys the container state; a state directory that is already
    /// gone is not an error.
    fn destroy_container(container: &mut Container, container_id: &str) {
        if let Err(e) = container.delete(true) {
            let msg = e.to_string();
            if msg.contains("not exist") || msg.contains("No such file") {
                debug!("container {container_id} state already removed: {msg}");
            } else {
                warn!("failed to delete container {container_id}: {msg}");
            }
        } else {
            debug!("deleted container {container_id}");
        }
    }

    /// Restores the previous working directory when dropped.
    struct CwdGuard {
        previous: PathBuf,
    }

    impl CwdGuard {
        fn enter(dir: &Path) -> Result<Self> {
            let previous = std::env::current_dir().map_err(Error::Io)?;
            std::env::set_current_dir(dir).map_err(|e| Error::io_at(dir, e))?;
            Ok(Self { previous })
        }
    }

    impl Drop for CwdGuard {
        fn drop(&mut self) {
            if let Err(e) = std::env::set_current_dir(&self.previous) {
                warn!(
                    "failed to restore working directory {}: {e}",
                    self.previous.display()
                );
            }
        }
    }

    /// Temporarily points this process's stdout/stderr at the pipe write
    /// ends so the forked container init inherits them.
    struct StdioRedirect {
        saved_out: OwnedFd,
        saved_err: OwnedFd,
    }

    impl StdioRedirect {
        fn begin(out_write: &OwnedFd, err_write: &OwnedFd) -> nix::Result<Self> {
            let saved_out = dup(libc::STDOUT_FILENO)?;
            let saved_err = dup(libc::STDERR_FILENO)?;
            // SAFETY: dup returned freshly created fds owned by no one else.
            let saved_out = unsafe { OwnedFd::from_raw_fd(saved_out) };
            let saved_err = unsafe { OwnedFd::from_raw_fd(saved_err) };
            dup2(out_write.as_raw_fd(), libc::STDOUT_FILENO)?;
            dup2(err_write.as_raw_fd(), libc::STDERR_FILENO)?;
            Ok(Self {
                saved_out,
                saved_err,
            })
        }

        fn restore(self) {
            let _ = dup2(self.saved_out.as_raw_fd(), libc::STDOUT_FILENO);
            let _ = dup2(self.saved_err.as_raw_fd(), libc::STDERR_FILENO);
        }
    }

    /// Pumps a pipe read end into the caller writer and the shared capture
    /// buffer until EOF.
    fn spawn_pump(
        read_end: OwnedFd,
        mut writer: OutputWriter,
        captured: Arc<Mutex<Vec<u8>>>,
    ) -> JoinHandle<()> {
        std::thread::spawn(move || {
            let mut src = fs::File::from(read_end);
            let mut buf = [0u8; 8192];
            loop {
                match src.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if let Err(e) = writer.write_all(&buf[..n]) {
                            warn!("container output writer failed: {e}");
                        }
                        if let Ok(mut captured) = captured.lock() {
                            captured.extend_from_slice(&buf[..n]);
                        }
                    }
                    Err(e) => {
                        warn!("container output pump failed: {e}");
                        break;
                    }
                }
            }
            let _ = writer.flush();
        })
    }

    fn join_pumps(pumps: Vec<JoinHandle<()>>) {
        for pump in pumps {
            if pump.join().is_err() {
                warn!("container output pump panicked");
            }
        }
    }

    fn drain_captured(captured: &Arc<Mutex<Vec<u8>>>) -> String {
        let bytes = captured.lock().map(|b| b.clone()).unwrap_or_default();
        String::from_utf8_lossy(&bytes).trim().to_string()
    }
}

#[cfg(not(target_os = "linux"))]
mod stub {
    use super::OutputWriter;
    use crate::error::{Error, Result};
    use std::path::Path;
    use tokio_util::sync::CancellationToken;

    /// Containers require Linux namespaces; other targets compile to this
    /// stub.
    pub async fn run_one_shot(
        _runtime_root: &Path,
        _bundle_dir: &Path,
        _container_id: &str,
        _stdout: OutputWriter,
        _stderr: OutputWriter,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        Err(Error::NotSupported(
            "running containers is only supported on Linux".to_string(),
        ))
    }
}
