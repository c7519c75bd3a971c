//! # Container Sweeper
//!
//! Best-effort removal of containers whose ids match a prefix, by listing
//! the runtime state root the way `runc list` does: every subdirectory
//! name is a container id, loadable through `libcontainer`.
//!
//! The sweeper backs `task stop` and must never fail the surrounding
//! command: every per-container error is logged at `warn` and swallowed.
//! An empty prefix is refused (it would match every container on the
//! host), and a missing state root is a no-op.

#[cfg(target_os = "linux")]
pub use self::linux::stop_and_remove;

#[cfg(not(target_os = "linux"))]
pub use self::stub::stop_and_remove;

#[cfg(target_os = "linux")]
mod linux {
    use crate::constants::SWEEP_GRACE_PERIOD;
    use libcontainer::container::{Container, ContainerStatus};
    use libcontainer::signal::Signal as LibcontainerSignal;
    use std::fs;
    use std::path::Path;
    use tracing::{debug, info, warn};

    /// Stops and destroys every container under `runtime_root` whose id
    /// starts with `id_prefix`. Running and created containers get
    /// SIGTERM, a grace period, then SIGKILL if still running. All errors
    /// are logged, never returned.
    pub fn stop_and_remove(runtime_root: &Path, id_prefix: &str) {
        if id_prefix.trim().is_empty() {
            warn!("no container id prefix given, refusing to sweep every container");
            return;
        }

        let entries = match fs::read_dir(runtime_root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(
                    "runtime state root {} does not exist, nothing to sweep",
                    runtime_root.display()
                );
                return;
            }
            Err(e) => {
                warn!("failed to read runtime root {}: {e}", runtime_root.display());
                return;
            }
        };

        let mut matched: Vec<(String, Container)> = Vec::new();
        for entry in entries {
            let Ok(entry) = entry else { continue };
            if !entry.path().is_dir() {
                continue;
            }
            let Some(id) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if !id.starts_with(id_prefix) {
                continue;
            }
            match Container::load(entry.path()) {
                Ok(container) => matched.push((id, container)),
                // Concurrent deletion is expected; skip and move on.
                Err(e) => warn!("failed to load container {id}: {e}"),
            }
        }

        if matched.is_empty() {
            info!(
                "no containers with prefix {id_prefix:?} under {}",
                runtime_root.display()
            );
            return;
        }

        info!(
            "stopping and removing {} container(s) with prefix {id_prefix:?}",
            matched.len()
        );

        for (id, mut container) in matched {
            let status = container.state.status;
            if status == ContainerStatus::Running || status == ContainerStatus::Created {
                match LibcontainerSignal::try_from("SIGTERM") {
                    Ok(sigterm) => match container.kill(sigterm, true) {
                        Ok(()) => {
                            info!("sent SIGTERM to container {id}");
                            std::thread::sleep(SWEEP_GRACE_PERIOD);
                        }
                        Err(e) => warn!("failed to SIGTERM container {id}: {e}"),
                    },
                    Err(e) => warn!("failed to resolve SIGTERM: {e}"),
                }

                match container.refresh_status() {
                    Ok(()) => {
                        if container.state.status == ContainerStatus::Running
                            && let Ok(sigkill) = LibcontainerSignal::try_from("SIGKILL")
                        {
                            match container.kill(sigkill, true) {
                                Ok(()) => info!("sent SIGKILL to container {id}"),
                                Err(e) => warn!("failed to SIGKILL container {id}: {e}"),
                            }
                        }
                    }
                    Err(e) => debug!("failed to re-check container {id} (may have exited): {e}"),
                }
            }

            match container.delete(true) {
                Ok(()) => info!("removed container {id}"),
                Err(e) => {
                    let msg = e.to_string();
                    if msg.contains("not exist") || msg.contains("No such file") {
                        debug!("container {id} state already gone: {msg}");
                    } else {
                        warn!("failed to remove container {id}: {msg}");
                    }
                }
            }
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod stub {
    use std::path::Path;
    use tracing::warn;

    /// Sweeping containers requires Linux; other targets log and return.
    pub fn stop_and_remove(_runtime_root: &Path, id_prefix: &str) {
        warn!("container sweep ({id_prefix:?}) is only supported on Linux");
    }
}
