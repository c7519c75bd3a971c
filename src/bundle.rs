//! # OCI Runtime Bundle Building
//!
//! Emits the `config.json` of an OCI runtime bundle from an image's config
//! plus the role-specific mount policy. The rootfs itself is produced by
//! [`crate::rootfs::extract_rootfs`]; this module only writes the spec
//! document next to it.
//!
//! ## Roles
//!
//! | Role | Hostname | Bind mounts |
//! |------|----------|-------------|
//! | [`BundleRole::Load`] | `ar-load` | pipelines dir -> `/pipelines`, scratch images dir -> `/images` |
//! | [`BundleRole::Run`]  | `ar-run`  | run dir -> `/tasks`, step node dir -> `/current-task` |
//!
//! Both roles share the conventional unprivileged mount set (`/proc`,
//! tmpfs `/dev`, devpts, shm, mqueue, read-only sysfs), the pid/ipc/uts/
//! mount/network namespaces, and the usual masked and read-only proc
//! paths. The rootless user namespace is not baked into the bundle; the
//! driver applies [`apply_rootless`] at run time when the effective user
//! is not root.

use crate::constants::{DEFAULT_PATH_ENV, LOAD_HOSTNAME, OCI_RUNTIME_SPEC_VERSION, RUN_HOSTNAME};
use crate::error::{Error, Result};
use crate::image::Image;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

// =============================================================================
// OCI Runtime Spec Types
// =============================================================================

/// OCI runtime spec document (`config.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeSpec {
    pub oci_version: String,
    pub process: SpecProcess,
    pub root: SpecRoot,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default)]
    pub mounts: Vec<SpecMount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linux: Option<LinuxSpec>,
}

/// Process section of the runtime spec.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpecProcess {
    #[serde(default)]
    pub terminal: bool,
    #[serde(default)]
    pub user: SpecUser,
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub cwd: String,
    #[serde(default)]
    pub no_new_privileges: bool,
}

/// Process user identity inside the container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpecUser {
    pub uid: u32,
    pub gid: u32,
}

/// Root filesystem section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpecRoot {
    pub path: String,
    #[serde(default)]
    pub readonly: bool,
}

/// One mount entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpecMount {
    pub destination: String,
    #[serde(rename = "type")]
    pub mount_type: String,
    pub source: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

/// Linux-specific section: namespaces, id mappings, masked paths.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinuxSpec {
    #[serde(default)]
    pub namespaces: Vec<SpecNamespace>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub uid_mappings: Vec<IdMapping>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gid_mappings: Vec<IdMapping>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub masked_paths: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub readonly_paths: Vec<String>,
}

/// One namespace entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpecNamespace {
    #[serde(rename = "type")]
    pub ns_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// One uid/gid mapping entry of a user namespace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdMapping {
    #[serde(rename = "containerID")]
    pub container_id: u32,
    #[serde(rename = "hostID")]
    pub host_id: u32,
    pub size: u32,
}

// =============================================================================
// Bundle Builder
// =============================================================================

/// The role a bundle is built for; decides hostname and bind mounts.
#[derive(Debug, Clone, Copy)]
pub enum BundleRole<'a> {
    /// The loader's self-install container.
    Load {
        pipelines_dir: &'a Path,
        images_dir: &'a Path,
    },
    /// One pipeline step container.
    Run {
        run_dir: &'a Path,
        node_dir: &'a Path,
    },
}

impl BundleRole<'_> {
    fn hostname(&self) -> &'static str {
        match self {
            Self::Load { .. } => LOAD_HOSTNAME,
            Self::Run { .. } => RUN_HOSTNAME,
        }
    }

    fn bind_mounts(&self) -> Vec<SpecMount> {
        let rbind_rw = vec!["rbind".to_string(), "rw".to_string()];
        match self {
            Self::Load {
                pipelines_dir,
                images_dir,
            } => vec![
                bind_mount("/pipelines", pipelines_dir, rbind_rw.clone()),
                bind_mount("/images", images_dir, rbind_rw),
            ],
            Self::Run { run_dir, node_dir } => vec![
                bind_mount("/tasks", run_dir, rbind_rw.clone()),
                bind_mount("/current-task", node_dir, rbind_rw),
            ],
        }
    }
}

/// Step-level overrides of the image's process config (already rendered).
#[derive(Debug, Clone, Default)]
pub struct StepProcess<'a> {
    pub entrypoint: Option<&'a str>,
    pub args: &'a [String],
    pub env: &'a [String],
}

/// Resolves the container argv from a step override and the image config:
/// override entrypoint plus step args, falling back to the image's
/// entrypoint plus command. An empty result is an error. The `/bin/sh`
/// prepend for shell-script entrypoints guards against shebang and CRLF
/// damage in hand-authored images.
pub fn resolve_process_args(image: &Image, step: Option<&StepProcess>) -> Result<Vec<String>> {
    let cfg = image.process_config();

    let mut args: Vec<String> = Vec::new();
    if let Some(step) = step {
        if let Some(entrypoint) = step.entrypoint
            && !entrypoint.trim().is_empty()
        {
            args.push(entrypoint.to_string());
        }
        args.extend(step.args.iter().cloned());
    }
    if args.is_empty() {
        args.extend(cfg.entrypoint.clone().unwrap_or_default());
        args.extend(cfg.cmd.clone().unwrap_or_default());
    }
    if args.is_empty() {
        return Err(Error::InvalidInput(
            "no entrypoint or args resolved; the image has neither entrypoint nor cmd".into(),
        ));
    }

    if args[0] == "/entrypoint.sh" || args[0].ends_with(".sh") {
        args.insert(0, "/bin/sh".to_string());
    }
    Ok(args)
}

/// Builds the runtime spec document for a bundle whose `rootfs/` already
/// exists, and writes it to `<bundle_dir>/config.json`.
pub fn write_bundle_config(
    bundle_dir: &Path,
    image: &Image,
    role: BundleRole<'_>,
    step: Option<&StepProcess>,
) -> Result<()> {
    fs::create_dir_all(bundle_dir).map_err(|e| Error::io_at(bundle_dir, e))?;

    let args = resolve_process_args(image, step)?;
    if args[0] == "/bin/sh" && !bundle_dir.join("rootfs/bin/sh").exists() {
        return Err(Error::RootfsDefect {
            reason: format!(
                "argv resolves through /bin/sh but {}/rootfs/bin/sh does not exist; \
                 the pipeline image is malformed",
                bundle_dir.display()
            ),
        });
    }

    let cfg = image.process_config();
    let mut env: Vec<String> = match step {
        Some(step) => step.env.to_vec(),
        None => cfg.env.clone().unwrap_or_default(),
    };
    if !env.iter().any(|e| e.starts_with("PATH=")) {
        env.push(DEFAULT_PATH_ENV.to_string());
    }

    let cwd = cfg
        .working_dir
        .as_deref()
        .filter(|d| !d.trim().is_empty())
        .unwrap_or("/")
        .to_string();

    let mut mounts = base_mounts();
    mounts.extend(role.bind_mounts());

    let spec = RuntimeSpec {
        oci_version: OCI_RUNTIME_SPEC_VERSION.to_string(),
        process: SpecProcess {
            terminal: false,
            user: SpecUser::default(),
            args,
            env,
            cwd,
            no_new_privileges: true,
        },
        root: SpecRoot {
            path: "rootfs".to_string(),
            readonly: false,
        },
        hostname: Some(role.hostname().to_string()),
        mounts,
        linux: Some(LinuxSpec {
            namespaces: ["pid", "ipc", "uts", "mount", "network"]
                .into_iter()
                .map(|ns| SpecNamespace {
                    ns_type: ns.to_string(),
                    path: None,
                })
                .collect(),
            uid_mappings: Vec::new(),
            gid_mappings: Vec::new(),
            masked_paths: MASKED_PATHS.iter().map(|p| p.to_string()).collect(),
            readonly_paths: READONLY_PATHS.iter().map(|p| p.to_string()).collect(),
        }),
    };

    let bytes = serde_json::to_vec_pretty(&spec)?;
    let config_path = bundle_dir.join("config.json");
    fs::write(&config_path, bytes).map_err(|e| Error::io_at(&config_path, e))?;
    Ok(())
}

/// Adapts a spec for rootless execution: a user namespace is prepended and
/// singleton uid/gid mappings map the container process identity onto the
/// host's effective ids.
pub fn apply_rootless(spec: &mut RuntimeSpec, host_uid: u32, host_gid: u32) {
    let linux = spec.linux.get_or_insert_with(LinuxSpec::default);
    if !linux.namespaces.iter().any(|ns| ns.ns_type == "user") {
        linux.namespaces.insert(
            0,
            SpecNamespace {
                ns_type: "user".to_string(),
                path: None,
            },
        );
    }
    linux.uid_mappings = vec![IdMapping {
        container_id: spec.process.user.uid,
        host_id: host_uid,
        size: 1,
    }];
    linux.gid_mappings = vec![IdMapping {
        container_id: spec.process.user.gid,
        host_id: host_gid,
        size: 1,
    }];
}

fn bind_mount(destination: &str, source: &Path, options: Vec<String>) -> SpecMount {
    SpecMount {
        destination: destination.to_string(),
        mount_type: "bind".to_string(),
        source: source.display().to_string(),
        options,
    }
}

fn base_mounts() -> Vec<SpecMount> {
    vec![
        SpecMount {
            destination: "/proc".to_string(),
            mount_type: "proc".to_string(),
            source: "proc".to_string(),
            options: Vec::new(),
        },
        SpecMount {
            destination: "/dev".to_string(),
            mount_type: "tmpfs".to_string(),
            source: "tmpfs".to_string(),
            options: str_opts(&["nosuid", "strictatime", "mode=755", "size=65536k"]),
        },
        SpecMount {
            destination: "/dev/pts".to_string(),
            mount_type: "devpts".to_string(),
            source: "devpts".to_string(),
            options: str_opts(&["nosuid", "noexec", "newinstance", "ptmxmode=0666", "mode=0620"]),
        },
        SpecMount {
            destination: "/dev/shm".to_string(),
            mount_type: "tmpfs".to_string(),
            source: "shm".to_string(),
            options: str_opts(&["nosuid", "noexec", "nodev", "mode=1777", "size=65536k"]),
        },
        SpecMount {
            destination: "/dev/mqueue".to_string(),
            mount_type: "mqueue".to_string(),
            source: "mqueue".to_string(),
            options: str_opts(&["nosuid", "noexec", "nodev"]),
        },
        SpecMount {
            destination: "/sys".to_string(),
            mount_type: "sysfs".to_string(),
            source: "sysfs".to_string(),
            options: str_opts(&["nosuid", "noexec", "nodev", "ro"]),
        },
    ]
}

const MASKED_PATHS: &[&str] = &[
    "/proc/acpi",
    "/proc/asound",
    "/proc/kcore",
    "/proc/keys",
    "/proc/latency_stats",
    "/proc/timer_list",
    "/proc/timer_stats",
    "/proc/sched_debug",
    "/sys/firmware",
    "/proc/scsi",
];

const READONLY_PATHS: &[&str] = &[
    "/proc/bus",
    "/proc/fs",
    "/proc/irq",
    "/proc/sys",
    "/proc/sysrq-trigger",
];

fn str_opts(opts: &[&str]) -> Vec<String> {
    opts.iter().map(|o| o.to_string()).collect()
}
