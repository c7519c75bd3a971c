//! Caller-supplied directory roots.
//!
//! Every component receives the paths it needs through its constructor;
//! nothing in the core reads a global. The binary populates this struct
//! from CLI flags.

use std::path::{Path, PathBuf};

/// Directory roots the pipeline core operates on.
#[derive(Debug, Clone)]
pub struct Paths {
    /// Directory holding `<name>.template.json` pipeline templates.
    pub pipelines_dir: PathBuf,
    /// Directory holding locally materialised images (one OCI layout each).
    pub images_store_dir: PathBuf,
    /// Scratch root for loader work directories.
    pub load_tmp_root: PathBuf,
    /// OCI runtime state root (same meaning as `runc --root`).
    pub runtime_state_root: PathBuf,
    /// Directory holding `node_<ip>.json` node descriptors.
    pub nodes_dir: PathBuf,
}

impl Paths {
    /// Conventional layout under an arbitrary root. Used by tests and by
    /// rootless deployments that cannot write `/var/lib`.
    pub fn under(root: &Path) -> Self {
        Self {
            pipelines_dir: root.join("pipelines"),
            images_store_dir: root.join("images"),
            load_tmp_root: root.join("tmp"),
            runtime_state_root: root.join("runc"),
            nodes_dir: root.join("nodes"),
        }
    }

    /// The pipeline run root: parent of the pipelines dir. Run directories
    /// live at `<ar_root>/<sanitised_pipeline>/<task_id>/`.
    pub fn ar_root(&self) -> PathBuf {
        self.pipelines_dir
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.pipelines_dir.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ar_root_is_parent_of_pipelines_dir() {
        let paths = Paths::under(Path::new("/var/lib/ar"));
        assert_eq!(paths.ar_root(), PathBuf::from("/var/lib/ar"));
        assert_eq!(paths.pipelines_dir, PathBuf::from("/var/lib/ar/pipelines"));
    }
}
