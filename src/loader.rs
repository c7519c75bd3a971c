//! # Pipeline Loader
//!
//! Installs a pipeline onto the host by running the pipeline image's own
//! self-install container: the image's `/entrypoint.sh` copies its
//! template(s) into the bind-mounted `/pipelines` and drops its child
//! image archives into `/images`. The loader supplies generic machinery
//! only - unpack the rootfs, build a loader-role bundle, run it once, and
//! re-ingest whatever landed in the scratch images directory into the
//! image store.

use crate::archive::open_archive;
use crate::bundle::{self, BundleRole};
use crate::config::Paths;
use crate::constants::{is_archive_file, strip_archive_ext, CONTAINER_ID_PREFIX};
use crate::driver;
use crate::error::{Error, Result};
use crate::image::Image;
use crate::rootfs::extract_rootfs;
use crate::store::{sanitize_image_name, ImageStore};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Loads pipeline images and re-ingests the child images they emit.
#[derive(Debug, Clone)]
pub struct Loader {
    pipelines_dir: PathBuf,
    store: ImageStore,
    tmp_root: PathBuf,
    runtime_root: PathBuf,
}

impl Loader {
    pub fn new(paths: &Paths) -> Self {
        Self {
            pipelines_dir: paths.pipelines_dir.clone(),
            store: ImageStore::new(&paths.images_store_dir),
            tmp_root: paths.load_tmp_root.clone(),
            runtime_root: paths.runtime_state_root.clone(),
        }
    }

    /// Loads a pipeline image from a `.tar` / `.tar.gz` archive.
    pub async fn load_from_archive(
        &self,
        archive_path: &Path,
        clean_tmp: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let (image, reference) = open_archive(archive_path)?;
        // A reference that sanitises away entirely is useless for naming
        // the work dir; the archive basename takes over.
        let reference = reference.filter(|r| !sanitize_image_name(r).is_empty());
        let fallback = archive_path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| strip_archive_ext(n).to_string());
        self.load_image(image, reference.or(fallback), clean_tmp, cancel)
            .await
    }

    /// Loads a pipeline image already present in the image store.
    pub async fn load_from_store(
        &self,
        name_or_ref: &str,
        clean_tmp: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let (image, entry) = self.store.open_with_entry(name_or_ref)?;
        self.load_image(image, Some(entry.reference), clean_tmp, cancel)
            .await
    }

    async fn load_image(
        &self,
        image: Image,
        reference: Option<String>,
        clean_tmp: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut image_name = reference
            .as_deref()
            .map(sanitize_image_name)
            .unwrap_or_default();
        if image_name.is_empty() {
            image_name = "pipeline".to_string();
        }

        let work_root = self.tmp_root.join(&image_name);
        let bundle_dir = work_root.join("bundle");
        let rootfs_dir = bundle_dir.join("rootfs");
        let scratch_images_dir = work_root.join("images");

        if work_root.exists() {
            fs::remove_dir_all(&work_root).map_err(|e| Error::io_at(&work_root, e))?;
        }
        let store_root = self.store.root().to_path_buf();
        for dir in [&self.pipelines_dir, &store_root, &rootfs_dir, &scratch_images_dir] {
            fs::create_dir_all(dir).map_err(|e| Error::io_at(dir, e))?;
        }

        info!("unpacking pipeline image rootfs into {}", rootfs_dir.display());
        extract_rootfs(&image, &rootfs_dir)?;
        verify_entrypoint(&image, &rootfs_dir)?;

        info!("writing loader bundle config {}/config.json", bundle_dir.display());
        bundle::write_bundle_config(
            &bundle_dir,
            &image,
            BundleRole::Load {
                pipelines_dir: &self.pipelines_dir,
                images_dir: &scratch_images_dir,
            },
            None,
        )?;

        let container_id = load_container_id();
        info!("running pipeline self-install container {container_id}");
        driver::run_one_shot(
            &self.runtime_root,
            &bundle_dir,
            &container_id,
            Box::new(std::io::sink()),
            Box::new(std::io::sink()),
            cancel,
        )
        .await?;

        info!(
            "self-install finished, importing child images from {}",
            scratch_images_dir.display()
        );
        let imported = self.import_child_images(&scratch_images_dir)?;

        fs::remove_dir_all(&scratch_images_dir)
            .map_err(|e| Error::io_at(&scratch_images_dir, e))?;
        if clean_tmp {
            if let Err(e) = fs::remove_dir_all(&work_root) {
                warn!("failed to clean work dir {}: {e}", work_root.display());
            }
        }

        info!("pipeline loaded: image={image_name} child_images={imported}");
        Ok(())
    }

    /// Imports every archive beneath the scratch images dir into the
    /// store. Archives are visited in sorted path order for determinism.
    fn import_child_images(&self, images_dir: &Path) -> Result<usize> {
        let archives = collect_archives(images_dir)?;
        if archives.is_empty() {
            info!("no child images emitted under {}", images_dir.display());
            return Ok(0);
        }

        let mut imported = 0;
        for archive in archives {
            let (image, reference) = open_archive(&archive)?;
            let reference = reference
                .filter(|r| !r.trim().is_empty())
                .or_else(|| {
                    archive
                        .file_name()
                        .and_then(|n| n.to_str())
                        .map(|n| strip_archive_ext(n).to_string())
                })
                .unwrap_or_else(|| "image".to_string());
            let dest = self.store.write(&image, &reference)?;
            info!("imported child image {} -> {}", archive.display(), dest.display());
            imported += 1;
        }
        Ok(imported)
    }
}

/// Container id of a load run: `ar_load_<unix-nanos>`.
fn load_container_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    format!("{CONTAINER_ID_PREFIX}load_{nanos}")
}

/// The resolved entrypoint must exist in the rootfs as a non-directory;
/// anything else means the pipeline image was built wrong, and the message
/// says so instead of letting the runtime fail obscurely.
fn verify_entrypoint(image: &Image, rootfs_dir: &Path) -> Result<()> {
    let args = bundle::resolve_process_args(image, None)?;
    let entry = if args[0] == "/bin/sh" && args.len() > 1 {
        args[1].as_str()
    } else {
        args[0].as_str()
    };
    if !entry.starts_with('/') {
        // PATH-relative commands cannot be checked without replicating the
        // container's PATH search.
        return Ok(());
    }
    let target = rootfs_dir.join(entry.trim_start_matches('/'));
    if !target.is_file() {
        return Err(Error::RootfsDefect {
            reason: format!(
                "entrypoint {entry} is missing from the image rootfs; \
                 rebuild the pipeline image so it ships its entrypoint"
            ),
        });
    }
    Ok(())
}

/// Recursively collects `.tar` / `.tar.gz` / `.tgz` files, sorted by path.
fn collect_archives(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut archives = Vec::new();
    let mut queue = vec![dir.to_path_buf()];
    while let Some(current) = queue.pop() {
        let entries = fs::read_dir(&current).map_err(|e| Error::io_at(&current, e))?;
        for entry in entries {
            let entry = entry.map_err(Error::Io)?;
            let path = entry.path();
            if path.is_dir() {
                queue.push(path);
            } else if let Some(name) = path.file_name().and_then(|n| n.to_str())
                && is_archive_file(name)
            {
                archives.push(path);
            }
        }
    }
    archives.sort();
    Ok(archives)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collect_archives_recurses_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("nested")).unwrap();
        fs::write(dir.path().join("b.tar"), b"x").unwrap();
        fs::write(dir.path().join("nested/a.tar.gz"), b"x").unwrap();
        fs::write(dir.path().join("readme.txt"), b"x").unwrap();

        let archives = collect_archives(dir.path()).unwrap();
        let names: Vec<_> = archives
            .iter()
            .map(|p| p.strip_prefix(dir.path()).unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, ["b.tar", "nested/a.tar.gz"]);
    }

    #[test]
    fn load_container_ids_carry_the_prefix() {
        let id = load_container_id();
        assert!(id.starts_with("ar_load_"));
    }
}
