//! # Image Archive Reader
//!
//! Turns a `.tar` / `.tar.gz` image archive into an opened [`Image`].
//!
//! Decoding is polymorphic by attempt, not by declared format: the reader
//! first tries the legacy docker-archive layout (embedded `manifest.json`
//! with `RepoTags`), then an OCI archive (an OCI layout at the root or
//! nested under a subdirectory). The first success wins, which tolerates
//! mislabeled files.
//!
//! ## Security Model
//!
//! Tar extraction is a security boundary: a hostile archive can attempt to
//! escape the extraction root. Every entry path - and every hardlink
//! target - is normalised and validated to stay beneath the destination
//! before anything touches the filesystem. Character devices, block
//! devices, and fifos are skipped; they are not needed by pipeline images
//! and may not be creatable without privilege.

use crate::constants::strip_archive_ext;
use crate::error::{Error, Result};
use crate::image::{Image, Layer};
use flate2::read::GzDecoder;
use serde::Deserialize;
use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Component, Path, PathBuf};
use tar::{Archive, EntryType};
use tracing::{debug, warn};

/// Gzip stream magic.
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

// =============================================================================
// Entry Point
// =============================================================================

/// Opens an image archive and returns the image plus its best-effort
/// reference name (a repo tag or a layout ref annotation, when present).
pub fn open_archive(archive_path: &Path) -> Result<(Image, Option<String>)> {
    let (tar_path, _gz_guard) = normalize_archive_to_tar(archive_path)?;

    let scratch = tempfile::Builder::new()
        .prefix("ar-archive-")
        .tempdir()
        .map_err(Error::Io)?;

    let file = File::open(&tar_path).map_err(|e| Error::io_at(&tar_path, e))?;
    extract_tar(BufReader::new(file), scratch.path())?;

    match open_docker_archive(scratch.path(), archive_path) {
        Ok((config_raw, layers, reference)) => {
            let image = Image::from_parts(config_raw, layers, Some(scratch))?;
            return Ok((image, reference));
        }
        Err(e) => debug!("not a docker archive ({e}), trying OCI archive"),
    }

    match open_oci_archive(scratch) {
        Ok(opened) => Ok(opened),
        Err(e) => {
            debug!("not an OCI archive either: {e}");
            Err(Error::UnsupportedArchive {
                path: archive_path.to_path_buf(),
            })
        }
    }
}

/// Normalises an archive to a plain tar file.
///
/// Compression is detected from the gzip magic, never from the suffix: a
/// `.tar.gz` that holds plain tar bytes is used as-is. A genuinely
/// compressed archive is decompressed into a temporary tar whose guard
/// deletes it on drop.
pub fn normalize_archive_to_tar(
    archive_path: &Path,
) -> Result<(PathBuf, Option<tempfile::NamedTempFile>)> {
    let mut file = File::open(archive_path).map_err(|e| Error::io_at(archive_path, e))?;
    let mut magic = [0u8; 2];
    let n = file.read(&mut magic).map_err(|e| Error::io_at(archive_path, e))?;
    if n < 2 || magic != GZIP_MAGIC {
        return Ok((archive_path.to_path_buf(), None));
    }

    let file = File::open(archive_path).map_err(|e| Error::io_at(archive_path, e))?;
    let mut decoder = GzDecoder::new(BufReader::new(file));
    let mut tmp = tempfile::Builder::new()
        .prefix("ar-load-")
        .suffix(".tar")
        .tempfile()
        .map_err(Error::Io)?;
    io::copy(&mut decoder, &mut tmp).map_err(|e| Error::ArchiveMalformed {
        reason: format!("failed to decompress {}: {e}", archive_path.display()),
    })?;

    Ok((tmp.path().to_path_buf(), Some(tmp)))
}

// =============================================================================
// Docker Archive
// =============================================================================

/// One entry of a docker archive's embedded `manifest.json`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DockerManifestEntry {
    config: String,
    #[serde(default)]
    repo_tags: Option<Vec<String>>,
    #[serde(default)]
    layers: Vec<String>,
}

/// Decodes a docker archive that has been extracted to `root`. Returns the
/// raw image config, the ordered layers, and the first repo tag; the caller
/// attaches ownership of the extraction directory.
fn open_docker_archive(
    root: &Path,
    archive_path: &Path,
) -> Result<(Vec<u8>, Vec<Layer>, Option<String>)> {
    let manifest_path = root.join("manifest.json");
    let data = fs::read(&manifest_path).map_err(|e| Error::io_at(&manifest_path, e))?;
    let entries: Vec<DockerManifestEntry> = serde_json::from_slice(&data)?;
    let entry = entries.first().ok_or_else(|| Error::ArchiveMalformed {
        reason: "docker manifest.json is empty".to_string(),
    })?;

    let reference = entry
        .repo_tags
        .as_ref()
        .and_then(|tags| tags.first())
        .filter(|t| !t.trim().is_empty())
        .cloned()
        .or_else(|| {
            archive_path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| strip_archive_ext(n).to_string())
        });

    // Paths inside manifest.json are attacker-controlled; resolve them with
    // the same containment check as tar entries.
    let config_path = safe_join(root, Path::new(&entry.config))?;
    let config_raw = fs::read(&config_path).map_err(|e| Error::io_at(&config_path, e))?;

    let mut layers = Vec::with_capacity(entry.layers.len());
    for layer_rel in &entry.layers {
        let path = safe_join(root, Path::new(layer_rel))?;
        if !path.is_file() {
            return Err(Error::ArchiveMalformed {
                reason: format!("docker archive layer missing: {layer_rel}"),
            });
        }
        layers.push(Layer {
            path,
            media_type: None,
            digest: None,
        });
    }

    Ok((config_raw, layers, reference))
}

// =============================================================================
// OCI Archive
// =============================================================================

/// Decodes an OCI archive that has been extracted into `scratch`: finds the
/// first `index.json` (at the root or any depth) and opens the surrounding
/// layout. The scratch directory's ownership moves into the image handle.
fn open_oci_archive(scratch: tempfile::TempDir) -> Result<(Image, Option<String>)> {
    let layout_root = find_layout_root(scratch.path())?.ok_or_else(|| Error::ArchiveMalformed {
        reason: "no OCI layout (index.json) found in archive".to_string(),
    })?;
    Image::open_layout_owned(&layout_root, scratch)
}

/// Walks the extracted tree for the first directory holding an
/// `index.json`. The root itself wins over nested layouts.
fn find_layout_root(root: &Path) -> Result<Option<PathBuf>> {
    let mut queue = vec![root.to_path_buf()];
    while let Some(dir) = queue.pop() {
        if dir.join("index.json").is_file() {
            return Ok(Some(dir));
        }
        let entries = fs::read_dir(&dir).map_err(|e| Error::io_at(&dir, e))?;
        for entry in entries {
            let entry = entry.map_err(Error::Io)?;
            if entry.path().is_dir() {
                queue.push(entry.path());
            }
        }
    }
    Ok(None)
}

// =============================================================================
// Safe Tar Extraction
// =============================================================================

/// Applies a tar stream beneath `dest`, rejecting every entry whose path
/// (or hardlink target) would land outside it.
pub fn extract_tar(reader: impl Read, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest).map_err(|e| Error::io_at(dest, e))?;

    let mut archive = Archive::new(reader);
    for entry in archive.entries().map_err(|e| Error::ArchiveMalformed {
        reason: format!("unreadable tar stream: {e}"),
    })? {
        let mut entry = entry.map_err(|e| Error::ArchiveMalformed {
            reason: format!("unreadable tar entry: {e}"),
        })?;

        let entry_path = entry.path().map_err(|e| Error::ArchiveMalformed {
            reason: format!("undecodable tar entry path: {e}"),
        })?;
        let entry_path = entry_path.into_owned();
        let target = safe_join(dest, &entry_path)?;

        match entry.header().entry_type() {
            EntryType::Directory => {
                fs::create_dir_all(&target).map_err(|e| Error::io_at(&target, e))?;
                set_mode(&target, entry.header().mode().ok());
            }
            EntryType::Regular | EntryType::Continuous | EntryType::GNUSparse => {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent).map_err(|e| Error::io_at(parent, e))?;
                }
                let mut out = File::create(&target).map_err(|e| Error::io_at(&target, e))?;
                io::copy(&mut entry, &mut out).map_err(|e| Error::io_at(&target, e))?;
                set_mode(&target, entry.header().mode().ok());
            }
            EntryType::Symlink => {
                let link = entry
                    .link_name()
                    .map_err(|e| Error::ArchiveMalformed {
                        reason: format!("undecodable symlink target: {e}"),
                    })?
                    .ok_or_else(|| Error::ArchiveMalformed {
                        reason: format!("symlink without target: {}", entry_path.display()),
                    })?;
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent).map_err(|e| Error::io_at(parent, e))?;
                }
                let _ = fs::remove_file(&target);
                let _ = fs::remove_dir_all(&target);
                make_symlink(&link, &target)?;
            }
            EntryType::Link => {
                let link = entry
                    .link_name()
                    .map_err(|e| Error::ArchiveMalformed {
                        reason: format!("undecodable hardlink target: {e}"),
                    })?
                    .ok_or_else(|| Error::ArchiveMalformed {
                        reason: format!("hardlink without target: {}", entry_path.display()),
                    })?;
                // Hardlink targets resolve relative to the entry's directory
                // and must also stay inside the destination.
                let resolved = entry_path
                    .parent()
                    .unwrap_or_else(|| Path::new(""))
                    .join(&link);
                let link_target = safe_join(dest, &resolved)?;
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent).map_err(|e| Error::io_at(parent, e))?;
                }
                let _ = fs::remove_file(&target);
                fs::hard_link(&link_target, &target).map_err(|e| Error::io_at(&target, e))?;
            }
            EntryType::Char | EntryType::Block | EntryType::Fifo => {
                // Not creatable without privilege and not needed by
                // pipeline images.
                debug!("skipping device/fifo tar entry: {}", entry_path.display());
            }
            other => {
                debug!(
                    "skipping tar entry {} with type {:?}",
                    entry_path.display(),
                    other
                );
            }
        }
    }

    Ok(())
}

/// Joins a tar entry path beneath `root`, rejecting absolute paths and any
/// `..` sequence that would climb out of it.
pub fn safe_join(root: &Path, entry: &Path) -> Result<PathBuf> {
    let mut stack: Vec<std::ffi::OsString> = Vec::new();
    for component in entry.components() {
        match component {
            Component::Normal(part) => stack.push(part.to_os_string()),
            Component::CurDir => {}
            // A leading `/` is tolerated by re-rooting, same as stripping it.
            Component::RootDir | Component::Prefix(_) => {}
            Component::ParentDir => {
                if stack.pop().is_none() {
                    return Err(Error::PathTraversal {
                        path: entry.display().to_string(),
                    });
                }
            }
        }
    }
    let mut target = root.to_path_buf();
    for part in stack {
        target.push(part);
    }
    Ok(target)
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: Option<u32>) {
    use std::os::unix::fs::PermissionsExt;
    if let Some(mode) = mode
        && let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777))
    {
        warn!("failed to set mode on {}: {e}", path.display());
    }
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: Option<u32>) {}

#[cfg(unix)]
fn make_symlink(link: &Path, target: &Path) -> Result<()> {
    std::os::unix::fs::symlink(link, target).map_err(|e| Error::io_at(target, e))
}

#[cfg(not(unix))]
fn make_symlink(link: &Path, target: &Path) -> Result<()> {
    warn!(
        "skipping symlink {} -> {} on non-unix platform",
        target.display(),
        link.display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_join_keeps_paths_under_root() {
        let root = Path::new("/extract");
        assert_eq!(
            safe_join(root, Path::new("etc/passwd")).unwrap(),
            PathBuf::from("/extract/etc/passwd")
        );
        assert_eq!(
            safe_join(root, Path::new("/abs/path")).unwrap(),
            PathBuf::from("/extract/abs/path")
        );
        assert_eq!(
            safe_join(root, Path::new("a/./b/../c")).unwrap(),
            PathBuf::from("/extract/a/c")
        );
    }

    #[test]
    fn safe_join_rejects_escapes() {
        let root = Path::new("/extract");
        assert!(safe_join(root, Path::new("../evil")).is_err());
        assert!(safe_join(root, Path::new("a/../../evil")).is_err());
    }
}
