//! # Image Store
//!
//! Catalogue of locally materialised images. Each image is one directory
//! under the store root, named by the sanitised form of its original
//! reference and containing a complete OCI layout. The original reference
//! is preserved as the `org.opencontainers.image.ref.name` annotation on
//! the index's manifest descriptor, so `list` can report both names.
//!
//! Blob writes go through a unique temp file plus rename, so a crashed
//! write never leaves a half-blob under its final name.

use crate::constants::{
    OCI_IMAGE_CONFIG_MEDIA_TYPE, OCI_IMAGE_LAYOUT_VERSION, OCI_IMAGE_MANIFEST_MEDIA_TYPE,
    OCI_LAYER_MEDIA_TYPE_GZIP, OCI_LAYER_MEDIA_TYPE_TAR, OCI_REF_NAME_ANNOTATION,
    TEMPLATE_SUFFIX,
};
use crate::error::{Error, Result};
use crate::image::{Descriptor, Image, ImageIndex, ImageManifest, Layer};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

// =============================================================================
// Name Sanitisation
// =============================================================================

/// Sanitises an image reference into a filesystem-safe store name.
///
/// A digest suffix (after `@`) and a tag suffix (after the last `:` past
/// the last `/`) are dropped first; `/ : @` and spaces become `_`, any
/// other byte outside `[A-Za-z0-9_.-]` becomes `_`, and leading/trailing
/// `._-` are trimmed. Idempotent.
pub fn sanitize_image_name(raw: &str) -> String {
    let mut value = raw.trim();
    if let Some(at) = value.find('@')
        && at > 0
    {
        value = &value[..at];
    }
    if let Some(colon) = value.rfind(':') {
        let last_slash = value.rfind('/').map(|i| i as isize).unwrap_or(-1);
        if colon as isize > last_slash {
            value = &value[..colon];
        }
    }

    let replaced: String = value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    replaced.trim_matches(['.', '_', '-']).to_string()
}

/// Sanitises a pipeline name: disallowed characters are dropped (not
/// substituted) and leading/trailing `._-` trimmed.
pub fn sanitize_pipeline_name(raw: &str) -> String {
    let kept: String = raw
        .trim()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        .collect();
    kept.trim_matches(['.', '_', '-']).to_string()
}

// =============================================================================
// Store
// =============================================================================

/// One catalogued image.
#[derive(Debug, Clone)]
pub struct ImageEntry {
    /// Store directory name (the sanitised reference).
    pub name: String,
    /// Original reference from the layout annotation, falling back to the
    /// directory name when the annotation is absent.
    pub reference: String,
    /// Full path of the layout directory.
    pub path: PathBuf,
}

/// Filesystem-backed image catalogue.
#[derive(Debug, Clone)]
pub struct ImageStore {
    store_dir: PathBuf,
}

impl ImageStore {
    pub fn new(store_dir: impl Into<PathBuf>) -> Self {
        Self {
            store_dir: store_dir.into(),
        }
    }

    /// The store root directory.
    pub fn root(&self) -> &Path {
        &self.store_dir
    }

    /// Writes an image into the store as a fresh OCI layout, clearing any
    /// previous directory of the same name. Returns the layout path.
    pub fn write(&self, image: &Image, reference: &str) -> Result<PathBuf> {
        let mut name = sanitize_image_name(reference);
        if name.is_empty() {
            name = "image".to_string();
        }
        let dest = self.store_dir.join(&name);

        if dest.exists() {
            fs::remove_dir_all(&dest).map_err(|e| Error::io_at(&dest, e))?;
        }
        let blobs_dir = dest.join("blobs").join("sha256");
        fs::create_dir_all(&blobs_dir).map_err(|e| Error::io_at(&blobs_dir, e))?;
        fs::write(
            dest.join("oci-layout"),
            format!("{{\"imageLayoutVersion\":\"{OCI_IMAGE_LAYOUT_VERSION}\"}}"),
        )
        .map_err(|e| Error::io_at(&dest, e))?;

        // Config blob, byte-exact from the source.
        let (config_digest, config_size) = write_blob(&dest, image.config_raw())?;
        let config_desc = Descriptor {
            media_type: OCI_IMAGE_CONFIG_MEDIA_TYPE.to_string(),
            digest: config_digest,
            size: config_size,
            annotations: BTreeMap::new(),
        };

        let mut layer_descs = Vec::with_capacity(image.layers().len());
        for layer in image.layers() {
            layer_descs.push(copy_layer_blob(&dest, layer)?);
        }

        let manifest = ImageManifest {
            schema_version: 2,
            media_type: Some(OCI_IMAGE_MANIFEST_MEDIA_TYPE.to_string()),
            config: config_desc,
            layers: layer_descs,
            annotations: BTreeMap::new(),
        };
        let manifest_bytes = serde_json::to_vec(&manifest)?;
        let (manifest_digest, manifest_size) = write_blob(&dest, &manifest_bytes)?;

        let mut annotations = BTreeMap::new();
        if !reference.trim().is_empty() {
            annotations.insert(OCI_REF_NAME_ANNOTATION.to_string(), reference.to_string());
        }
        let index = ImageIndex {
            schema_version: 2,
            media_type: None,
            manifests: vec![Descriptor {
                media_type: OCI_IMAGE_MANIFEST_MEDIA_TYPE.to_string(),
                digest: manifest_digest,
                size: manifest_size,
                annotations,
            }],
            annotations: BTreeMap::new(),
        };
        let index_bytes = serde_json::to_vec_pretty(&index)?;
        fs::write(dest.join("index.json"), index_bytes).map_err(|e| Error::io_at(&dest, e))?;

        info!("stored image {} -> {}", reference, dest.display());
        Ok(dest)
    }

    /// Enumerates catalogued images. Malformed directories are skipped, not
    /// reported as errors.
    pub fn list(&self) -> Result<Vec<ImageEntry>> {
        let mut entries = Vec::new();
        let dir = match fs::read_dir(&self.store_dir) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
            Err(e) => return Err(Error::io_at(&self.store_dir, e)),
        };

        for entry in dir {
            let entry = entry.map_err(Error::Io)?;
            if !entry.path().is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            let path = entry.path();
            let reference = match read_ref_annotation(&path) {
                Ok(r) => r.unwrap_or_else(|| name.clone()),
                Err(_) => continue,
            };
            entries.push(ImageEntry {
                name,
                reference,
                path,
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    /// Opens an image by store name, original reference, or raw name.
    pub fn open(&self, name_or_ref: &str) -> Result<Image> {
        let entry = self.find(name_or_ref)?;
        let (image, _) = Image::open_layout(&entry.path)?;
        Ok(image)
    }

    /// Like [`ImageStore::open`] but also returns the catalogue entry.
    pub fn open_with_entry(&self, name_or_ref: &str) -> Result<(Image, ImageEntry)> {
        let entry = self.find(name_or_ref)?;
        let (image, _) = Image::open_layout(&entry.path)?;
        Ok((image, entry))
    }

    fn find(&self, name_or_ref: &str) -> Result<ImageEntry> {
        let safe = sanitize_image_name(name_or_ref);
        self.list()?
            .into_iter()
            .find(|e| {
                e.name == name_or_ref
                    || e.reference == name_or_ref
                    || (!safe.is_empty() && e.name == safe)
            })
            .ok_or_else(|| Error::ImageNotFound(name_or_ref.to_string()))
    }

    /// Deletes an image directory by store name (sanitised first, raw as a
    /// fallback).
    pub fn delete(&self, name: &str) -> Result<()> {
        if name.trim().is_empty() {
            return Err(Error::InvalidInput("image name must not be empty".into()));
        }
        let safe = sanitize_image_name(name);
        let mut path = self
            .store_dir
            .join(if safe.is_empty() { name } else { safe.as_str() });
        if !path.exists() {
            path = self.store_dir.join(name);
        }
        if !path.exists() {
            return Err(Error::ImageNotFound(name.to_string()));
        }
        fs::remove_dir_all(&path).map_err(|e| Error::io_at(&path, e))?;
        Ok(())
    }

    /// Deletes every image whose store name and reference are both absent
    /// from `referenced`. Returns the removed names.
    pub fn prune(&self, referenced: &HashSet<String>) -> Result<Vec<String>> {
        let mut pruned = Vec::new();
        for entry in self.list()? {
            if referenced.contains(&entry.name) || referenced.contains(&entry.reference) {
                continue;
            }
            fs::remove_dir_all(&entry.path).map_err(|e| Error::io_at(&entry.path, e))?;
            pruned.push(entry.name);
        }
        Ok(pruned)
    }

    /// Deletes every catalogued image. Returns the removed names.
    pub fn prune_all(&self) -> Result<Vec<String>> {
        let mut pruned = Vec::new();
        for entry in self.list()? {
            fs::remove_dir_all(&entry.path).map_err(|e| Error::io_at(&entry.path, e))?;
            pruned.push(entry.name);
        }
        Ok(pruned)
    }
}

/// Collects the image names referenced by every `*.template.json` under the
/// pipelines dir, in both raw and sanitised form. Unreadable or malformed
/// templates are skipped.
pub fn referenced_image_names(pipelines_dir: &Path) -> Result<HashSet<String>> {
    #[derive(Deserialize)]
    struct StepImage {
        #[serde(default)]
        image: String,
    }

    let mut refs = HashSet::new();
    let dir = match fs::read_dir(pipelines_dir) {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(refs),
        Err(e) => return Err(Error::io_at(pipelines_dir, e)),
    };

    for entry in dir {
        let entry = entry.map_err(Error::Io)?;
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if path.is_dir() || !name.ends_with(TEMPLATE_SUFFIX) {
            continue;
        }
        let Ok(data) = fs::read(&path) else { continue };
        let Ok(steps) = serde_json::from_slice::<Vec<StepImage>>(&data) else {
            continue;
        };
        for step in steps {
            let image = step.image.trim();
            if image.is_empty() {
                continue;
            }
            let safe = sanitize_image_name(image);
            if !safe.is_empty() {
                refs.insert(safe);
            }
            refs.insert(image.to_string());
        }
    }
    Ok(refs)
}

// =============================================================================
// Blob Writing
// =============================================================================

/// Writes a blob from memory; returns `(digest, size)`.
fn write_blob(layout_root: &Path, data: &[u8]) -> Result<(String, u64)> {
    let digest = format!("sha256:{}", hex::encode(Sha256::digest(data)));
    let path = crate::image::blob_path(layout_root, &digest)?;
    if !path.exists() {
        atomic_write(&path, |file| file.write_all(data))?;
    }
    Ok((digest, data.len() as u64))
}

/// Streams a layer blob into the layout, hashing while copying, and returns
/// its manifest descriptor. The media type is taken from the source layer
/// or sniffed from the gzip magic for docker-archive layers.
fn copy_layer_blob(layout_root: &Path, layer: &Layer) -> Result<Descriptor> {
    let mut src = layer.open_raw()?;

    let mut magic = [0u8; 2];
    let n = src.read(&mut magic).map_err(|e| Error::io_at(&layer.path, e))?;
    let gzipped = n == 2 && magic == [0x1f, 0x8b];
    let mut src = layer.open_raw()?;

    let mut hasher = Sha256::new();
    let mut size = 0u64;
    let tmp_name = format!("tmp.{}", uuid::Uuid::now_v7());
    let blobs_dir = layout_root.join("blobs").join("sha256");
    let tmp_path = blobs_dir.join(tmp_name);
    {
        let mut out = File::create(&tmp_path).map_err(|e| Error::io_at(&tmp_path, e))?;
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = src.read(&mut buf).map_err(|e| Error::io_at(&layer.path, e))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            out.write_all(&buf[..n]).map_err(|e| Error::io_at(&tmp_path, e))?;
            size += n as u64;
        }
    }

    let digest = format!("sha256:{}", hex::encode(hasher.finalize()));
    let final_path = crate::image::blob_path(layout_root, &digest)?;
    fs::rename(&tmp_path, &final_path).map_err(|e| {
        let _ = fs::remove_file(&tmp_path);
        Error::io_at(&final_path, e)
    })?;
    debug!("stored layer blob {digest} ({size} bytes)");

    let media_type = layer.media_type.clone().unwrap_or_else(|| {
        if gzipped {
            OCI_LAYER_MEDIA_TYPE_GZIP.to_string()
        } else {
            OCI_LAYER_MEDIA_TYPE_TAR.to_string()
        }
    });
    Ok(Descriptor {
        media_type,
        digest,
        size,
        annotations: BTreeMap::new(),
    })
}

/// Temp-then-rename write for small documents.
pub(crate) fn atomic_write(
    path: &Path,
    write: impl FnOnce(&mut File) -> std::io::Result<()>,
) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| Error::io_at(parent, e))?;
    }
    let tmp = path.with_extension(format!("tmp.{}", uuid::Uuid::now_v7()));
    {
        let mut file = File::create(&tmp).map_err(|e| Error::io_at(&tmp, e))?;
        write(&mut file).map_err(|e| Error::io_at(&tmp, e))?;
    }
    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        Error::io_at(path, e)
    })?;
    Ok(())
}

/// Reads the reference annotation off a layout's first manifest descriptor.
fn read_ref_annotation(layout_path: &Path) -> Result<Option<String>> {
    let index_path = layout_path.join("index.json");
    let data = fs::read(&index_path).map_err(|e| Error::io_at(&index_path, e))?;
    let index: ImageIndex = serde_json::from_slice(&data)?;
    Ok(index
        .manifests
        .first()
        .and_then(|d| d.ref_name())
        .map(str::to_string))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_tag_and_digest() {
        assert_eq!(
            sanitize_image_name("registry.example.com/team/alpine:3.18.0"),
            "registry.example.com_team_alpine"
        );
        assert_eq!(
            sanitize_image_name("alpine@sha256:abcdef"),
            "alpine"
        );
        // A colon inside the registry host is not a tag separator.
        assert_eq!(
            sanitize_image_name("localhost:5000/alpine"),
            "localhost_5000_alpine"
        );
    }

    #[test]
    fn sanitize_is_idempotent() {
        for raw in [
            "registry.example.com/team/alpine:3.18.0",
            "weird name!!//",
            "._leading-and-trailing_.",
            "UPPER/lower:tag",
        ] {
            let once = sanitize_image_name(raw);
            assert_eq!(sanitize_image_name(&once), once, "not idempotent for {raw}");
            assert!(
                once.chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')),
                "bad characters in {once}"
            );
            if !once.is_empty() {
                assert!(!once.starts_with(['.', '_', '-']));
                assert!(!once.ends_with(['.', '_', '-']));
            }
        }
    }

    #[test]
    fn sanitize_pipeline_drops_bad_chars() {
        assert_eq!(sanitize_pipeline_name("demo pipeline/1"), "demopipeline1");
        assert_eq!(sanitize_pipeline_name("_demo-"), "demo");
        assert_eq!(sanitize_pipeline_name("  "), "");
    }
}
