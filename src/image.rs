//! # OCI Image Model
//!
//! Serde types for the OCI image documents the core reads and writes
//! (index, manifest, image config), plus [`Image`] - a handle to an image
//! whose blobs live on the local filesystem.
//!
//! An [`Image`] is backed either by an OCI layout directory (the image
//! store, or an extracted OCI archive) or by the extracted tree of a
//! legacy docker archive. In both cases the handle owns any temporary
//! extraction directory, so blobs stay readable for the handle's lifetime.
//!
//! ## Layer Order
//!
//! `layers()` is ordered bottom-to-top: `layers[0]` is the base layer and
//! later layers overlay earlier ones during rootfs extraction.

use crate::constants::{
    OCI_IMAGE_INDEX_MEDIA_TYPE, OCI_LAYER_MEDIA_TYPE_GZIP, OCI_REF_NAME_ANNOTATION,
};
use crate::error::{Error, Result};
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

// =============================================================================
// OCI Image Spec Types
// =============================================================================

/// Content descriptor: points at a blob by digest.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl Descriptor {
    /// The reference annotation, if the descriptor carries one.
    pub fn ref_name(&self) -> Option<&str> {
        self.annotations
            .get(OCI_REF_NAME_ANNOTATION)
            .map(String::as_str)
    }
}

/// Image index (`index.json` of an OCI layout).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageIndex {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(default)]
    pub manifests: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// Image manifest: config descriptor plus ordered layer descriptors.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub config: Descriptor,
    #[serde(default)]
    pub layers: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// Image config document. Only the execution-relevant subset is modeled;
/// unknown fields are dropped on decode and never round-tripped (the store
/// copies the raw config bytes, not this struct).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ImageConfig {
    #[serde(default)]
    pub config: ProcessConfig,
}

/// The `config` section of an image config: how to run the container.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProcessConfig {
    #[serde(default, rename = "Entrypoint")]
    pub entrypoint: Option<Vec<String>>,
    #[serde(default, rename = "Cmd")]
    pub cmd: Option<Vec<String>>,
    #[serde(default, rename = "Env")]
    pub env: Option<Vec<String>>,
    #[serde(default, rename = "WorkingDir")]
    pub working_dir: Option<String>,
    #[serde(default, rename = "User")]
    pub user: Option<String>,
}

// =============================================================================
// Image Handle
// =============================================================================

/// One filesystem-backed layer of an image.
#[derive(Debug, Clone)]
pub struct Layer {
    /// Path to the layer blob (tar, possibly gzip compressed).
    pub path: PathBuf,
    /// Media type, when known from a manifest.
    pub media_type: Option<String>,
    /// Content digest, when known from a manifest.
    pub digest: Option<String>,
}

impl Layer {
    /// Opens the raw (as-stored) blob.
    pub fn open_raw(&self) -> Result<File> {
        File::open(&self.path).map_err(|e| Error::io_at(&self.path, e))
    }

    /// Opens an uncompressed tar stream of the layer, decompressing when
    /// the media type or the gzip magic says the blob is compressed.
    pub fn open_tar(&self) -> Result<Box<dyn Read>> {
        let mut file = self.open_raw()?;
        let compressed = match &self.media_type {
            Some(mt) => mt == OCI_LAYER_MEDIA_TYPE_GZIP || mt.ends_with("+gzip") || mt.ends_with(".gzip"),
            None => {
                let mut magic = [0u8; 2];
                let n = file.read(&mut magic).map_err(|e| Error::io_at(&self.path, e))?;
                file = self.open_raw()?;
                n == 2 && magic == [0x1f, 0x8b]
            }
        };
        if compressed {
            Ok(Box::new(GzDecoder::new(BufReader::new(file))))
        } else {
            Ok(Box::new(BufReader::new(file)))
        }
    }

    /// A short name for log and error messages.
    pub fn display_id(&self) -> String {
        self.digest
            .clone()
            .unwrap_or_else(|| self.path.display().to_string())
    }
}

/// Handle to an image whose blobs are readable on the local filesystem.
///
/// Created by the archive reader ([`crate::archive::open_archive`]) or by
/// the image store ([`crate::store::ImageStore::open`]).
pub struct Image {
    /// Decoded image config.
    config: ImageConfig,
    /// Raw config bytes, preserved for byte-exact re-storage.
    config_raw: Vec<u8>,
    /// Ordered layers, base first.
    layers: Vec<Layer>,
    /// Keeps a temporary extraction directory alive while the handle lives.
    _scratch: Option<tempfile::TempDir>,
}

impl std::fmt::Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Image")
            .field("layers", &self.layers.len())
            .finish()
    }
}

impl Image {
    /// Assembles a handle from already-located parts. `scratch` is dropped
    /// (deleting the directory) when the image handle is dropped.
    pub(crate) fn from_parts(
        config_raw: Vec<u8>,
        layers: Vec<Layer>,
        scratch: Option<tempfile::TempDir>,
    ) -> Result<Self> {
        let config: ImageConfig = serde_json::from_slice(&config_raw)?;
        Ok(Self {
            config,
            config_raw,
            layers,
            _scratch: scratch,
        })
    }

    /// The execution section of the image config.
    pub fn process_config(&self) -> &ProcessConfig {
        &self.config.config
    }

    /// Raw config document bytes as they appeared in the source.
    pub fn config_raw(&self) -> &[u8] {
        &self.config_raw
    }

    /// Ordered layers, base first.
    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    /// Opens the first usable image in an OCI layout directory, walking
    /// nested indices recursively. Returns the image and the reference
    /// recorded in the enclosing descriptor's annotations, if any.
    pub fn open_layout(layout_root: &Path) -> Result<(Self, Option<String>)> {
        let index_path = layout_root.join("index.json");
        let data = fs::read(&index_path).map_err(|e| Error::io_at(&index_path, e))?;
        let index: ImageIndex = serde_json::from_slice(&data)?;
        let (manifest, reference) = first_manifest_in_index(layout_root, &index, None)?;

        let config_path = blob_path(layout_root, &manifest.config.digest)?;
        let config_raw = fs::read(&config_path).map_err(|e| Error::io_at(&config_path, e))?;

        let mut layers = Vec::with_capacity(manifest.layers.len());
        for desc in &manifest.layers {
            layers.push(Layer {
                path: blob_path(layout_root, &desc.digest)?,
                media_type: Some(desc.media_type.clone()),
                digest: Some(desc.digest.clone()),
            });
        }

        Ok((Self::from_parts(config_raw, layers, None)?, reference))
    }

    /// Like [`Image::open_layout`], but adopts ownership of the temporary
    /// directory the layout was extracted into.
    pub(crate) fn open_layout_owned(
        layout_root: &Path,
        scratch: tempfile::TempDir,
    ) -> Result<(Self, Option<String>)> {
        let (image, reference) = Self::open_layout(layout_root)?;
        Ok((
            Self {
                _scratch: Some(scratch),
                ..image
            },
            reference,
        ))
    }
}

/// Resolves `sha256:<hex>` to the blob file inside a layout. The digest is
/// validated so a hostile index cannot name a path outside `blobs/`.
pub fn blob_path(layout_root: &Path, digest: &str) -> Result<PathBuf> {
    let (algo, hash) = digest.split_once(':').ok_or_else(|| Error::ArchiveMalformed {
        reason: format!("malformed digest: {digest}"),
    })?;
    let algo_ok = matches!(algo, "sha256" | "sha384" | "sha512");
    if !algo_ok || hash.is_empty() || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(Error::ArchiveMalformed {
            reason: format!("malformed digest: {digest}"),
        });
    }
    Ok(layout_root.join("blobs").join(algo).join(hash))
}

/// Depth-first walk over an index: returns the first descriptor that decodes
/// as an image manifest, together with the innermost reference annotation
/// seen on the way down.
fn first_manifest_in_index(
    layout_root: &Path,
    index: &ImageIndex,
    outer_ref: Option<String>,
) -> Result<(ImageManifest, Option<String>)> {
    for desc in &index.manifests {
        let reference = desc.ref_name().map(str::to_string).or_else(|| outer_ref.clone());

        let path = match blob_path(layout_root, &desc.digest) {
            Ok(p) => p,
            Err(_) => continue,
        };
        let data = match fs::read(&path) {
            Ok(d) => d,
            Err(_) => continue,
        };

        if desc.media_type == OCI_IMAGE_INDEX_MEDIA_TYPE {
            if let Ok(nested) = serde_json::from_slice::<ImageIndex>(&data)
                && let Ok(found) = first_manifest_in_index(layout_root, &nested, reference.clone())
            {
                return Ok(found);
            }
            continue;
        }

        // Try manifest first, then a nested index for permissive layouts
        // that mislabel media types.
        if let Ok(manifest) = serde_json::from_slice::<ImageManifest>(&data) {
            return Ok((manifest, reference));
        }
        if let Ok(nested) = serde_json::from_slice::<ImageIndex>(&data)
            && let Ok(found) = first_manifest_in_index(layout_root, &nested, reference)
        {
            return Ok(found);
        }
    }

    Err(Error::ArchiveMalformed {
        reason: "OCI index contains no usable image".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_config_decodes_docker_style_keys() {
        let raw = br#"{
            "architecture": "amd64",
            "config": {
                "Entrypoint": ["/entrypoint.sh"],
                "Cmd": ["run"],
                "Env": ["PATH=/bin", "FOO=bar"],
                "WorkingDir": "/work"
            }
        }"#;
        let cfg: ImageConfig = serde_json::from_slice(raw).unwrap();
        assert_eq!(cfg.config.entrypoint.as_deref(), Some(&["/entrypoint.sh".to_string()][..]));
        assert_eq!(cfg.config.cmd.as_deref(), Some(&["run".to_string()][..]));
        assert_eq!(cfg.config.working_dir.as_deref(), Some("/work"));
    }

    #[test]
    fn blob_path_rejects_traversal() {
        let root = Path::new("/store/alpine");
        assert!(blob_path(root, "sha256:abc123").is_ok());
        assert!(blob_path(root, "sha256:../../../etc/passwd").is_err());
        assert!(blob_path(root, "nonsense").is_err());
        assert!(blob_path(root, "md5:abcd").is_err());
    }

    #[test]
    fn descriptor_ref_annotation() {
        let mut annotations = BTreeMap::new();
        annotations.insert(
            OCI_REF_NAME_ANNOTATION.to_string(),
            "registry.example.com/pipeline:latest".to_string(),
        );
        let desc = Descriptor {
            media_type: "application/vnd.oci.image.manifest.v1+json".to_string(),
            digest: "sha256:0000".to_string(),
            size: 2,
            annotations,
        };
        assert_eq!(desc.ref_name(), Some("registry.example.com/pipeline:latest"));
    }
}
