//! # Rootfs Extraction
//!
//! Materialises an image's ordered layers into a directory, base layer
//! first, each applied with the safe tar extraction of [`crate::archive`].
//! Extraction is deliberately layer-at-a-time: flat whole-image unpack
//! helpers have been seen to drop lower layers for some layout-loaded
//! images, and the contract here is that every file of every layer lands
//! with last-layer-wins overlay semantics.
//!
//! AUFS-style whiteout markers (`.wh.*`) are not honoured: pipeline images
//! are authored as a single additive layer over a small base, and the
//! loader verifies `/bin/sh` and the entrypoint after extraction.

use crate::error::{Error, Result};
use crate::image::Image;
use std::fs;
use std::path::Path;
use tracing::debug;

/// Extracts every layer of `image` into `rootfs_dir`, in order.
pub fn extract_rootfs(image: &Image, rootfs_dir: &Path) -> Result<()> {
    fs::create_dir_all(rootfs_dir).map_err(|e| Error::io_at(rootfs_dir, e))?;

    for layer in image.layers() {
        debug!(
            "applying layer {} -> {}",
            layer.display_id(),
            rootfs_dir.display()
        );
        let reader = layer.open_tar()?;
        crate::archive::extract_tar(reader, rootfs_dir).map_err(|e| match e {
            // Traversal is its own failure class; everything else is wrapped
            // with the offending layer.
            traversal @ Error::PathTraversal { .. } => traversal,
            other => Error::LayerExtractionFailed {
                digest: layer.display_id(),
                reason: other.to_string(),
            },
        })?;
    }

    Ok(())
}
