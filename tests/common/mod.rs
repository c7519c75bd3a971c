//! Shared fixtures: synthetic image archives built in temp dirs.
#![allow(dead_code)]

use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tar::{Builder, Header};

/// Builds an uncompressed tar (as bytes) from `(path, content, mode)`
/// file entries.
pub fn tar_bytes(files: &[(&str, &[u8], u32)]) -> Vec<u8> {
    let mut builder = Builder::new(Vec::new());
    for (path, content, mode) in files {
        let mut header = Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(*mode);
        header.set_cksum();
        builder
            .append_data(&mut header, path, *content)
            .expect("append tar entry");
    }
    builder.into_inner().expect("finish tar")
}

/// Gzip-compresses bytes.
pub fn gzip_bytes(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).expect("gzip write");
    encoder.finish().expect("gzip finish")
}

/// An image config document with the given entrypoint/cmd/env.
pub fn image_config_json(
    entrypoint: Option<&[&str]>,
    cmd: Option<&[&str]>,
    env: Option<&[&str]>,
) -> Vec<u8> {
    let config = serde_json::json!({
        "architecture": "amd64",
        "os": "linux",
        "config": {
            "Entrypoint": entrypoint,
            "Cmd": cmd,
            "Env": env,
            "WorkingDir": "/",
        },
        "rootfs": { "type": "layers", "diff_ids": [] },
    });
    serde_json::to_vec(&config).expect("encode image config")
}

/// Writes a docker-archive tar at `path`: `manifest.json` with the given
/// repo tag plus one layer.
pub fn write_docker_archive(path: &Path, repo_tag: Option<&str>, layer_tar: &[u8], config: &[u8]) {
    let manifest = match repo_tag {
        Some(tag) => serde_json::json!([{
            "Config": "config.json",
            "RepoTags": [tag],
            "Layers": ["layer0/layer.tar"],
        }]),
        None => serde_json::json!([{
            "Config": "config.json",
            "Layers": ["layer0/layer.tar"],
        }]),
    };
    let manifest = serde_json::to_vec(&manifest).expect("encode docker manifest");

    let archive = tar_bytes(&[
        ("manifest.json", &manifest, 0o644),
        ("config.json", config, 0o644),
        ("layer0/layer.tar", layer_tar, 0o644),
    ]);
    fs::write(path, archive).expect("write docker archive");
}

/// Writes an OCI-archive tar at `path`: a complete layout (index, layout
/// marker, blobs) nested under `prefix` inside the tar. Returns nothing;
/// the ref name is annotated on the manifest descriptor.
pub fn write_oci_archive(
    path: &Path,
    prefix: &str,
    reference: Option<&str>,
    layer_tar: &[u8],
    config: &[u8],
) {
    let layout_dir = build_oci_layout_dir(reference, layer_tar, config);

    let mut builder = Builder::new(Vec::new());
    append_dir_contents(&mut builder, layout_dir.path(), prefix);
    let archive = builder.into_inner().expect("finish oci archive");
    fs::write(path, archive).expect("write oci archive");
}

/// Builds a complete OCI layout in a temp dir and returns it.
pub fn build_oci_layout_dir(
    reference: Option<&str>,
    layer_tar: &[u8],
    config: &[u8],
) -> tempfile::TempDir {
    let dir = tempfile::tempdir().expect("layout temp dir");
    let blobs = dir.path().join("blobs/sha256");
    fs::create_dir_all(&blobs).expect("blobs dir");

    let config_digest = write_blob(&blobs, config);
    let layer_digest = write_blob(&blobs, layer_tar);

    let manifest = serde_json::json!({
        "schemaVersion": 2,
        "mediaType": "application/vnd.oci.image.manifest.v1+json",
        "config": {
            "mediaType": "application/vnd.oci.image.config.v1+json",
            "digest": format!("sha256:{config_digest}"),
            "size": config.len(),
        },
        "layers": [{
            "mediaType": "application/vnd.oci.image.layer.v1.tar",
            "digest": format!("sha256:{layer_digest}"),
            "size": layer_tar.len(),
        }],
    });
    let manifest = serde_json::to_vec(&manifest).expect("encode manifest");
    let manifest_digest = write_blob(&blobs, &manifest);

    let mut descriptor = serde_json::json!({
        "mediaType": "application/vnd.oci.image.manifest.v1+json",
        "digest": format!("sha256:{manifest_digest}"),
        "size": manifest.len(),
    });
    if let Some(reference) = reference {
        descriptor["annotations"] = serde_json::json!({
            "org.opencontainers.image.ref.name": reference,
        });
    }
    let index = serde_json::json!({
        "schemaVersion": 2,
        "manifests": [descriptor],
    });

    fs::write(
        dir.path().join("index.json"),
        serde_json::to_vec(&index).expect("encode index"),
    )
    .expect("write index.json");
    fs::write(
        dir.path().join("oci-layout"),
        br#"{"imageLayoutVersion":"1.0.0"}"#,
    )
    .expect("write oci-layout");
    dir
}

fn write_blob(blobs_dir: &Path, data: &[u8]) -> String {
    let digest = hex::encode(Sha256::digest(data));
    fs::write(blobs_dir.join(&digest), data).expect("write blob");
    digest
}

fn append_dir_contents(builder: &mut Builder<Vec<u8>>, dir: &Path, prefix: &str) {
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        for entry in fs::read_dir(&current).expect("read layout dir") {
            let entry = entry.expect("layout dir entry");
            let path = entry.path();
            let rel = path.strip_prefix(dir).expect("relative layout path");
            let name: PathBuf = if prefix.is_empty() {
                rel.to_path_buf()
            } else {
                Path::new(prefix).join(rel)
            };
            if path.is_dir() {
                stack.push(path);
            } else {
                let mut file = File::open(&path).expect("open layout file");
                builder
                    .append_file(&name, &mut file)
                    .expect("append layout file");
            }
        }
    }
}
