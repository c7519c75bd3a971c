//! Archive reader behavior: format detection, compression handling, and
//! the tar containment guarantees.

mod common;

use allrun::archive::{extract_tar, normalize_archive_to_tar, open_archive};
use allrun::Error;
use common::{gzip_bytes, image_config_json, tar_bytes, write_docker_archive, write_oci_archive};
use std::fs;
use tar::Header;

fn shell_layer() -> Vec<u8> {
    tar_bytes(&[
        ("bin/sh", b"#!fake shell\n", 0o755),
        ("entrypoint.sh", b"echo hi\n", 0o755),
    ])
}

#[test]
fn docker_archive_yields_repo_tag_reference() {
    let dir = tempfile::tempdir().unwrap();
    let archive = dir.path().join("pipeline.tar");
    write_docker_archive(
        &archive,
        Some("registry.example.com/team/pipeline:1.0"),
        &shell_layer(),
        &image_config_json(Some(&["/entrypoint.sh"]), None, None),
    );

    let (image, reference) = open_archive(&archive).unwrap();
    assert_eq!(
        reference.as_deref(),
        Some("registry.example.com/team/pipeline:1.0")
    );
    assert_eq!(image.layers().len(), 1);
    assert_eq!(
        image.process_config().entrypoint.as_deref(),
        Some(&["/entrypoint.sh".to_string()][..])
    );
}

#[test]
fn docker_archive_without_tags_falls_back_to_basename() {
    let dir = tempfile::tempdir().unwrap();
    let archive = dir.path().join("my-pipeline.tar");
    write_docker_archive(
        &archive,
        None,
        &shell_layer(),
        &image_config_json(Some(&["/entrypoint.sh"]), None, None),
    );

    let (_, reference) = open_archive(&archive).unwrap();
    assert_eq!(reference.as_deref(), Some("my-pipeline"));
}

#[test]
fn oci_archive_yields_ref_annotation() {
    let dir = tempfile::tempdir().unwrap();
    let archive = dir.path().join("pipeline.tar");
    write_oci_archive(
        &archive,
        "",
        Some("example.com/pipeline:latest"),
        &shell_layer(),
        &image_config_json(Some(&["/entrypoint.sh"]), None, None),
    );

    let (image, reference) = open_archive(&archive).unwrap();
    assert_eq!(reference.as_deref(), Some("example.com/pipeline:latest"));
    assert_eq!(image.layers().len(), 1);
}

#[test]
fn oci_archive_layout_may_be_nested() {
    let dir = tempfile::tempdir().unwrap();
    let archive = dir.path().join("pipeline.tar");
    write_oci_archive(
        &archive,
        "some/nested/dir",
        Some("example.com/nested:1"),
        &shell_layer(),
        &image_config_json(Some(&["/entrypoint.sh"]), None, None),
    );

    let (_, reference) = open_archive(&archive).unwrap();
    assert_eq!(reference.as_deref(), Some("example.com/nested:1"));
}

#[test]
fn gzip_magic_beats_suffix() {
    let dir = tempfile::tempdir().unwrap();
    let config = image_config_json(Some(&["/entrypoint.sh"]), None, None);

    // A compressed archive named .tar still opens.
    let plain = dir.path().join("inner.tar");
    write_docker_archive(&plain, Some("a/b:1"), &shell_layer(), &config);
    let compressed = dir.path().join("mislabeled.tar");
    fs::write(&compressed, gzip_bytes(&fs::read(&plain).unwrap())).unwrap();
    assert!(open_archive(&compressed).is_ok());

    // A plain tar named .tar.gz also opens.
    let mislabeled_gz = dir.path().join("plain.tar.gz");
    fs::write(&mislabeled_gz, fs::read(&plain).unwrap()).unwrap();
    assert!(open_archive(&mislabeled_gz).is_ok());
}

#[test]
fn normalize_keeps_plain_tar_and_decompresses_gzip() {
    let dir = tempfile::tempdir().unwrap();

    let plain = dir.path().join("plain.tar.gz");
    fs::write(&plain, tar_bytes(&[("hello.txt", b"hi", 0o644)])).unwrap();
    let (path, guard) = normalize_archive_to_tar(&plain).unwrap();
    assert_eq!(path, plain);
    assert!(guard.is_none());

    let gz = dir.path().join("real.tar.gz");
    fs::write(&gz, gzip_bytes(&tar_bytes(&[("hello.txt", b"hi", 0o644)]))).unwrap();
    let (tmp_path, guard) = normalize_archive_to_tar(&gz).unwrap();
    assert_ne!(tmp_path, gz);
    assert!(tmp_path.exists());
    drop(guard);
    assert!(!tmp_path.exists(), "temp tar should vanish with its guard");
}

#[test]
fn unsupported_archive_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let archive = dir.path().join("noise.tar");
    fs::write(&archive, tar_bytes(&[("random.txt", b"not an image", 0o644)])).unwrap();

    match open_archive(&archive) {
        Err(Error::UnsupportedArchive { .. }) => {}
        other => panic!("expected UnsupportedArchive, got {other:?}"),
    }
}

#[test]
fn extraction_rejects_parent_dir_escape() {
    // append_data would refuse a `..` path, so write the name bytes
    // straight into a GNU header.
    let mut header = Header::new_gnu();
    {
        let gnu = header.as_gnu_mut().unwrap();
        let name = b"../evil.txt";
        gnu.name[..name.len()].copy_from_slice(name);
    }
    header.set_size(4);
    header.set_mode(0o644);
    header.set_cksum();

    let mut builder = tar::Builder::new(Vec::new());
    builder.append(&header, &b"boom"[..]).unwrap();
    let evil_tar = builder.into_inner().unwrap();

    let dest = tempfile::tempdir().unwrap();
    match extract_tar(&evil_tar[..], dest.path()) {
        Err(Error::PathTraversal { .. }) => {}
        other => panic!("expected PathTraversal, got {other:?}"),
    }
    assert!(!dest.path().parent().unwrap().join("evil.txt").exists());
}

#[test]
fn extraction_reroots_absolute_paths() {
    let mut header = Header::new_gnu();
    {
        let gnu = header.as_gnu_mut().unwrap();
        let name = b"/abs/file.txt";
        gnu.name[..name.len()].copy_from_slice(name);
    }
    header.set_size(2);
    header.set_mode(0o644);
    header.set_cksum();

    let mut builder = tar::Builder::new(Vec::new());
    builder.append(&header, &b"ok"[..]).unwrap();
    let archive = builder.into_inner().unwrap();

    let dest = tempfile::tempdir().unwrap();
    extract_tar(&archive[..], dest.path()).unwrap();
    assert!(dest.path().join("abs/file.txt").is_file());
}

#[test]
fn extraction_skips_device_entries() {
    let mut header = Header::new_gnu();
    header.set_entry_type(tar::EntryType::Char);
    {
        let gnu = header.as_gnu_mut().unwrap();
        let name = b"dev/null";
        gnu.name[..name.len()].copy_from_slice(name);
    }
    header.set_size(0);
    header.set_mode(0o666);
    header.set_cksum();

    let mut builder = tar::Builder::new(Vec::new());
    builder.append(&header, &b""[..]).unwrap();
    let archive = builder.into_inner().unwrap();

    let dest = tempfile::tempdir().unwrap();
    extract_tar(&archive[..], dest.path()).unwrap();
    assert!(!dest.path().join("dev/null").exists());
}
