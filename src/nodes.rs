//! Node descriptor files.
//!
//! Registered execution nodes live as `node_<ip>.json` files under the
//! nodes dir, each decoding to a [`RunNode`]. Only listing and deletion
//! live here; the write path belongs to the API surface outside the core.

use crate::dag::RunNode;
use crate::error::{Error, Result};
use std::fs;
use std::path::Path;

/// Lists every registered node, sorted by ip. A missing nodes dir is an
/// empty list.
pub fn list_nodes(nodes_dir: &Path) -> Result<Vec<RunNode>> {
    let entries = match fs::read_dir(nodes_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(Error::io_at(nodes_dir, e)),
    };

    let mut nodes = Vec::new();
    for entry in entries {
        let entry = entry.map_err(Error::Io)?;
        if entry.path().is_dir() {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if !name.starts_with("node_") || !name.ends_with(".json") {
            continue;
        }
        let data = fs::read(entry.path()).map_err(|e| Error::io_at(entry.path(), e))?;
        let node: RunNode = serde_json::from_slice(&data)?;
        nodes.push(node);
    }
    nodes.sort_by(|a, b| a.ip.cmp(&b.ip));
    Ok(nodes)
}

/// Deletes a node descriptor by ip.
pub fn delete_node(nodes_dir: &Path, ip: &str) -> Result<()> {
    let trimmed = ip.trim();
    if trimmed.is_empty() {
        return Err(Error::InvalidInput("node ip must not be empty".into()));
    }
    let path = nodes_dir.join(format!("node_{trimmed}.json"));
    match fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(Error::InvalidInput(format!("node {trimmed} does not exist")))
        }
        Err(e) => Err(Error::io_at(&path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lists_and_deletes_node_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("node_10.0.0.2.json"),
            br#"{"ip": "10.0.0.2", "username": "u", "password": "p"}"#,
        )
        .unwrap();
        fs::write(
            dir.path().join("node_10.0.0.1.json"),
            br#"{"ip": "10.0.0.1", "username": "u", "password": "p"}"#,
        )
        .unwrap();
        fs::write(dir.path().join("other.json"), b"{}").unwrap();

        let nodes = list_nodes(dir.path()).unwrap();
        let ips: Vec<_> = nodes.iter().map(|n| n.ip.as_str()).collect();
        assert_eq!(ips, ["10.0.0.1", "10.0.0.2"]);

        delete_node(dir.path(), "10.0.0.1").unwrap();
        assert_eq!(list_nodes(dir.path()).unwrap().len(), 1);
        assert!(delete_node(dir.path(), "10.0.0.1").is_err());
    }
}
