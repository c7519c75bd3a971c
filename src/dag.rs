//! # Pipeline DAG Model
//!
//! The template and task-record data types, topological ordering, and the
//! node-token rendering applied to each step before execution.
//!
//! A template is an ordered list of steps; each step's `nodes` field names
//! its successor steps, so the edges run step -> successors. Execution
//! order is a Kahn topological sort seeded in template order, which keeps
//! the order deterministic for templates that are already linear.

use crate::constants::TEMPLATE_SUFFIX;
use crate::error::{Error, Result};
use crate::store::sanitize_pipeline_name;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::Path;

// =============================================================================
// Data Types
// =============================================================================

/// Execution status of one pipeline step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A key/value label on an execution node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Label {
    pub key: String,
    pub value: String,
}

/// Per-execution target metadata threaded into each step. Not a remote
/// connection: purely data interpolated through `{{node_*}}` tokens.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunNode {
    pub ip: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub port: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<Label>,
}

/// One step of a pipeline template (`<name>.template.json`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TemplateStep {
    pub name: String,
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    /// Successor step names: the outgoing DAG edges of this step.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<String>,
}

/// Durable state of one step inside a task record. Rendered entrypoint,
/// args, and env are persisted so stop and resume can recompute nothing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepState {
    pub name: String,
    pub image: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<String>,
}

/// Durable state of one pipeline execution (`pipeline.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub task_id: String,
    pub pipeline_name: String,
    pub steps: Vec<StepState>,
}

// =============================================================================
// Template Loading
// =============================================================================

/// Loads `<pipelines_dir>/<sanitised_name>.template.json` and decodes the
/// step list. Missing file, empty template, and invalid names are errors.
pub fn load_template(pipelines_dir: &Path, pipeline_name: &str) -> Result<Vec<TemplateStep>> {
    let name = sanitize_pipeline_name(pipeline_name);
    if name.is_empty() {
        return Err(Error::InvalidInput(format!(
            "invalid pipeline name: {pipeline_name:?}"
        )));
    }
    let path = pipelines_dir.join(format!("{name}{TEMPLATE_SUFFIX}"));
    let data = match fs::read(&path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::TemplateNotFound { path });
        }
        Err(e) => return Err(Error::io_at(&path, e)),
    };

    let steps: Vec<TemplateStep> = serde_json::from_slice(&data)?;
    if steps.is_empty() {
        return Err(Error::InvalidInput(format!(
            "pipeline template is empty: {}",
            path.display()
        )));
    }
    Ok(steps)
}

/// Lists the pipeline names under the pipelines dir: every
/// `*.template.json` with the suffix stripped, sorted. A missing dir is an
/// empty list.
pub fn list_pipeline_names(pipelines_dir: &Path) -> Result<Vec<String>> {
    let entries = match fs::read_dir(pipelines_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(Error::io_at(pipelines_dir, e)),
    };

    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(Error::Io)?;
        if entry.path().is_dir() {
            continue;
        }
        let Some(file_name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if let Some(name) = file_name.strip_suffix(TEMPLATE_SUFFIX)
            && !name.is_empty()
        {
            names.push(name.to_string());
        }
    }
    names.sort();
    Ok(names)
}

/// Deletes a pipeline template by name (with or without the
/// `.template.json` suffix). Names containing path separators are
/// rejected.
pub fn delete_pipeline(pipelines_dir: &Path, name: &str) -> Result<()> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(Error::InvalidInput("pipeline name must not be empty".into()));
    }
    if trimmed.contains('/') || trimmed.contains('\\') {
        return Err(Error::InvalidInput(format!(
            "invalid pipeline name: {name:?}"
        )));
    }

    let file_name = if trimmed.ends_with(TEMPLATE_SUFFIX) {
        trimmed.to_string()
    } else {
        format!("{trimmed}{TEMPLATE_SUFFIX}")
    };
    let path = pipelines_dir.join(file_name);
    match fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::TemplateNotFound { path }),
        Err(e) => Err(Error::io_at(&path, e)),
    }
}

// =============================================================================
// Topological Order
// =============================================================================

/// Computes the execution order of a template with Kahn's algorithm.
///
/// Step names must be unique and every successor must name an existing
/// step; the produced order must then cover every input step - a shorter
/// result means a cycle.
pub fn topo_order(steps: &[TemplateStep]) -> Result<Vec<TemplateStep>> {
    let by_name: HashMap<&str, &TemplateStep> =
        steps.iter().map(|s| (s.name.as_str(), s)).collect();

    // Duplicate names collapse into one map entry; the count mismatch is
    // the detection.
    if by_name.len() != steps.len() {
        return Err(Error::InvalidDag);
    }

    for step in steps {
        for next in &step.nodes {
            if !by_name.contains_key(next.as_str()) {
                return Err(Error::InvalidDag);
            }
        }
    }

    let mut in_degree: HashMap<&str, usize> =
        by_name.keys().map(|name| (*name, 0)).collect();
    for step in steps {
        for next in &step.nodes {
            if let Some(d) = in_degree.get_mut(next.as_str()) {
                *d += 1;
            }
        }
    }

    // Seed in template order so linear templates execute as written.
    let mut queue: VecDeque<&str> = steps
        .iter()
        .filter(|s| in_degree.get(s.name.as_str()) == Some(&0))
        .map(|s| s.name.as_str())
        .collect();

    let mut order = Vec::with_capacity(steps.len());
    while let Some(name) = queue.pop_front() {
        let step: &TemplateStep = by_name[name];
        order.push(step.clone());
        for next in &step.nodes {
            if let Some(d) = in_degree.get_mut(next.as_str()) {
                *d -= 1;
                if *d == 0 {
                    queue.push_back(next.as_str());
                }
            }
        }
    }

    if order.len() != steps.len() {
        return Err(Error::InvalidDag);
    }
    Ok(order)
}

// =============================================================================
// Token Rendering
// =============================================================================

/// Renders a step against a node: `{{node_ip}}`, `{{node_port}}`,
/// `{{node_username}}`, `{{node_password}}`, and `{{node_labels}}` are
/// substituted in the entrypoint, args, and env; anything else passes
/// through verbatim.
pub fn render_step(step: &TemplateStep, node: &RunNode) -> TemplateStep {
    let tokens = [
        ("{{node_ip}}", node.ip.as_str()),
        ("{{node_port}}", node.port.as_str()),
        ("{{node_username}}", node.username.as_str()),
        ("{{node_password}}", node.password.as_str()),
    ];
    let labels = labels_string(&node.labels);

    let render = |s: &str| -> String {
        let mut out = s.to_string();
        for (token, value) in tokens {
            out = out.replace(token, value);
        }
        out.replace("{{node_labels}}", &labels)
    };

    TemplateStep {
        name: step.name.clone(),
        image: step.image.clone(),
        entrypoint: step.entrypoint.as_deref().map(|e| render(e)),
        args: step.args.iter().map(|a| render(a)).collect(),
        env: step.env.iter().map(|e| render(e)).collect(),
        nodes: step.nodes.clone(),
    }
}

/// Comma-joined `key=value` rendering of a node's labels.
pub fn labels_string(labels: &[Label]) -> String {
    labels
        .iter()
        .map(|l| format!("{}={}", l.key, l.value))
        .collect::<Vec<_>>()
        .join(",")
}

/// Builds the initial task record from the topologically ordered steps:
/// every step rendered against the node and set to `pending`.
pub fn build_task_record(
    task_id: &str,
    pipeline_name: &str,
    ordered_steps: &[TemplateStep],
    node: &RunNode,
) -> TaskRecord {
    let steps = ordered_steps
        .iter()
        .map(|step| {
            let rendered = render_step(step, node);
            StepState {
                name: rendered.name,
                image: rendered.image,
                status: StepStatus::Pending,
                entrypoint: rendered.entrypoint,
                args: rendered.args,
                env: rendered.env,
                nodes: rendered.nodes,
            }
        })
        .collect();
    TaskRecord {
        task_id: task_id.to_string(),
        pipeline_name: pipeline_name.to_string(),
        steps,
    }
}

// =============================================================================
// Nodes File
// =============================================================================

/// Parses a node list from JSON: either `{"nodes": [...]}` or a bare
/// array.
pub fn parse_nodes_file(data: &[u8]) -> Result<Vec<RunNode>> {
    #[derive(Deserialize)]
    struct Wrapped {
        #[serde(default)]
        nodes: Vec<RunNode>,
    }

    if let Ok(wrapped) = serde_json::from_slice::<Wrapped>(data)
        && !wrapped.nodes.is_empty()
    {
        return Ok(wrapped.nodes);
    }
    Ok(serde_json::from_slice::<Vec<RunNode>>(data)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(name: &str, nodes: &[&str]) -> TemplateStep {
        TemplateStep {
            name: name.to_string(),
            image: "alpine".to_string(),
            nodes: nodes.iter().map(|n| n.to_string()).collect(),
            ..TemplateStep::default()
        }
    }

    #[test]
    fn topo_orders_linear_chain_in_template_order() {
        let steps = vec![step("a", &["b"]), step("b", &["c"]), step("c", &[])];
        let order = topo_order(&steps).unwrap();
        let names: Vec<_> = order.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["a", "b", "c"]);
    }

    #[test]
    fn topo_puts_every_step_after_its_predecessors() {
        let steps = vec![
            step("fan-in", &[]),
            step("left", &["fan-in"]),
            step("right", &["fan-in"]),
            step("root", &["left", "right"]),
        ];
        let order = topo_order(&steps).unwrap();
        assert_eq!(order.len(), steps.len());
        let pos: HashMap<&str, usize> = order
            .iter()
            .enumerate()
            .map(|(i, s)| (s.name.as_str(), i))
            .collect();
        assert!(pos["root"] < pos["left"]);
        assert!(pos["root"] < pos["right"]);
        assert!(pos["left"] < pos["fan-in"]);
        assert!(pos["right"] < pos["fan-in"]);
    }

    #[test]
    fn topo_rejects_cycle() {
        let steps = vec![step("a", &["b"]), step("b", &["a"])];
        assert!(matches!(topo_order(&steps), Err(Error::InvalidDag)));
    }

    #[test]
    fn topo_rejects_unknown_successor() {
        let steps = vec![step("a", &["ghost"]), step("b", &[])];
        assert!(matches!(topo_order(&steps), Err(Error::InvalidDag)));
    }

    #[test]
    fn topo_rejects_duplicate_names() {
        let steps = vec![step("a", &[]), step("a", &[])];
        assert!(matches!(topo_order(&steps), Err(Error::InvalidDag)));
    }

    #[test]
    fn render_replaces_known_tokens_and_keeps_unknown() {
        let node = RunNode {
            ip: "10.0.0.1".to_string(),
            port: "22".to_string(),
            username: "root".to_string(),
            password: "x".to_string(),
            labels: vec![Label {
                key: "zone".to_string(),
                value: "a".to_string(),
            }],
        };
        let mut s = step("a", &[]);
        s.env = vec![
            "URL=http://{{node_ip}}:{{node_port}}/".to_string(),
            "USER={{node_username}}".to_string(),
            "LABELS={{node_labels}}".to_string(),
            "KEEP={{unknown_token}}".to_string(),
        ];
        s.args = vec!["plain".to_string()];

        let rendered = render_step(&s, &node);
        assert_eq!(
            rendered.env,
            [
                "URL=http://10.0.0.1:22/",
                "USER=root",
                "LABELS=zone=a",
                "KEEP={{unknown_token}}",
            ]
        );
        assert_eq!(rendered.args, ["plain"]);
    }

    #[test]
    fn nodes_file_accepts_both_shapes() {
        let wrapped = br#"{"nodes": [{"ip": "1.2.3.4", "username": "u", "password": "p"}]}"#;
        let nodes = parse_nodes_file(wrapped).unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].ip, "1.2.3.4");

        let bare = br#"[{"ip": "5.6.7.8", "username": "u", "password": "p"}]"#;
        let nodes = parse_nodes_file(bare).unwrap();
        assert_eq!(nodes[0].ip, "5.6.7.8");
    }

    #[test]
    fn step_status_serialises_lowercase() {
        assert_eq!(
            serde_json::to_string(&StepStatus::Cancelled).unwrap(),
            "\"cancelled\""
        );
        let status: StepStatus = serde_json::from_str("\"running\"").unwrap();
        assert_eq!(status, StepStatus::Running);
    }
}
