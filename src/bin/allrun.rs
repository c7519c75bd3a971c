//! allrun - private-deployment batch-command tool.
//!
//! Pipelines ship as OCI images; each pipeline step runs as a short-lived
//! OCI container on this host.
//!
//! ```sh
//! allrun load -i pipeline-alpine.tar.gz
//! allrun run -p alpine -n nodes.json
//! allrun task list
//! allrun task stop -t <task_id>
//! allrun task resume -t <task_id>
//! allrun task log -t <task_id> --tail 100
//! ```

use allrun::{dag, nodes, store, task};
use allrun::{Loader, Paths, Runner};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "allrun")]
#[command(version)]
#[command(about = "Run OCI-packaged batch pipelines as one-shot containers")]
struct Cli {
    /// Log at debug level
    #[arg(long, global = true)]
    debug: bool,

    /// Directory holding <name>.template.json pipeline templates
    #[arg(long, global = true, default_value = "/var/lib/ar/pipelines")]
    pipelines_dir: PathBuf,

    /// Directory holding imported images (one OCI layout each)
    #[arg(long, global = true, default_value = "/var/lib/ar/images")]
    images_store_dir: PathBuf,

    /// Scratch root for pipeline load working directories
    #[arg(long, global = true, default_value = "/var/lib/ar/tmp")]
    load_tmp_root: PathBuf,

    /// OCI runtime state root (same meaning as runc --root)
    #[arg(long, global = true, default_value = "/var/lib/ar/runc")]
    oci_runtime_root: PathBuf,

    /// Directory holding node_<ip>.json node descriptors
    #[arg(long, global = true, default_value = "/var/lib/ar/nodes")]
    nodes_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load a pipeline image and import its child images
    Load {
        /// Pipeline image archive (.tar or .tar.gz)
        #[arg(short, long, conflicts_with = "from_store")]
        input: Option<PathBuf>,
        /// Load an image already present in the image store
        #[arg(long)]
        from_store: Option<String>,
        /// Keep the temporary work directory after loading
        #[arg(long)]
        no_clean_tmp: bool,
    },
    /// Run a pipeline in DAG order
    Run {
        /// Pipeline name (matches <name>.template.json)
        #[arg(short, long)]
        pipeline: String,
        /// Path to the node list JSON file
        #[arg(short, long)]
        nodes: PathBuf,
    },
    /// Manage pipeline templates
    Pipeline {
        #[command(subcommand)]
        command: PipelineCommand,
    },
    /// Manage imported images
    Image {
        #[command(subcommand)]
        command: ImageCommand,
    },
    /// Manage pipeline tasks
    Task {
        #[command(subcommand)]
        command: TaskCommand,
    },
    /// Manage execution nodes
    Node {
        #[command(subcommand)]
        command: NodeCommand,
    },
}

#[derive(Subcommand)]
enum PipelineCommand {
    /// List pipeline templates
    #[command(alias = "ls")]
    List,
    /// Delete one or more pipeline templates
    #[command(alias = "del")]
    Rm { names: Vec<String> },
}

#[derive(Subcommand)]
enum ImageCommand {
    /// List imported images
    #[command(alias = "ls")]
    List,
    /// Delete one or more imported images (by store name or reference)
    #[command(alias = "del")]
    Rm { names: Vec<String> },
    /// Delete images not referenced by any pipeline template
    Prune {
        /// Delete every imported image
        #[arg(long)]
        all: bool,
    },
}

#[derive(Subcommand)]
enum TaskCommand {
    /// List running pipeline tasks
    #[command(alias = "ls")]
    List {
        /// Only show tasks of this pipeline
        #[arg(short, long)]
        pipeline: Option<String>,
    },
    /// Stop a pipeline task by id
    Stop {
        #[arg(short, long)]
        task: String,
    },
    /// Resume a stopped or crashed pipeline task by id
    Resume {
        #[arg(short, long)]
        task: String,
    },
    /// Show container logs of a pipeline task
    Log {
        #[arg(short, long)]
        task: String,
        /// Container id (ar_<pipeline>_<step>_<index>); all steps if omitted
        #[arg(short, long)]
        container: Option<String>,
        /// Keep following appended log output
        #[arg(short, long)]
        follow: bool,
        /// Only print the last N lines ("all" prints everything)
        #[arg(long, default_value = "all")]
        tail: String,
    },
}

#[derive(Subcommand)]
enum NodeCommand {
    /// List registered execution nodes
    #[command(alias = "ls")]
    List,
    /// Delete one or more nodes by ip
    #[command(alias = "del")]
    Rm { ips: Vec<String> },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let paths = Paths {
        pipelines_dir: cli.pipelines_dir.clone(),
        images_store_dir: cli.images_store_dir.clone(),
        load_tmp_root: cli.load_tmp_root.clone(),
        runtime_state_root: cli.oci_runtime_root.clone(),
        nodes_dir: cli.nodes_dir.clone(),
    };

    // Ctrl-C cancels the running container and unwinds the command.
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, cancelling");
                cancel.cancel();
            }
        });
    }

    match run_command(cli.command, &paths, &cancel).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run_command(
    command: Command,
    paths: &Paths,
    cancel: &CancellationToken,
) -> allrun::Result<()> {
    match command {
        Command::Load {
            input,
            from_store,
            no_clean_tmp,
        } => {
            let loader = Loader::new(paths);
            if let Some(name) = from_store {
                return loader.load_from_store(&name, !no_clean_tmp, cancel).await;
            }
            let Some(archive) = input else {
                return Err(allrun::Error::InvalidInput(
                    "pass -i <archive> or --from-store <name>".into(),
                ));
            };
            loader.load_from_archive(&archive, !no_clean_tmp, cancel).await
        }

        Command::Run { pipeline, nodes } => {
            let data = std::fs::read(&nodes)
                .map_err(|e| allrun::Error::io_at(&nodes, e))?;
            let node_list = dag::parse_nodes_file(&data)?;
            let runner = Runner::new(paths);
            let task_id = runner.run(&pipeline, &node_list, None, cancel).await?;
            println!("taskId: {task_id}");
            Ok(())
        }

        Command::Pipeline { command } => match command {
            PipelineCommand::List => {
                for name in dag::list_pipeline_names(&paths.pipelines_dir)? {
                    println!("{name}");
                }
                Ok(())
            }
            PipelineCommand::Rm { names } => {
                if names.is_empty() {
                    return Err(allrun::Error::InvalidInput(
                        "pass at least one pipeline name".into(),
                    ));
                }
                for name in names {
                    dag::delete_pipeline(&paths.pipelines_dir, &name)?;
                    info!("deleted pipeline template {name}");
                }
                Ok(())
            }
        },

        Command::Image { command } => {
            let store = store::ImageStore::new(&paths.images_store_dir);
            match command {
                ImageCommand::List => {
                    for entry in store.list()? {
                        println!("{}\t{}", entry.name, entry.reference);
                    }
                    Ok(())
                }
                ImageCommand::Rm { names } => {
                    if names.is_empty() {
                        return Err(allrun::Error::InvalidInput(
                            "pass at least one image name".into(),
                        ));
                    }
                    for name in names {
                        store.delete(&name)?;
                        info!("deleted image {name}");
                    }
                    Ok(())
                }
                ImageCommand::Prune { all } => {
                    let pruned = if all {
                        store.prune_all()?
                    } else {
                        let referenced = store::referenced_image_names(&paths.pipelines_dir)?;
                        store.prune(&referenced)?
                    };
                    for name in &pruned {
                        info!("pruned image {name}");
                    }
                    info!("pruned {} image(s)", pruned.len());
                    Ok(())
                }
            }
        }

        Command::Task { command } => match command {
            TaskCommand::List { pipeline } => {
                let rows = task::list_running_tasks(&paths.ar_root(), pipeline.as_deref())?;
                if rows.is_empty() {
                    info!("no running pipeline tasks");
                    return Ok(());
                }
                println!("PIPELINE\tTASK_ID\tCONTAINER_ID\tSTEP");
                for row in rows {
                    println!(
                        "{}\t{}\t{}\t{}",
                        row.pipeline_name, row.task_id, row.container_id, row.step_name
                    );
                }
                Ok(())
            }
            TaskCommand::Stop { task } => {
                task::stop_task(&paths.ar_root(), &paths.runtime_state_root, &task)
            }
            TaskCommand::Resume { task } => {
                let runner = Runner::new(paths);
                runner.resume(&task, cancel).await?;
                info!("pipeline task resumed: {task}");
                Ok(())
            }
            TaskCommand::Log {
                task,
                container,
                follow,
                tail,
            } => {
                let tail = parse_tail(&tail)?;
                let mut stdout = std::io::stdout();
                task::show_task_logs(
                    &paths.ar_root(),
                    &task,
                    container.as_deref(),
                    follow,
                    tail,
                    &mut stdout,
                )?;
                stdout.flush().ok();
                Ok(())
            }
        },

        Command::Node { command } => match command {
            NodeCommand::List => {
                for node in nodes::list_nodes(&paths.nodes_dir)? {
                    println!(
                        "{}\t{}\t{}\t{}",
                        node.ip,
                        node.port,
                        node.username,
                        dag::labels_string(&node.labels)
                    );
                }
                Ok(())
            }
            NodeCommand::Rm { ips } => {
                if ips.is_empty() {
                    return Err(allrun::Error::InvalidInput(
                        "pass at least one node ip".into(),
                    ));
                }
                for ip in ips {
                    nodes::delete_node(&paths.nodes_dir, &ip)?;
                    info!("deleted node {ip}");
                }
                Ok(())
            }
        },
    }
}

/// `--tail N|all` -> `Some(N)` / `None`.
fn parse_tail(raw: &str) -> allrun::Result<Option<usize>> {
    let trimmed = raw.trim().to_ascii_lowercase();
    if trimmed.is_empty() || trimmed == "all" {
        return Ok(None);
    }
    trimmed
        .parse::<usize>()
        .map(Some)
        .map_err(|_| allrun::Error::InvalidInput(format!("invalid --tail value: {raw}")))
}
