//! # allrun
//!
//! **Pipeline execution core for OCI-packaged batch pipelines**
//!
//! A pipeline ships as an OCI image. Loading it runs the image's own
//! self-install container, which drops a template and its child images
//! onto the host; running it executes the template's step DAG, one
//! short-lived container per step, against youki's `libcontainer`.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                            allrun                                │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  Loader                          Runner                          │
//! │  archive ─► rootfs ─► bundle     template ─► topo order ─► steps │
//! │  ─► self-install container       ─► one container per step       │
//! │  ─► import child images          ─► pipeline.json after each     │
//! │                                     transition                   │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  ImageStore (OCI layouts)   │  driver::run_one_shot (libcontainer)│
//! │  archive reader (tar/gz)    │  sweeper (prefix kill + destroy)   │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Durability
//!
//! Every status transition of a task is persisted to the run directory's
//! `pipeline.json` before the next step starts, so a crashed or stopped
//! task can be resumed: `resume` re-runs from the first step that is not
//! `success`. Steps are therefore executed at-least-once and must
//! tolerate re-runs.
//!
//! ## Platform
//!
//! Container execution and sweeping require Linux (user, pid, ipc, uts,
//! mount, and network namespaces plus cgroups). On other targets those
//! entry points return `Error::NotSupported`; everything that only touches
//! the filesystem (store, templates, task records) works anywhere.

pub mod archive;
pub mod bundle;
pub mod config;
pub mod constants;
pub mod dag;
pub mod driver;
pub mod error;
pub mod image;
pub mod loader;
pub mod nodes;
pub mod rootfs;
pub mod runner;
pub mod store;
pub mod sweeper;
pub mod task;

pub use config::Paths;
pub use dag::{RunNode, StepStatus, TaskRecord, TemplateStep};
pub use error::{Error, Result};
pub use image::Image;
pub use loader::Loader;
pub use runner::Runner;
pub use store::ImageStore;
