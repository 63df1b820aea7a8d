//! Content-addressed workspace management for heterogeneous datasets.
//!
//! Every *job* is identified by the hash of its *state point*, an
//! arbitrary JSON mapping of parameters, and lives in a workspace
//! directory named by that id. Initializing a job at a given state point
//! therefore deterministically yields the same on-disk directory,
//! regardless of who creates it or when.
//!
//! ```no_run
//! use serde_json::json;
//! use signac::Project;
//!
//! # fn main() -> signac::Result<()> {
//! let project = Project::init("my_project")?;
//! let statepoint = json!({"temperature": 300, "pressure": 1.0});
//! let job = project.open_job(statepoint.as_object().unwrap())?;
//! job.init(false)?;
//!
//! let mut document = job.document()?;
//! document.insert("converged", json!(true))?;
//!
//! for job in project.find_jobs_from_str("temperature 300")?.iter()? {
//!     println!("{} -> {}", job.id(), job.path().display());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! The crate is a synchronous, blocking library. Workspaces on a shared
//! filesystem are safe to read concurrently; concurrent writers to the
//! same job must coordinate externally.

pub mod config;
mod cursor;
mod error;
pub mod export;
mod job;
pub mod migrate;
mod project;
mod schema;
mod statepoint;
pub mod sync;
pub mod view;

pub use config::{locate_config_dir, LocatedConfig, ProjectConfig};
pub use cursor::JobsCursor;
pub use error::{Error, Result};
pub use export::ExportPath;
pub use job::{Job, WorkdirGuard, FN_DOCUMENT};
pub use migrate::{apply_migrations, SCHEMA_VERSION};
pub use project::{Project, TemporaryProject, FN_CACHE, FN_PROJECT_DOCUMENT};
pub use schema::ProjectSchema;
pub use statepoint::{StatePointFile, FN_STATE_POINT};
pub use sync::{DocStrategy, FileStrategy, SyncOptions, SyncStats};

// The identifier and query layers are part of the public surface.
pub use signac_ids::{calc_id, JobId, JOB_ID_LENGTH};
pub use signac_query::SearchIndex;
pub use signac_synced::{buffered, BufferError, BufferGuard, BufferedFileError, SyncedJson};
