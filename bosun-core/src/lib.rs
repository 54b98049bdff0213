//! # Bosun Core
//!
//! State and concurrency engine of the bosun workspace runtime.
//!
//! ## Overview
//!
//! - [`store`]: typed entity store with per-ID locks
//! - [`bus`]: topic-keyed publish/subscribe with bounded replay history
//! - [`relay`]: cursor pagination for list views
//! - [`logbook`]: user-visible log entries kept as entities
//! - [`jobs`]: bounded-concurrency job scheduler and the project clone job
//! - [`process`]: subprocess supervision in OS process groups
//! - [`runtime`]: wires all of the above around one store and one bus
//!
//! ## Example
//!
//! ```no_run
//! use std::path::PathBuf;
//! use std::sync::Arc;
//!
//! use bosun_core::{Runtime, RuntimeConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> bosun_core::Result<()> {
//! let resolver = |workspace: &str, repository: &str, _branch: &str| {
//!     PathBuf::from("/srv/checkouts").join(workspace).join(repository)
//! };
//! let runtime = Runtime::new(RuntimeConfig::default(), Arc::new(resolver))?;
//!
//! let cancel = CancellationToken::new();
//! let workers = tokio::spawn(runtime.jobs().work(cancel.clone()));
//!
//! runtime.jobs().add("Warm cache", None, async { Ok(()) })?;
//!
//! cancel.cancel();
//! let _ = workers.await;
//! # Ok(())
//! # }
//! ```

#![allow(missing_docs)]

/// Event bus with replay history
pub mod bus;

/// Runtime tuning knobs
pub mod config;

/// Error types
pub mod error;

/// Job scheduler and project jobs
pub mod jobs;

pub mod logbook;

/// Project directory resolution
pub mod paths;

/// Subprocess supervision
pub mod process;

/// Relay-style pagination
pub mod relay;

pub mod runtime;

/// Entity store
pub mod store;

pub mod workspaces;

pub use bus::{BusMessage, EventBus, Subscription, Topic, decode_message_id, encode_message_id};
pub use config::{BusConfig, JobsConfig, LogConfig, ProcessConfig, RuntimeConfig};
pub use error::{BosunError, Result};
pub use jobs::{Cloner, GitCloner, JobManager, JobWork, ProjectJobs};
pub use logbook::Logbook;
pub use paths::ProjectPathResolver;
pub use process::ProcessManager;
pub use relay::{Connection, Edge, PageArgs, PageInfo, paginate};
pub use runtime::Runtime;
pub use store::EntityStore;
pub use workspaces::Workspaces;
