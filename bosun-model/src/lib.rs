//! Entity definitions and the self-describing ID codec shared by bosun crates.
#![allow(missing_docs)]

pub mod error;
pub mod ids;
pub mod job;
pub mod log;
pub mod metrics;
pub mod node;
pub mod process;
pub mod project;
pub mod system;

pub use error::{IdError, Result as IdResult};
pub use ids::{DecodedId, EntityId, EntityKind};
pub use job::{Job, JobStatus};
pub use log::{LogEntry, LogLevel};
pub use metrics::{JobMetrics, LogMetrics, ProcessMetrics};
pub use node::{Entity, Node};
pub use process::{Process, ProcessGroup, ProcessStatus};
pub use project::{Project, Workspace, repository_name};
pub use system::System;
