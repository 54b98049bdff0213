use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::EntityId;

/// Logical state of a supervised command.
///
/// A freshly allocated process carries `Done` until its first launch attempt
/// resolves it to `Running` or `Failed`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessStatus {
    Running,
    Stopping,
    #[default]
    Done,
    Failed,
}

impl ProcessStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessStatus::Done | ProcessStatus::Failed)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Process {
    pub id: EntityId,
    pub command: String,
    pub process_group_id: EntityId,
    /// Project whose checkout is the working directory.
    pub project_id: EntityId,
    pub status: ProcessStatus,
}

/// Batch of processes launched by one task invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessGroup {
    pub id: EntityId,
    pub created_at: DateTime<Utc>,
    pub task_id: String,
    /// Most recent first.
    pub process_ids: Vec<EntityId>,
}
