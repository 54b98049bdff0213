use serde::{Deserialize, Serialize};

use crate::ids::EntityId;

/// Root entity of a run. Every list is ordered most recent first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct System {
    pub id: EntityId,
    pub job_ids: Vec<EntityId>,
    pub process_group_ids: Vec<EntityId>,
    pub log_entry_ids: Vec<EntityId>,
    pub workspace_ids: Vec<EntityId>,
    pub job_metrics_id: EntityId,
    pub process_metrics_id: EntityId,
    pub log_metrics_id: EntityId,
}
