use serde::{Deserialize, Serialize};

use crate::ids::EntityId;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMetrics {
    pub id: EntityId,
    pub queued: u64,
    pub running: u64,
    pub done: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessMetrics {
    pub id: EntityId,
    pub running: u64,
    pub done: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogMetrics {
    pub id: EntityId,
    pub debug: u64,
    pub info: u64,
    pub warning: u64,
    pub error: u64,
}
