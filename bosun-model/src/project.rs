use serde::{Deserialize, Serialize};

use crate::ids::EntityId;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workspace {
    pub id: EntityId,
    pub slug: String,
    pub name: String,
    pub project_ids: Vec<EntityId>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: EntityId,
    pub slug: String,
    pub repository: String,
    pub branch: String,
    pub workspace_id: EntityId,
    /// Set while a clone job for this project is queued or running.
    pub is_cloning: bool,
}

impl Project {
    pub fn repository_name(&self) -> &str {
        repository_name(&self.repository)
    }
}

/// Last path segment of a git remote without its `.git` suffix.
pub fn repository_name(repository: &str) -> &str {
    let trimmed = repository.trim_end_matches('/');
    let name = trimmed.rsplit(['/', ':']).next().unwrap_or(trimmed);
    name.strip_suffix(".git").unwrap_or(name)
}
