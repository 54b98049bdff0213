//! Registration of workspaces and their git-backed projects.

use std::sync::Arc;

use bosun_model::{EntityId, EntityKind, Project, System, Workspace};

use crate::bus::{EventBus, Topic};
use crate::error::{BosunError, Result};
use crate::relay::{Connection, PageArgs, paginate};
use crate::store::EntityStore;

#[derive(Debug)]
pub struct Workspaces {
    store: Arc<EntityStore>,
    bus: Arc<EventBus>,
    system_id: EntityId,
}

impl Workspaces {
    pub fn new(store: Arc<EntityStore>, bus: Arc<EventBus>, system_id: EntityId) -> Self {
        Self {
            store,
            bus,
            system_id,
        }
    }

    pub fn workspace_id(slug: &str) -> EntityId {
        EntityId::new(EntityKind::Workspace, [slug])
    }

    pub fn project_id(workspace_slug: &str, project_slug: &str) -> EntityId {
        EntityId::new(EntityKind::Project, [workspace_slug, project_slug])
    }

    /// Creates the workspace or renames an existing one.
    pub fn upsert_workspace(&self, slug: &str, name: &str) -> Result<EntityId> {
        if slug.is_empty() {
            return Err(BosunError::InvalidArgument("workspace slug is empty".into()));
        }
        let id = Self::workspace_id(slug);

        let created = self.store.lock_or_create_fallible(&id, |mut workspace: Workspace| {
            let created = workspace.slug.is_empty();
            workspace.slug = slug.to_string();
            workspace.name = name.to_string();
            self.store.store(workspace)?;
            self.bus.publish(Topic::WorkspaceUpserted, id.clone());
            Ok::<_, BosunError>(created)
        })?;

        if created {
            self.store
                .lock_or_create_fallible(&self.system_id, |mut system: System| {
                    system.workspace_ids.push(id.clone());
                    self.store.store(system)
                })?;
        }

        Ok(id)
    }

    /// Creates or updates a project inside an existing workspace.
    ///
    /// An in-progress clone keeps its `is_cloning` flag.
    pub fn upsert_project(
        &self,
        workspace_id: &EntityId,
        slug: &str,
        repository: &str,
        branch: &str,
    ) -> Result<EntityId> {
        if slug.is_empty() || repository.is_empty() {
            return Err(BosunError::InvalidArgument(
                "project slug and repository are required".into(),
            ));
        }
        let workspace: Workspace = self.store.load(workspace_id)?;
        let id = Self::project_id(&workspace.slug, slug);

        self.store.lock_or_create_fallible(&id, |mut project: Project| {
            project.slug = slug.to_string();
            project.repository = repository.to_string();
            project.branch = branch.to_string();
            project.workspace_id = workspace_id.clone();
            self.store.store(project)?;
            self.bus.publish(Topic::ProjectUpserted, id.clone());
            Ok::<_, BosunError>(())
        })?;

        self.store
            .lock_fallible(workspace_id, |mut workspace: Workspace| {
                if !workspace.project_ids.contains(&id) {
                    workspace.project_ids.push(id.clone());
                    self.store.store(workspace)?;
                    self.bus.publish(Topic::WorkspaceUpserted, workspace_id.clone());
                }
                Ok::<_, BosunError>(())
            })?;

        Ok(id)
    }

    pub fn workspace(&self, id: &EntityId) -> Result<Workspace> {
        self.store.load(id)
    }

    pub fn project(&self, id: &EntityId) -> Result<Project> {
        self.store.load(id)
    }

    /// Workspaces in registration order.
    pub fn workspaces(&self, args: &PageArgs) -> Result<Connection<Workspace>> {
        let system: System = self.store.load(&self.system_id)?;
        let workspaces = system
            .workspace_ids
            .iter()
            .map(|id| self.store.load::<Workspace>(id))
            .collect::<Result<Vec<_>>>()?;
        paginate(workspaces, |workspace| workspace.id.to_string(), args)
    }

    pub fn projects(&self, workspace_id: &EntityId, args: &PageArgs) -> Result<Connection<Project>> {
        let workspace: Workspace = self.store.load(workspace_id)?;
        let projects = workspace
            .project_ids
            .iter()
            .map(|id| self.store.load::<Project>(id))
            .collect::<Result<Vec<_>>>()?;
        paginate(projects, |project| project.id.to_string(), args)
    }
}
