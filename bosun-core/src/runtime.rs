use std::fmt;
use std::sync::Arc;

use bosun_model::{EntityId, EntityKind, JobMetrics, LogMetrics, ProcessMetrics, System};
use tracing::info;

use crate::bus::EventBus;
use crate::config::RuntimeConfig;
use crate::error::Result;
use crate::jobs::{Cloner, GitCloner, JobManager, ProjectJobs};
use crate::logbook::Logbook;
use crate::paths::ProjectPathResolver;
use crate::process::ProcessManager;
use crate::store::EntityStore;
use crate::workspaces::Workspaces;

const SYSTEM_KEY: &str = "system";

/// Owns one store and one bus and every component built on them.
///
/// Components receive their collaborators at construction; nothing here is
/// process-global, so several runtimes can coexist (tests rely on this).
pub struct Runtime {
    config: RuntimeConfig,
    store: Arc<EntityStore>,
    bus: Arc<EventBus>,
    system_id: EntityId,
    logbook: Arc<Logbook>,
    jobs: Arc<JobManager>,
    processes: Arc<ProcessManager>,
    workspaces: Arc<Workspaces>,
    projects: Arc<ProjectJobs>,
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.config)
            .field("system_id", &self.system_id)
            .field("store", &self.store)
            .field("bus", &self.bus)
            .finish_non_exhaustive()
    }
}

impl Runtime {
    /// Builds a runtime that clones projects with `git`.
    pub fn new(config: RuntimeConfig, resolver: Arc<dyn ProjectPathResolver>) -> Result<Self> {
        Self::with_cloner(config, resolver, Arc::new(GitCloner::default()))
    }

    pub fn with_cloner(
        config: RuntimeConfig,
        resolver: Arc<dyn ProjectPathResolver>,
        cloner: Arc<dyn Cloner>,
    ) -> Result<Self> {
        let store = Arc::new(EntityStore::new());
        let bus = Arc::new(EventBus::new(
            config.bus.history_cap,
            config.bus.subscriber_buffer,
        ));

        let system = System {
            id: EntityId::new(EntityKind::System, [SYSTEM_KEY]),
            job_metrics_id: EntityId::new(EntityKind::JobMetrics, [SYSTEM_KEY]),
            process_metrics_id: EntityId::new(EntityKind::ProcessMetrics, [SYSTEM_KEY]),
            log_metrics_id: EntityId::new(EntityKind::LogMetrics, [SYSTEM_KEY]),
            ..Default::default()
        };
        store.store(JobMetrics {
            id: system.job_metrics_id.clone(),
            ..Default::default()
        })?;
        store.store(ProcessMetrics {
            id: system.process_metrics_id.clone(),
            ..Default::default()
        })?;
        store.store(LogMetrics {
            id: system.log_metrics_id.clone(),
            ..Default::default()
        })?;
        store.store(system.clone())?;

        let logbook = Arc::new(Logbook::new(
            Arc::clone(&store),
            Arc::clone(&bus),
            system.id.clone(),
            system.log_metrics_id.clone(),
            config.log,
        ));
        let jobs = Arc::new(JobManager::new(
            Arc::clone(&store),
            Arc::clone(&bus),
            Arc::clone(&logbook),
            system.id.clone(),
            system.job_metrics_id.clone(),
            config.jobs,
        ));
        let processes = Arc::new(ProcessManager::new(
            Arc::clone(&store),
            Arc::clone(&bus),
            Arc::clone(&logbook),
            Arc::clone(&resolver),
            system.id.clone(),
            system.process_metrics_id.clone(),
            config.process.clone(),
        ));
        let workspaces = Arc::new(Workspaces::new(
            Arc::clone(&store),
            Arc::clone(&bus),
            system.id.clone(),
        ));
        let projects = Arc::new(ProjectJobs::new(
            Arc::clone(&store),
            Arc::clone(&bus),
            Arc::clone(&jobs),
            resolver,
            cloner,
        ));

        info!(
            target: "bosun::runtime",
            concurrency = jobs.concurrency(),
            history_cap = config.bus.history_cap,
            log_cap = config.log.cap,
            "runtime initialised"
        );

        Ok(Self {
            config,
            store,
            bus,
            system_id: system.id,
            logbook,
            jobs,
            processes,
            workspaces,
            projects,
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<EntityStore> {
        Arc::clone(&self.store)
    }

    pub fn bus(&self) -> Arc<EventBus> {
        Arc::clone(&self.bus)
    }

    pub fn system_id(&self) -> &EntityId {
        &self.system_id
    }

    pub fn system(&self) -> Result<System> {
        self.store.load(&self.system_id)
    }

    pub fn logbook(&self) -> Arc<Logbook> {
        Arc::clone(&self.logbook)
    }

    pub fn jobs(&self) -> Arc<JobManager> {
        Arc::clone(&self.jobs)
    }

    pub fn processes(&self) -> Arc<ProcessManager> {
        Arc::clone(&self.processes)
    }

    pub fn workspaces(&self) -> Arc<Workspaces> {
        Arc::clone(&self.workspaces)
    }

    pub fn projects(&self) -> Arc<ProjectJobs> {
        Arc::clone(&self.projects)
    }
}
