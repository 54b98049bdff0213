//! Project checkout job.

use std::fmt;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use bosun_model::{EntityId, Project, Workspace};
use tokio::process::Command;
use tracing::{debug, error, info};

use super::JobManager;
use crate::bus::{EventBus, Topic};
use crate::error::{BosunError, Result};
use crate::paths::ProjectPathResolver;
use crate::store::EntityStore;

pub const CLONE_JOB_NAME: &str = "Clone";

/// Fetches a repository into a directory that does not exist yet.
#[async_trait]
pub trait Cloner: Send + Sync {
    async fn clone_repository(
        &self,
        repository: &str,
        branch: &str,
        directory: &Path,
    ) -> anyhow::Result<()>;
}

/// Runs `git clone --branch <branch> <repository> <directory>`.
#[derive(Debug, Clone)]
pub struct GitCloner {
    program: String,
}

impl Default for GitCloner {
    fn default() -> Self {
        Self {
            program: "git".to_string(),
        }
    }
}

impl GitCloner {
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl Cloner for GitCloner {
    async fn clone_repository(
        &self,
        repository: &str,
        branch: &str,
        directory: &Path,
    ) -> anyhow::Result<()> {
        let output = Command::new(&self.program)
            .arg("clone")
            .arg("--branch")
            .arg(branch)
            .arg(repository)
            .arg(directory)
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("failed to launch {}", self.program))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "{} clone exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            );
        }
        Ok(())
    }
}

/// Jobs that operate on project checkouts.
pub struct ProjectJobs {
    store: Arc<EntityStore>,
    bus: Arc<EventBus>,
    jobs: Arc<JobManager>,
    resolver: Arc<dyn ProjectPathResolver>,
    cloner: Arc<dyn Cloner>,
}

impl fmt::Debug for ProjectJobs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProjectJobs")
            .field("jobs", &self.jobs)
            .finish_non_exhaustive()
    }
}

impl ProjectJobs {
    pub fn new(
        store: Arc<EntityStore>,
        bus: Arc<EventBus>,
        jobs: Arc<JobManager>,
        resolver: Arc<dyn ProjectPathResolver>,
        cloner: Arc<dyn Cloner>,
    ) -> Self {
        Self {
            store,
            bus,
            jobs,
            resolver,
            cloner,
        }
    }

    /// Queues a clone of the project's repository.
    ///
    /// Fails with [`BosunError::Duplicate`] while a previous clone of the same
    /// project is queued or running.
    pub fn clone_project(&self, project_id: &EntityId) -> Result<EntityId> {
        let workspace_id = self.store.lock_fallible(project_id, |mut project: Project| {
            if project.is_cloning {
                return Err(BosunError::Duplicate(project_id.clone()));
            }
            let workspace_id = project.workspace_id.clone();
            project.is_cloning = true;
            self.store.store(project)?;
            self.bus.publish(Topic::ProjectUpserted, project_id.clone());
            Ok(workspace_id)
        })?;
        self.bus.publish(Topic::WorkspaceUpserted, workspace_id.clone());

        let task = CloneTask {
            store: Arc::clone(&self.store),
            bus: Arc::clone(&self.bus),
            resolver: Arc::clone(&self.resolver),
            cloner: Arc::clone(&self.cloner),
            project_id: project_id.clone(),
            workspace_id,
        };

        let queued = task.clone();
        match self
            .jobs
            .add(CLONE_JOB_NAME, Some(project_id.clone()), async move {
                let result = queued.run().await;
                queued.finish();
                result
            }) {
            Ok(job_id) => Ok(job_id),
            Err(err) => {
                task.finish();
                Err(err)
            }
        }
    }
}

#[derive(Clone)]
struct CloneTask {
    store: Arc<EntityStore>,
    bus: Arc<EventBus>,
    resolver: Arc<dyn ProjectPathResolver>,
    cloner: Arc<dyn Cloner>,
    project_id: EntityId,
    workspace_id: EntityId,
}

impl CloneTask {
    async fn run(&self) -> anyhow::Result<()> {
        let project: Project = self.store.load(&self.project_id)?;
        let workspace: Workspace = self.store.load(&self.workspace_id)?;
        let directory =
            self.resolver
                .project_path(&workspace.slug, &project.repository, &project.branch);

        if tokio::fs::try_exists(&directory).await.unwrap_or(false) {
            return Err(BosunError::AlreadyCloned(self.project_id.clone()).into());
        }

        info!(
            target: "bosun::jobs",
            project = %self.project_id,
            repository = %project.repository,
            branch = %project.branch,
            directory = %directory.display(),
            "cloning project"
        );
        self.cloner
            .clone_repository(&project.repository, &project.branch, &directory)
            .await
            .with_context(|| format!("cloning {}", project.repository))?;

        debug!(target: "bosun::jobs", project = %self.project_id, "clone finished");
        Ok(())
    }

    /// Clears the in-progress flag and republishes the project.
    fn finish(&self) {
        let cleared = self.store.lock_fallible(&self.project_id, |mut project: Project| {
            project.is_cloning = false;
            self.store.store(project)?;
            self.bus.publish(Topic::ProjectUpserted, self.project_id.clone());
            Ok::<_, BosunError>(())
        });
        if let Err(err) = cleared {
            error!(target: "bosun::jobs", project = %self.project_id, error = %err, "failed to clear cloning flag");
        }
        self.bus
            .publish(Topic::WorkspaceUpserted, self.workspace_id.clone());
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::Duration;

    use bosun_model::JobStatus;
    use parking_lot::Mutex;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::config::RuntimeConfig;
    use crate::runtime::Runtime;

    #[derive(Default)]
    struct FakeCloner {
        calls: Mutex<Vec<(String, String, PathBuf)>>,
    }

    #[async_trait]
    impl Cloner for FakeCloner {
        async fn clone_repository(
            &self,
            repository: &str,
            branch: &str,
            directory: &Path,
        ) -> anyhow::Result<()> {
            self.calls
                .lock()
                .push((repository.into(), branch.into(), directory.to_path_buf()));
            tokio::fs::create_dir_all(directory).await?;
            Ok(())
        }
    }

    struct Fixture {
        runtime: Runtime,
        cloner: Arc<FakeCloner>,
        project_id: EntityId,
        _root: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let root = tempfile::tempdir().expect("tempdir");
        let base = root.path().to_path_buf();
        let cloner = Arc::new(FakeCloner::default());
        let resolver = move |workspace: &str, repository: &str, _branch: &str| {
            let name = repository.rsplit('/').next().unwrap_or(repository);
            base.join(workspace).join(name)
        };
        let runtime = Runtime::with_cloner(
            RuntimeConfig::default(),
            Arc::new(resolver),
            Arc::clone(&cloner) as Arc<dyn Cloner>,
        )
        .expect("runtime");

        let workspace_id = runtime
            .workspaces()
            .upsert_workspace("acme", "Acme")
            .expect("workspace");
        let project_id = runtime
            .workspaces()
            .upsert_project(&workspace_id, "api", "https://example.com/api", "main")
            .expect("project");

        Fixture {
            runtime,
            cloner,
            project_id,
            _root: root,
        }
    }

    async fn wait_terminal(runtime: &Runtime, id: &EntityId) -> JobStatus {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let status = runtime.jobs().job(id).expect("job").status;
                if status.is_terminal() {
                    return status;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("job never finished")
    }

    #[test]
    fn second_clone_while_pending_is_duplicate() {
        let Fixture {
            runtime,
            project_id,
            _root,
            ..
        } = fixture();

        runtime.projects().clone_project(&project_id).expect("first clone");
        assert!(runtime.workspaces().project(&project_id).expect("load").is_cloning);

        assert!(matches!(
            runtime.projects().clone_project(&project_id),
            Err(BosunError::Duplicate(id)) if id == project_id
        ));
        assert_eq!(runtime.jobs().metrics().queued, 1);
    }

    #[tokio::test]
    async fn clone_runs_cloner_and_clears_flag() {
        let Fixture {
            runtime,
            cloner,
            project_id,
            _root,
        } = fixture();
        let cancel = CancellationToken::new();
        let worker = tokio::spawn(runtime.jobs().work(cancel.clone()));

        let job_id = runtime.projects().clone_project(&project_id).expect("clone");
        assert_eq!(wait_terminal(&runtime, &job_id).await, JobStatus::Done);

        let job = runtime.jobs().job(&job_id).expect("job");
        assert_eq!(job.name, CLONE_JOB_NAME);
        assert_eq!(job.project_id.as_ref(), Some(&project_id));
        assert!(!runtime.workspaces().project(&project_id).expect("load").is_cloning);

        let calls = cloner.calls.lock().clone();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "https://example.com/api");
        assert_eq!(calls[0].1, "main");
        assert!(calls[0].2.ends_with("acme/api"));

        // The checkout now exists, so cloning again fails inside the job.
        let again = runtime.projects().clone_project(&project_id).expect("clone");
        assert_eq!(wait_terminal(&runtime, &again).await, JobStatus::Failed);
        assert!(!runtime.workspaces().project(&project_id).expect("load").is_cloning);
        assert_eq!(cloner.calls.lock().len(), 1);

        cancel.cancel();
        worker.await.expect("worker");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn git_cloner_reports_failed_exit() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = GitCloner::with_program("false")
            .clone_repository("repo", "main", &dir.path().join("out"))
            .await
            .expect_err("false always fails");
        assert!(err.to_string().contains("exited with"));
    }
}
