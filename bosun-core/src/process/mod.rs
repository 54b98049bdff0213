//! Supervision of user commands running as OS subprocesses.
//!
//! Each command runs through the configured shell in its own process group so
//! that stopping it also reaches everything it forked. A reaper task per
//! process records the exit and removes the live handle.

mod output;

use std::fmt;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bosun_model::{
    EntityId, EntityKind, LogLevel, Process, ProcessGroup, ProcessMetrics, ProcessStatus, Project,
    System, Workspace,
};
use chrono::Utc;
use dashmap::DashMap;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::{EventBus, Topic};
use crate::config::ProcessConfig;
use crate::error::{BosunError, Result};
use crate::logbook::Logbook;
use crate::paths::ProjectPathResolver;
use crate::relay::{Connection, PageArgs, paginate};
use crate::store::EntityStore;

use self::output::forward_lines;

/// How long the reaper gets to record an exit after the group is killed.
const KILL_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopSignal {
    Terminate,
    Kill,
}

#[derive(Debug, Clone, Copy)]
struct LiveProcess {
    pid: u32,
}

#[derive(Default)]
struct ProcessCounters {
    running: AtomicU64,
    done: AtomicU64,
    failed: AtomicU64,
}

impl ProcessCounters {
    fn terminal(&self, status: ProcessStatus) -> Option<&AtomicU64> {
        match status {
            ProcessStatus::Done => Some(&self.done),
            ProcessStatus::Failed => Some(&self.failed),
            ProcessStatus::Running | ProcessStatus::Stopping => None,
        }
    }
}

pub struct ProcessManager {
    store: Arc<EntityStore>,
    bus: Arc<EventBus>,
    logbook: Arc<Logbook>,
    resolver: Arc<dyn ProjectPathResolver>,
    system_id: EntityId,
    metrics_id: EntityId,
    config: ProcessConfig,
    next_id: AtomicU64,
    live: DashMap<EntityId, LiveProcess>,
    counters: ProcessCounters,
}

impl fmt::Debug for ProcessManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessManager")
            .field("system_id", &self.system_id)
            .field("config", &self.config)
            .field("live", &self.live.len())
            .field("metrics", &self.metrics())
            .finish()
    }
}

impl ProcessManager {
    pub fn new(
        store: Arc<EntityStore>,
        bus: Arc<EventBus>,
        logbook: Arc<Logbook>,
        resolver: Arc<dyn ProjectPathResolver>,
        system_id: EntityId,
        metrics_id: EntityId,
        config: ProcessConfig,
    ) -> Self {
        Self {
            store,
            bus,
            logbook,
            resolver,
            system_id,
            metrics_id,
            config,
            next_id: AtomicU64::new(1),
            live: DashMap::new(),
            counters: ProcessCounters::default(),
        }
    }

    fn allocate_id(&self, kind: EntityKind) -> EntityId {
        EntityId::new(kind, [self.next_id.fetch_add(1, Ordering::Relaxed).to_string()])
    }

    pub fn create_group(&self, task_id: impl Into<String>) -> Result<EntityId> {
        let id = self.allocate_id(EntityKind::ProcessGroup);

        self.store.lock_or_create_fallible(&id, |_: ProcessGroup| {
            self.store.store(ProcessGroup {
                id: id.clone(),
                created_at: Utc::now(),
                task_id: task_id.into(),
                process_ids: Vec::new(),
            })?;
            self.bus.publish(Topic::ProcessGroupUpserted, id.clone());
            Ok::<_, BosunError>(())
        })?;

        self.store
            .lock_or_create_fallible(&self.system_id, |mut system: System| {
                system.process_group_ids.insert(0, id.clone());
                self.store.store(system)
            })?;

        Ok(id)
    }

    /// Adds a process to `group_id` and launches it without waiting for it
    /// to finish.
    ///
    /// A launch failure is not an error here: the process ends up `Failed`.
    /// Must be called from within a Tokio runtime.
    pub fn run(
        self: &Arc<Self>,
        command: impl Into<String>,
        group_id: &EntityId,
        project_id: &EntityId,
    ) -> Result<EntityId> {
        let id = self.allocate_id(EntityKind::Process);
        let command = command.into();

        self.store
            .lock_fallible(group_id, |mut group: ProcessGroup| {
                self.store.store(Process {
                    id: id.clone(),
                    command,
                    process_group_id: group_id.clone(),
                    project_id: project_id.clone(),
                    status: ProcessStatus::default(),
                })?;
                group.process_ids.insert(0, id.clone());
                self.store.store(group)
            })?;

        self.store
            .lock_fallible(&id, |process: Process| self.launch(process))?;
        Ok(id)
    }

    /// Relaunches a process that is `Done` or `Failed`.
    pub fn start(self: &Arc<Self>, id: &EntityId) -> Result<()> {
        self.store.lock_fallible(id, |process: Process| {
            if !process.status.is_terminal() {
                return Err(BosunError::NotStopped(id.clone()));
            }
            if let Some(counter) = self.counters.terminal(process.status) {
                counter.fetch_sub(1, Ordering::Relaxed);
            }
            self.launch(process)
        })
    }

    /// Signals the process group of a running process.
    ///
    /// The process stays `Stopping` until the reaper observes the exit. A
    /// group still alive after the stop timeout is killed outright. Must be
    /// called from within a Tokio runtime.
    pub fn stop(self: &Arc<Self>, id: &EntityId) -> Result<()> {
        self.store.lock_fallible(id, |mut process: Process| {
            if process.status != ProcessStatus::Running {
                return Err(BosunError::NotRunning(id.clone()));
            }
            let live = self
                .live
                .get(id)
                .map(|entry| *entry.value())
                .ok_or_else(|| BosunError::Internal(format!("no live handle for {id}")))?;

            process.status = ProcessStatus::Stopping;
            let group_id = process.process_group_id.clone();
            self.store.store(process)?;
            self.bus.publish(Topic::ProcessUpserted, id.clone());
            self.bus.publish(Topic::ProcessGroupUpserted, group_id);

            debug!(target: "bosun::process", process = %id, pid = live.pid, "signalling process group");
            self.kill_after_timeout(id.clone(), live.pid);
            signal_group(live.pid, StopSignal::Terminate)
        })
    }

    fn kill_after_timeout(self: &Arc<Self>, id: EntityId, pid: u32) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(manager.config.stop_timeout()).await;
            // A restart gets a new pid, so only the stopped launch is killed.
            let lingering = manager.live.get(&id).is_some_and(|live| live.pid == pid);
            if !lingering {
                return;
            }

            warn!(target: "bosun::process", process = %id, pid, "process ignored SIGTERM; killing its group");
            manager
                .logbook
                .warning_with_owner(&id, "process did not stop in time; killing it");
            if let Err(err) = signal_group(pid, StopSignal::Kill) {
                error!(target: "bosun::process", process = %id, error = %err, "failed to kill process group");
            }
        });
    }

    /// Stops every live process and waits for each to exit. Groups that
    /// outlast the stop timeout are killed; `cancel` ends the wait early.
    pub async fn clean(self: &Arc<Self>, cancel: CancellationToken) {
        let ids: Vec<EntityId> = self.live.iter().map(|entry| entry.key().clone()).collect();
        if ids.is_empty() {
            return;
        }
        info!(target: "bosun::process", count = ids.len(), "stopping live processes");

        // Subscriptions replay from here so exits racing the stop are seen.
        let since = self.bus.last_sequence();
        let mut waits = Vec::with_capacity(ids.len());

        for id in ids {
            self.logbook.info_with_owner(&id, "stopping process");
            if let Err(err) = self.stop(&id) {
                self.logbook
                    .error_with_owner(&id, format!("failed to stop process: {err}"));
            }
            waits.push(self.wait_terminal(id, since, cancel.clone()));
        }

        futures::future::join_all(waits).await;
    }

    async fn wait_terminal(&self, id: EntityId, since: u64, cancel: CancellationToken) {
        let reached = cancel.child_token();

        let store = Arc::clone(&self.store);
        let watched = id.clone();
        let notify = reached.clone();
        let subscription = self.bus.subscribe(
            reached.clone(),
            Topic::ProcessUpserted,
            since,
            move |message| {
                if message.payload == watched && is_terminal(&store, &watched) {
                    notify.cancel();
                }
            },
        );

        if is_terminal(&self.store, &id) {
            reached.cancel();
        }

        let budget = self.config.stop_timeout() + KILL_GRACE;
        let timed_out = tokio::time::timeout(budget, reached.cancelled())
            .await
            .is_err();
        subscription.unsubscribe().await;

        if is_terminal(&self.store, &id) {
            self.logbook.info_with_owner(&id, "process stopped");
        } else if timed_out {
            warn!(target: "bosun::process", process = %id, "process did not stop in time");
            self.logbook
                .warning_with_owner(&id, "process did not stop in time");
        } else {
            warn!(target: "bosun::process", process = %id, "stopped waiting for process before it exited");
            self.logbook
                .warning_with_owner(&id, "stopped waiting for process before it exited");
        }
    }

    pub fn process(&self, id: &EntityId) -> Result<Process> {
        self.store.load(id)
    }

    pub fn group(&self, id: &EntityId) -> Result<ProcessGroup> {
        self.store.load(id)
    }

    /// Process groups, most recently created first.
    pub fn groups(&self, args: &PageArgs) -> Result<Connection<ProcessGroup>> {
        let system: System = self.store.load(&self.system_id)?;
        let groups = system
            .process_group_ids
            .iter()
            .map(|id| self.store.load::<ProcessGroup>(id))
            .collect::<Result<Vec<_>>>()?;
        paginate(groups, |group| group.id.to_string(), args)
    }

    /// Processes of a group, most recently added first.
    pub fn processes(&self, group_id: &EntityId, args: &PageArgs) -> Result<Connection<Process>> {
        let group: ProcessGroup = self.store.load(group_id)?;
        let processes = group
            .process_ids
            .iter()
            .map(|id| self.store.load::<Process>(id))
            .collect::<Result<Vec<_>>>()?;
        paginate(processes, |process| process.id.to_string(), args)
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    pub fn metrics(&self) -> ProcessMetrics {
        ProcessMetrics {
            id: self.metrics_id.clone(),
            running: self.counters.running.load(Ordering::Relaxed),
            done: self.counters.done.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    /// Spawns the command of `process`. Runs under the process lock.
    fn launch(self: &Arc<Self>, mut process: Process) -> Result<()> {
        let id = process.id.clone();
        let spawned = self.spawn(&process);

        match &spawned {
            Ok(_) => {
                process.status = ProcessStatus::Running;
                self.counters.running.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                process.status = ProcessStatus::Failed;
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
            }
        }

        let group_id = process.process_group_id.clone();
        let project_id = process.project_id.clone();
        self.store.store(process)?;
        self.bus.publish(Topic::ProcessUpserted, id.clone());
        self.bus.publish(Topic::ProcessGroupUpserted, group_id);
        self.publish_metrics_logged();

        match spawned {
            Ok(child) => {
                self.logbook.info_with_owner(&project_id, "process is running");
                self.supervise(id, project_id, child);
            }
            Err(err) => {
                error!(target: "bosun::process", process = %id, error = %err, "process failed to start");
                self.logbook
                    .error_with_owner(&project_id, format!("process failed because {err}"));
            }
        }
        Ok(())
    }

    fn spawn(&self, process: &Process) -> Result<Child> {
        let project: Project = self.store.load(&process.project_id)?;
        let workspace: Workspace = self.store.load(&project.workspace_id)?;
        let directory =
            self.resolver
                .project_path(&workspace.slug, &project.repository, &project.branch);

        let mut command = Command::new(&self.config.shell);
        command
            .args(&self.config.shell_args)
            .arg(&process.command)
            .current_dir(&directory)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        command.process_group(0);

        debug!(
            target: "bosun::process",
            process = %process.id,
            command = %process.command,
            directory = %directory.display(),
            "spawning"
        );
        Ok(command.spawn()?)
    }

    /// Records the live handle and starts output forwarding and reaping.
    fn supervise(self: &Arc<Self>, id: EntityId, owner_id: EntityId, mut child: Child) {
        let Some(pid) = child.id() else {
            warn!(target: "bosun::process", process = %id, "spawned child has no pid");
            return;
        };
        self.live.insert(id.clone(), LiveProcess { pid });

        let delay = self.config.line_delay();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(
                stdout,
                Arc::clone(&self.logbook),
                LogLevel::Info,
                owner_id.clone(),
                delay,
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(
                stderr,
                Arc::clone(&self.logbook),
                LogLevel::Warning,
                owner_id.clone(),
                delay,
            ));
        }

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let exit = child.wait().await;
            manager.reap(&id, &owner_id, exit);
        });
    }

    fn reap(&self, id: &EntityId, owner_id: &EntityId, exit: std::io::Result<ExitStatus>) {
        let outcome = self.store.lock_fallible(id, |mut process: Process| {
            self.live.remove(id);

            process.status = match &exit {
                Ok(status) if status.success() => ProcessStatus::Done,
                _ => ProcessStatus::Failed,
            };
            self.counters.running.fetch_sub(1, Ordering::Relaxed);
            if let Some(counter) = self.counters.terminal(process.status) {
                counter.fetch_add(1, Ordering::Relaxed);
            }

            let group_id = process.process_group_id.clone();
            let status = process.status;
            self.store.store(process)?;
            self.bus.publish(Topic::ProcessUpserted, id.clone());
            self.bus.publish(Topic::ProcessGroupUpserted, group_id);
            Ok::<_, BosunError>(status)
        });

        match (outcome, exit) {
            (Ok(ProcessStatus::Done), _) => {
                debug!(target: "bosun::process", process = %id, "process done");
                self.logbook.info_with_owner(owner_id, "process done");
            }
            (Ok(_), Ok(status)) => {
                debug!(target: "bosun::process", process = %id, %status, "process failed");
                self.logbook
                    .error_with_owner(owner_id, format!("process failed because {status}"));
            }
            (Ok(_), Err(err)) => {
                error!(target: "bosun::process", process = %id, error = %err, "failed to wait for process");
                self.logbook
                    .error_with_owner(owner_id, format!("process failed because {err}"));
            }
            (Err(err), _) => {
                error!(target: "bosun::process", process = %id, error = %err, "failed to record process exit");
            }
        }

        self.publish_metrics_logged();
    }

    fn publish_metrics_logged(&self) {
        let published = self
            .store
            .lock_or_create_fallible(&self.metrics_id, |_: ProcessMetrics| {
                self.store.store(self.metrics())?;
                self.bus
                    .publish(Topic::ProcessMetricsUpdated, self.metrics_id.clone());
                Ok::<_, BosunError>(())
            });
        if let Err(err) = published {
            error!(target: "bosun::process", error = %err, "failed to publish process metrics");
        }
    }
}

fn is_terminal(store: &EntityStore, id: &EntityId) -> bool {
    store
        .load::<Process>(id)
        .map(|process| process.status.is_terminal())
        .unwrap_or(true)
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: StopSignal) -> Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let pgid = i32::try_from(pid)
        .map_err(|_| BosunError::Internal(format!("pid {pid} out of range")))?;

    // Non-interactive shells ignore SIGINT in background children, so
    // terminate instead of interrupt.
    let signal = match signal {
        StopSignal::Terminate => Signal::SIGTERM,
        StopSignal::Kill => Signal::SIGKILL,
    };
    match killpg(Pid::from_raw(pgid), signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(err) => Err(err.into()),
    }
}

#[cfg(not(unix))]
fn signal_group(pid: u32, signal: StopSignal) -> Result<()> {
    Err(BosunError::Internal(format!(
        "cannot send {signal:?} to process group of {pid} on this platform"
    )))
}
