//! Bounded-concurrency job scheduler.
//!
//! Jobs move through `Queued -> Running -> Done | Failed`. Every transition is
//! stored under the job's lock, announced on [`Topic::JobUpserted`] and
//! reflected in the [`JobMetrics`] singleton.

pub mod clone;

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bosun_model::{EntityId, EntityKind, Job, JobMetrics, JobStatus, System};
use chrono::Utc;
use futures::FutureExt;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::bus::{EventBus, Topic};
use crate::config::JobsConfig;
use crate::error::{BosunError, Result};
use crate::logbook::Logbook;
use crate::relay::{Connection, PageArgs, paginate};
use crate::store::EntityStore;

pub use clone::{Cloner, GitCloner, ProjectJobs};

/// Unit of work executed by a job. Errors mark the job `Failed`.
pub type JobWork = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'static>>;

struct QueuedJob {
    id: EntityId,
    name: String,
    project_id: Option<EntityId>,
    work: JobWork,
}

#[derive(Default)]
struct JobCounters {
    queued: AtomicU64,
    running: AtomicU64,
    done: AtomicU64,
    failed: AtomicU64,
}

pub struct JobManager {
    store: Arc<EntityStore>,
    bus: Arc<EventBus>,
    logbook: Arc<Logbook>,
    system_id: EntityId,
    metrics_id: EntityId,
    concurrency: usize,
    queue_tx: mpsc::UnboundedSender<QueuedJob>,
    queue_rx: Arc<Mutex<mpsc::UnboundedReceiver<QueuedJob>>>,
    next_id: AtomicU64,
    counters: JobCounters,
}

impl fmt::Debug for JobManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobManager")
            .field("system_id", &self.system_id)
            .field("concurrency", &self.concurrency)
            .field("metrics", &self.metrics())
            .finish()
    }
}

impl JobManager {
    pub fn new(
        store: Arc<EntityStore>,
        bus: Arc<EventBus>,
        logbook: Arc<Logbook>,
        system_id: EntityId,
        metrics_id: EntityId,
        config: JobsConfig,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        Self {
            store,
            bus,
            logbook,
            system_id,
            metrics_id,
            concurrency: config.concurrency.max(1),
            queue_tx,
            queue_rx: Arc::new(Mutex::new(queue_rx)),
            next_id: AtomicU64::new(1),
            counters: JobCounters::default(),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Records a `Queued` job and hands `work` to the worker pool.
    ///
    /// Returns as soon as the job is queued. The outcome of `work` is only
    /// observable through the job's status.
    pub fn add<F>(&self, name: impl Into<String>, project_id: Option<EntityId>, work: F) -> Result<EntityId>
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let name = name.into();
        let id = EntityId::new(
            EntityKind::Job,
            [self.next_id.fetch_add(1, Ordering::Relaxed).to_string()],
        );
        let now = Utc::now();

        self.store.lock_or_create_fallible(&id, |_: Job| {
            self.store.store(Job {
                id: id.clone(),
                name: name.clone(),
                status: JobStatus::Queued,
                created_at: now,
                updated_at: now,
                project_id: project_id.clone(),
            })?;
            self.bus.publish(Topic::JobUpserted, id.clone());
            Ok::<_, BosunError>(())
        })?;

        self.store
            .lock_or_create_fallible(&self.system_id, |mut system: System| {
                system.job_ids.insert(0, id.clone());
                self.store.store(system)
            })?;

        self.counters.queued.fetch_add(1, Ordering::Relaxed);
        self.publish_metrics()?;

        debug!(target: "bosun::jobs", job = %id, name = %name, "job queued");

        self.queue_tx
            .send(QueuedJob {
                id: id.clone(),
                name,
                project_id,
                work: Box::pin(work),
            })
            .map_err(|_| BosunError::Internal("job queue closed".to_string()))?;

        Ok(id)
    }

    /// Runs `concurrency` workers until `cancel` fires, then waits for the
    /// jobs they already picked up. Jobs still queued stay `Queued`.
    pub async fn work(self: Arc<Self>, cancel: CancellationToken) {
        info!(target: "bosun::jobs", concurrency = self.concurrency, "job workers starting");

        let workers: Vec<_> = (0..self.concurrency)
            .map(|worker| {
                let manager = Arc::clone(&self);
                let cancel = cancel.clone();
                tokio::spawn(async move { manager.worker_loop(worker, cancel).await })
            })
            .collect();

        for result in futures::future::join_all(workers).await {
            if let Err(err) = result {
                error!(target: "bosun::jobs", error = %err, "job worker ended abnormally");
            }
        }

        info!(target: "bosun::jobs", "job workers stopped");
    }

    async fn worker_loop(&self, worker: usize, cancel: CancellationToken) {
        loop {
            let job = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                job = async { self.queue_rx.lock().await.recv().await } => job,
            };
            let Some(job) = job else {
                break;
            };
            self.run(worker, job).await;
        }
        debug!(target: "bosun::jobs", worker, "job worker exiting");
    }

    async fn run(&self, worker: usize, job: QueuedJob) {
        let QueuedJob {
            id,
            name,
            project_id,
            work,
        } = job;

        if let Err(err) = self.transition(&id, JobStatus::Running) {
            error!(target: "bosun::jobs", job = %id, error = %err, "failed to mark job running");
        }
        self.counters.queued.fetch_sub(1, Ordering::Relaxed);
        self.counters.running.fetch_add(1, Ordering::Relaxed);
        self.publish_metrics_logged();

        debug!(target: "bosun::jobs", worker, job = %id, name = %name, "job started");

        let outcome = match AssertUnwindSafe(work).catch_unwind().await {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!("job panicked")),
        };

        let status = match outcome {
            Ok(()) => {
                debug!(target: "bosun::jobs", job = %id, name = %name, "job done");
                self.counters.done.fetch_add(1, Ordering::Relaxed);
                JobStatus::Done
            }
            Err(err) => {
                error!(target: "bosun::jobs", job = %id, name = %name, error = %format!("{err:#}"), "job failed");
                let owner = project_id.as_ref().unwrap_or(&id);
                self.logbook
                    .error_with_owner(owner, format!("{name} failed: {err:#}"));
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                JobStatus::Failed
            }
        };
        self.counters.running.fetch_sub(1, Ordering::Relaxed);

        if let Err(err) = self.transition(&id, status) {
            error!(target: "bosun::jobs", job = %id, error = %err, "failed to record job outcome");
        }
        self.publish_metrics_logged();
    }

    fn transition(&self, id: &EntityId, status: JobStatus) -> Result<()> {
        self.store.lock_fallible(id, |mut job: Job| {
            job.status = status;
            job.updated_at = Utc::now();
            self.store.store(job)?;
            self.bus.publish(Topic::JobUpserted, id.clone());
            Ok(())
        })
    }

    pub fn job(&self, id: &EntityId) -> Result<Job> {
        self.store.load(id)
    }

    /// Jobs, most recently added first, optionally narrowed to `statuses`.
    pub fn jobs(&self, args: &PageArgs, statuses: &[JobStatus]) -> Result<Connection<Job>> {
        let system: System = self.store.load(&self.system_id)?;

        let mut jobs = Vec::with_capacity(system.job_ids.len());
        for id in &system.job_ids {
            let job: Job = self.store.load(id)?;
            if statuses.is_empty() || statuses.contains(&job.status) {
                jobs.push(job);
            }
        }

        paginate(jobs, |job| job.id.to_string(), args)
    }

    pub fn metrics(&self) -> JobMetrics {
        JobMetrics {
            id: self.metrics_id.clone(),
            queued: self.counters.queued.load(Ordering::Relaxed),
            running: self.counters.running.load(Ordering::Relaxed),
            done: self.counters.done.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    fn publish_metrics(&self) -> Result<()> {
        self.store
            .lock_or_create_fallible(&self.metrics_id, |_: JobMetrics| {
                self.store.store(self.metrics())?;
                self.bus
                    .publish(Topic::JobMetricsUpdated, self.metrics_id.clone());
                Ok(())
            })
    }

    fn publish_metrics_logged(&self) {
        if let Err(err) = self.publish_metrics() {
            error!(target: "bosun::jobs", error = %err, "failed to publish job metrics");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use bosun_model::LogLevel;
    use tokio::sync::oneshot;

    use super::*;
    use crate::config::LogConfig;

    struct Fixture {
        store: Arc<EntityStore>,
        bus: Arc<EventBus>,
        logbook: Arc<Logbook>,
        jobs: Arc<JobManager>,
    }

    fn fixture(concurrency: usize) -> Fixture {
        let store = Arc::new(EntityStore::new());
        let bus = Arc::new(EventBus::new(1_000, 1_024));
        let system_id = EntityId::new(EntityKind::System, ["test"]);
        store
            .store(System {
                id: system_id.clone(),
                ..Default::default()
            })
            .expect("system");
        let logbook = Arc::new(Logbook::new(
            Arc::clone(&store),
            Arc::clone(&bus),
            system_id.clone(),
            EntityId::new(EntityKind::LogMetrics, ["test"]),
            LogConfig::default(),
        ));
        let jobs = Arc::new(JobManager::new(
            Arc::clone(&store),
            Arc::clone(&bus),
            Arc::clone(&logbook),
            system_id,
            EntityId::new(EntityKind::JobMetrics, ["test"]),
            JobsConfig { concurrency },
        ));
        Fixture {
            store,
            bus,
            logbook,
            jobs,
        }
    }

    async fn wait_for_status(jobs: &JobManager, id: &EntityId, status: JobStatus) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while jobs.job(id).expect("job").status != status {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("job {id} never reached {status:?}"));
    }

    #[tokio::test]
    async fn successful_job_walks_the_lifecycle() {
        let Fixture {
            store, bus, jobs, ..
        } = fixture(1);
        let cancel = CancellationToken::new();

        let events = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&events);
        let _subscription = bus.subscribe(cancel.clone(), Topic::JobUpserted, 0, move |_| {
            counted.fetch_add(1, Ordering::SeqCst);
        });

        let (release_tx, release_rx) = oneshot::channel::<()>();
        let id = jobs
            .add("Build", None, async move {
                release_rx.await?;
                Ok(())
            })
            .expect("add");

        assert_eq!(jobs.job(&id).expect("job").status, JobStatus::Queued);
        assert_eq!(jobs.metrics().queued, 1);

        let worker = tokio::spawn(Arc::clone(&jobs).work(cancel.clone()));

        wait_for_status(&jobs, &id, JobStatus::Running).await;
        let metrics = jobs.metrics();
        assert_eq!((metrics.queued, metrics.running), (0, 1));

        release_tx.send(()).expect("release");
        wait_for_status(&jobs, &id, JobStatus::Done).await;

        let metrics = jobs.metrics();
        assert_eq!(
            (metrics.queued, metrics.running, metrics.done, metrics.failed),
            (0, 0, 1, 0)
        );
        let stored: JobMetrics = store.load(&metrics.id).expect("metrics stored");
        assert_eq!(stored, metrics);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(events.load(Ordering::SeqCst), 3);

        cancel.cancel();
        worker.await.expect("worker");
    }

    #[tokio::test]
    async fn failing_job_ends_failed_and_is_logged() {
        let Fixture { logbook, jobs, .. } = fixture(1);
        let cancel = CancellationToken::new();
        let worker = tokio::spawn(Arc::clone(&jobs).work(cancel.clone()));

        let id = jobs
            .add("Clone", None, async { anyhow::bail!("remote hung up") })
            .expect("add");
        wait_for_status(&jobs, &id, JobStatus::Failed).await;

        let metrics = jobs.metrics();
        assert_eq!((metrics.done, metrics.failed, metrics.running), (0, 1, 0));

        let errors = logbook
            .entries(&PageArgs::default(), &[LogLevel::Error], Some(&id))
            .expect("entries");
        assert_eq!(errors.edges.len(), 1);
        assert!(errors.edges[0].node.message.contains("remote hung up"));

        cancel.cancel();
        worker.await.expect("worker");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn never_exceeds_concurrency() {
        const CONCURRENCY: usize = 3;
        let Fixture { jobs, .. } = fixture(CONCURRENCY);
        let cancel = CancellationToken::new();

        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let ids: Vec<_> = (0..CONCURRENCY * 10)
            .map(|n| {
                let active = Arc::clone(&active);
                let peak = Arc::clone(&peak);
                jobs.add(format!("job {n}"), None, async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
                .expect("add")
            })
            .collect();

        let worker = tokio::spawn(Arc::clone(&jobs).work(cancel.clone()));
        for id in &ids {
            wait_for_status(&jobs, id, JobStatus::Done).await;
        }

        let peak = peak.load(Ordering::SeqCst);
        assert!(peak <= CONCURRENCY, "peak concurrency {peak}");
        assert!(peak >= 1);
        assert_eq!(jobs.metrics().done, (CONCURRENCY * 10) as u64);

        cancel.cancel();
        worker.await.expect("worker");
    }

    #[tokio::test]
    async fn cancel_drains_in_flight_and_leaves_queue() {
        let Fixture { jobs, .. } = fixture(1);
        let cancel = CancellationToken::new();

        let (release_tx, release_rx) = oneshot::channel::<()>();
        let first = jobs
            .add("first", None, async move {
                release_rx.await?;
                Ok(())
            })
            .expect("add");
        let second = jobs.add("second", None, async { Ok(()) }).expect("add");

        let worker = tokio::spawn(Arc::clone(&jobs).work(cancel.clone()));
        wait_for_status(&jobs, &first, JobStatus::Running).await;

        cancel.cancel();
        release_tx.send(()).expect("release");
        worker.await.expect("worker");

        assert_eq!(jobs.job(&first).expect("job").status, JobStatus::Done);
        assert_eq!(jobs.job(&second).expect("job").status, JobStatus::Queued);
        assert_eq!(jobs.metrics().queued, 1);
    }

    #[tokio::test]
    async fn lists_jobs_newest_first_with_status_filter() {
        let Fixture { jobs, .. } = fixture(1);
        let cancel = CancellationToken::new();
        let worker = tokio::spawn(Arc::clone(&jobs).work(cancel.clone()));

        let ok = jobs.add("ok", None, async { Ok(()) }).expect("add");
        let bad = jobs
            .add("bad", None, async { anyhow::bail!("nope") })
            .expect("add");
        wait_for_status(&jobs, &bad, JobStatus::Failed).await;
        wait_for_status(&jobs, &ok, JobStatus::Done).await;

        let all = jobs.jobs(&PageArgs::default(), &[]).expect("jobs");
        let names: Vec<_> = all.edges.iter().map(|edge| edge.node.name.as_str()).collect();
        assert_eq!(names, ["bad", "ok"]);

        let failed = jobs.jobs(&PageArgs::default(), &[JobStatus::Failed]).expect("jobs");
        assert_eq!(failed.cursors(), [bad.as_str()]);

        assert!(matches!(
            jobs.jobs(&PageArgs::first(-1), &[]),
            Err(BosunError::InvalidArgument(_))
        ));

        cancel.cancel();
        worker.await.expect("worker");
    }

    #[test]
    fn add_does_not_deduplicate() {
        let Fixture { store, jobs, .. } = fixture(1);
        let first = jobs.add("same", None, async { Ok(()) }).expect("add");
        let second = jobs.add("same", None, async { Ok(()) }).expect("add");

        assert_ne!(first, second);
        assert!(store.contains(&first) && store.contains(&second));
        assert_eq!(jobs.metrics().queued, 2);
    }
}
