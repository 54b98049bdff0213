//! User-visible log kept as entities.
//!
//! Every accepted entry is mirrored to `tracing`, stored as a [`LogEntry`]
//! and linked from the [`System`] entity, newest first. Only the newest `cap`
//! entries are retained.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bosun_model::{EntityId, EntityKind, LogEntry, LogLevel, LogMetrics, System};
use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::bus::{EventBus, Topic};
use crate::config::LogConfig;
use crate::error::{BosunError, Result};
use crate::relay::{Connection, PageArgs, paginate};
use crate::store::EntityStore;

#[derive(Default)]
struct LevelCounters {
    debug: AtomicU64,
    info: AtomicU64,
    warning: AtomicU64,
    error: AtomicU64,
}

impl LevelCounters {
    fn bump(&self, level: LogLevel) {
        let counter = match level {
            LogLevel::Debug => &self.debug,
            LogLevel::Info => &self.info,
            LogLevel::Warning => &self.warning,
            LogLevel::Error => &self.error,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

pub struct Logbook {
    store: Arc<EntityStore>,
    bus: Arc<EventBus>,
    system_id: EntityId,
    metrics_id: EntityId,
    min_level: LogLevel,
    cap: usize,
    next_id: AtomicU64,
    counters: LevelCounters,
}

impl fmt::Debug for Logbook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logbook")
            .field("system_id", &self.system_id)
            .field("min_level", &self.min_level)
            .field("cap", &self.cap)
            .finish()
    }
}

impl Logbook {
    pub fn new(
        store: Arc<EntityStore>,
        bus: Arc<EventBus>,
        system_id: EntityId,
        metrics_id: EntityId,
        config: LogConfig,
    ) -> Self {
        Self {
            store,
            bus,
            system_id,
            metrics_id,
            min_level: config.level,
            cap: config.cap.max(1),
            next_id: AtomicU64::new(1),
            counters: LevelCounters::default(),
        }
    }

    pub fn min_level(&self) -> LogLevel {
        self.min_level
    }

    /// Records an entry. Returns `None` when `level` is below the configured
    /// minimum.
    pub fn add(
        &self,
        level: LogLevel,
        owner_id: Option<&EntityId>,
        message: impl Into<String>,
        meta: Option<&serde_json::Value>,
    ) -> Result<Option<EntityId>> {
        if level < self.min_level {
            return Ok(None);
        }

        let message = message.into();
        mirror(level, owner_id, &message);

        let id = EntityId::new(
            EntityKind::LogEntry,
            [self.next_id.fetch_add(1, Ordering::Relaxed).to_string()],
        );
        let entry = LogEntry {
            id: id.clone(),
            level,
            created_at: Utc::now(),
            message,
            owner_id: owner_id.cloned(),
            meta_json: meta.map(serde_json::to_string).transpose()?,
        };
        self.store.store(entry)?;

        let evicted = self
            .store
            .lock_or_create_fallible(&self.system_id, |mut system: System| {
                system.log_entry_ids.insert(0, id.clone());
                let evicted = if system.log_entry_ids.len() > self.cap {
                    system.log_entry_ids.split_off(self.cap)
                } else {
                    Vec::new()
                };
                self.store.store(system)?;
                Ok::<_, BosunError>(evicted)
            })?;
        for evicted_id in &evicted {
            self.store.delete::<LogEntry>(evicted_id)?;
        }

        self.bus.publish(Topic::LogEntryAdded, id.clone());
        self.counters.bump(level);
        self.publish_metrics()?;

        Ok(Some(id))
    }

    pub fn debug(&self, message: impl Into<String>) -> Option<EntityId> {
        self.emit(LogLevel::Debug, None, message.into())
    }

    pub fn info(&self, message: impl Into<String>) -> Option<EntityId> {
        self.emit(LogLevel::Info, None, message.into())
    }

    pub fn warning(&self, message: impl Into<String>) -> Option<EntityId> {
        self.emit(LogLevel::Warning, None, message.into())
    }

    pub fn error(&self, message: impl Into<String>) -> Option<EntityId> {
        self.emit(LogLevel::Error, None, message.into())
    }

    pub fn debug_with_owner(&self, owner_id: &EntityId, message: impl Into<String>) -> Option<EntityId> {
        self.emit(LogLevel::Debug, Some(owner_id), message.into())
    }

    pub fn info_with_owner(&self, owner_id: &EntityId, message: impl Into<String>) -> Option<EntityId> {
        self.emit(LogLevel::Info, Some(owner_id), message.into())
    }

    pub fn warning_with_owner(
        &self,
        owner_id: &EntityId,
        message: impl Into<String>,
    ) -> Option<EntityId> {
        self.emit(LogLevel::Warning, Some(owner_id), message.into())
    }

    pub fn error_with_owner(&self, owner_id: &EntityId, message: impl Into<String>) -> Option<EntityId> {
        self.emit(LogLevel::Error, Some(owner_id), message.into())
    }

    /// Retained entries, newest first, optionally narrowed to `levels` and
    /// to a single owner.
    pub fn entries(
        &self,
        args: &PageArgs,
        levels: &[LogLevel],
        owner_id: Option<&EntityId>,
    ) -> Result<Connection<LogEntry>> {
        let ids = match self.store.load::<System>(&self.system_id) {
            Ok(system) => system.log_entry_ids,
            Err(BosunError::NotFound(_)) => Vec::new(),
            Err(err) => return Err(err),
        };

        let mut entries = Vec::with_capacity(ids.len());
        for id in &ids {
            match self.store.load::<LogEntry>(id) {
                Ok(entry) => entries.push(entry),
                // Evicted between reading the list and loading the entry.
                Err(BosunError::NotFound(_)) => continue,
                Err(err) => return Err(err),
            }
        }
        entries.retain(|entry| {
            (levels.is_empty() || levels.contains(&entry.level))
                && owner_id.is_none_or(|owner| entry.owner_id.as_ref() == Some(owner))
        });

        paginate(entries, |entry| entry.id.to_string(), args)
    }

    pub fn metrics(&self) -> LogMetrics {
        LogMetrics {
            id: self.metrics_id.clone(),
            debug: self.counters.debug.load(Ordering::Relaxed),
            info: self.counters.info.load(Ordering::Relaxed),
            warning: self.counters.warning.load(Ordering::Relaxed),
            error: self.counters.error.load(Ordering::Relaxed),
        }
    }

    fn emit(&self, level: LogLevel, owner_id: Option<&EntityId>, message: String) -> Option<EntityId> {
        match self.add(level, owner_id, message, None) {
            Ok(id) => id,
            Err(err) => {
                warn!(target: "bosun::log", error = %err, "failed to record log entry");
                None
            }
        }
    }

    fn publish_metrics(&self) -> Result<()> {
        self.store
            .lock_or_create_fallible(&self.metrics_id, |_: LogMetrics| {
                self.store.store(self.metrics())?;
                self.bus
                    .publish(Topic::LogMetricsUpdated, self.metrics_id.clone());
                Ok(())
            })
    }
}

fn mirror(level: LogLevel, owner_id: Option<&EntityId>, message: &str) {
    let owner = owner_id.map(EntityId::as_str).unwrap_or_default();
    match level {
        LogLevel::Debug => debug!(target: "bosun::log", owner, "{message}"),
        LogLevel::Info => info!(target: "bosun::log", owner, "{message}"),
        LogLevel::Warning => warn!(target: "bosun::log", owner, "{message}"),
        LogLevel::Error => error!(target: "bosun::log", owner, "{message}"),
    }
}
