// ===============================
// src/registry.rs (job registry)
// ===============================
//
// Owns controllers by name, the execution history (newest first), last-run
// persistence, and the mapping configuration -> start/stop decisions.
// Never reaches into controller internals: only the public control API and
// the start/complete callbacks.
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use ahash::AHashMap as HashMap;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::ConfigProvider;
use crate::domain::{Event, ExecutionStatus, JobExecution, JobLog, JobState, RegistryEvent};
use crate::metrics::REGISTRY_JOBS;
use crate::scheduler::{CompleteCallback, JobArgs, JobController, JobRunner, StartCallback};
use crate::store::LastRunStore;

pub const MIN_INTERVAL_SECS: u64 = 5;
pub const MAX_EXECUTION_LOGS: usize = 127;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("job {0:?} not found")]
    NotFound(String),
    #[error("job {0:?} already registered")]
    AlreadyRegistered(String),
    #[error("interval must be at least {MIN_INTERVAL_SECS} seconds, got {0}")]
    IntervalTooShort(u64),
    #[error("job {0:?} is not enabled in configuration")]
    Disabled(String),
    #[error("unknown job name: {0}")]
    Unknown(String),
}

/// What the registry knows how to build, keyed by job name.
#[derive(Clone)]
pub struct CatalogEntry {
    pub runner: Arc<dyn JobRunner>,
    pub args: JobArgs,
}

#[derive(Clone, Default)]
pub struct JobCatalog {
    entries: HashMap<String, CatalogEntry>,
}

impl JobCatalog {
    pub fn new() -> Self { Self::default() }

    pub fn with(mut self, name: &str, runner: Arc<dyn JobRunner>, args: JobArgs) -> Self {
        self.entries.insert(name.to_string(), CatalogEntry { runner, args });
        self
    }

    pub fn get(&self, name: &str) -> Option<&CatalogEntry> { self.entries.get(name) }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Outcome of one `sync_with_config` pass.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub started: Vec<String>,
    pub stopped: Vec<String>,
    pub failed: Vec<String>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// Shared with the controller callbacks.
struct History {
    executions: Mutex<VecDeque<JobExecution>>,
    limit: usize,
    store: Arc<dyn LastRunStore>,
    recorder: Option<mpsc::Sender<Event>>,
}

impl History {
    fn record_start(&self, name: &str, start: DateTime<Utc>) {
        let execution = JobExecution {
            id: format!("{name}-{}", start.timestamp()),
            job_name: name.to_string(),
            start_time: start,
            end_time: None,
            status: ExecutionStatus::Running,
            logs: Vec::new(),
        };
        let mut execs = lock(&self.executions);
        execs.push_front(execution);
        execs.truncate(self.limit);
    }

    fn record_complete(
        &self,
        name: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        mut logs: Vec<JobLog>,
        err: Option<&anyhow::Error>,
    ) {
        if logs.len() > MAX_EXECUTION_LOGS {
            logs.drain(..logs.len() - MAX_EXECUTION_LOGS);
        }
        let status = if err.is_some() { ExecutionStatus::Failed } else { ExecutionStatus::Completed };

        let snapshot = {
            let mut execs = lock(&self.executions);
            let running = execs
                .iter_mut()
                .find(|e| e.job_name == name && e.status == ExecutionStatus::Running);
            match running {
                Some(e) => {
                    e.end_time = Some(end);
                    e.status = status;
                    e.logs = logs;
                    e.clone()
                }
                None => {
                    // started before the history was trimmed past it
                    let e = JobExecution {
                        id: format!("{name}-{}", start.timestamp()),
                        job_name: name.to_string(),
                        start_time: start,
                        end_time: Some(end),
                        status,
                        logs,
                    };
                    execs.push_front(e.clone());
                    execs.truncate(self.limit);
                    e
                }
            }
        };

        if let Some(tx) = &self.recorder {
            let _ = tx.try_send(Event::Execution(snapshot));
        }

        let store = Arc::clone(&self.store);
        let name = name.to_string();
        tokio::spawn(async move {
            if let Err(e) = store.save(&name, end).await {
                warn!(job = %name, error = %e, "failed to persist last run");
            }
        });
    }
}

pub struct JobRegistry {
    jobs: Mutex<HashMap<String, JobController>>,
    history: Arc<History>,
    config: Arc<dyn ConfigProvider>,
    catalog: JobCatalog,
    root: CancellationToken,
    events: broadcast::Sender<RegistryEvent>,
    emit_events: AtomicBool,
}

impl JobRegistry {
    pub fn new(
        config: Arc<dyn ConfigProvider>,
        store: Arc<dyn LastRunStore>,
        catalog: JobCatalog,
        root: CancellationToken,
        history_limit: usize,
        recorder: Option<mpsc::Sender<Event>>,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            jobs: Mutex::new(HashMap::new()),
            history: Arc::new(History {
                executions: Mutex::new(VecDeque::new()),
                limit: history_limit,
                store,
                recorder,
            }),
            config,
            catalog,
            root,
            events,
            emit_events: AtomicBool::new(false),
        }
    }

    // ---- events ----

    pub fn set_event_emissions(&self, enabled: bool) { self.emit_events.store(enabled, Ordering::Relaxed); }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> { self.events.subscribe() }

    fn emit(&self, ev: RegistryEvent) {
        if let Some(tx) = &self.history.recorder {
            let _ = tx.try_send(Event::Registry(ev.clone()));
        }
        if self.emit_events.load(Ordering::Relaxed) {
            let _ = self.events.send(ev);
        }
    }

    // ---- lifecycle ----

    pub fn add_and_start(
        &self,
        name: &str,
        interval: Duration,
        runner: Arc<dyn JobRunner>,
        args: JobArgs,
    ) -> Result<(), RegistryError> {
        self.add_and_start_with_last_run(name, interval, runner, args, None)
    }

    pub fn add_and_start_with_last_run(
        &self,
        name: &str,
        interval: Duration,
        runner: Arc<dyn JobRunner>,
        args: JobArgs,
        last_run: Option<DateTime<Utc>>,
    ) -> Result<(), RegistryError> {
        if interval < Duration::from_secs(MIN_INTERVAL_SECS) {
            return Err(RegistryError::IntervalTooShort(interval.as_secs()));
        }
        let job = JobController::new(name, interval, runner, args);

        let on_start: StartCallback = {
            let history = Arc::clone(&self.history);
            Arc::new(move |name, start| history.record_start(name, start))
        };
        let on_complete: CompleteCallback = {
            let history = Arc::clone(&self.history);
            Arc::new(move |name, start, end, logs, err| history.record_complete(name, start, end, logs, err))
        };
        job.set_on_start(on_start);
        job.set_on_complete(on_complete);

        {
            let mut jobs = lock(&self.jobs);
            if jobs.contains_key(name) {
                return Err(RegistryError::AlreadyRegistered(name.to_string()));
            }
            jobs.insert(name.to_string(), job.clone());
            REGISTRY_JOBS.set(jobs.len() as i64);
        }

        job.start_with_last_run(&self.root, last_run);
        info!(job = %name, interval_secs = interval.as_secs(), ?last_run, "job registered");
        Ok(())
    }

    fn create_from_config(&self, name: &str, last_run: Option<DateTime<Utc>>) -> Result<(), RegistryError> {
        let entry = self.catalog.get(name).ok_or_else(|| RegistryError::Unknown(name.to_string()))?;
        let settings = self
            .config
            .job_settings(name)
            .ok_or_else(|| RegistryError::Unknown(name.to_string()))?;
        if !settings.enabled {
            return Err(RegistryError::Disabled(name.to_string()));
        }
        self.add_and_start_with_last_run(
            name,
            Duration::from_secs(settings.interval_secs),
            Arc::clone(&entry.runner),
            entry.args.clone(),
            last_run,
        )
    }

    fn get(&self, name: &str) -> Result<JobController, RegistryError> {
        lock(&self.jobs)
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    fn get_or_create(&self, name: &str) -> Result<JobController, RegistryError> {
        match self.get(name) {
            Ok(job) => Ok(job),
            Err(RegistryError::NotFound(_)) => {
                self.create_from_config(name, None)?;
                self.get(name)
            }
            Err(e) => Err(e),
        }
    }

    // ---- control by name ----

    pub fn pause(&self, name: &str) -> Result<(), RegistryError> {
        self.get(name)?.pause();
        self.emit(RegistryEvent::JobPaused(name.to_string()));
        Ok(())
    }

    pub fn resume(&self, name: &str) -> Result<(), RegistryError> {
        self.get_or_create(name)?.resume();
        self.emit(RegistryEvent::JobResumed(name.to_string()));
        Ok(())
    }

    pub fn trigger(&self, name: &str) -> Result<(), RegistryError> {
        self.get(name)?.trigger();
        self.emit(RegistryEvent::JobTriggered(name.to_string()));
        Ok(())
    }

    pub fn set_interval(&self, name: &str, interval_secs: u64) -> Result<(), RegistryError> {
        if interval_secs < MIN_INTERVAL_SECS {
            return Err(RegistryError::IntervalTooShort(interval_secs));
        }
        self.get_or_create(name)?.set_interval(Duration::from_secs(interval_secs));
        self.emit(RegistryEvent::IntervalChanged { name: name.to_string(), interval_secs });
        Ok(())
    }

    pub fn clear_error(&self, name: &str) -> Result<(), RegistryError> {
        self.get(name)?.clear_error();
        self.emit(RegistryEvent::ErrorCleared(name.to_string()));
        Ok(())
    }

    pub fn stop_and_remove(&self, name: &str) -> Result<(), RegistryError> {
        let job = {
            let mut jobs = lock(&self.jobs);
            let job = jobs.remove(name).ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
            REGISTRY_JOBS.set(jobs.len() as i64);
            job
        };
        job.stop();
        info!(job = %name, "job stopped and removed");
        self.emit(RegistryEvent::JobStopped(name.to_string()));
        Ok(())
    }

    pub fn shutdown(&self) {
        let jobs: Vec<JobController> = lock(&self.jobs).drain().map(|(_, j)| j).collect();
        for job in &jobs {
            job.stop();
        }
        REGISTRY_JOBS.set(0);
        info!(stopped = jobs.len(), "registry shut down");
    }

    // ---- queries ----

    /// Snapshots of jobs enabled in configuration, sorted by name.
    pub fn jobs(&self) -> Vec<JobState> {
        let jobs: Vec<JobController> = lock(&self.jobs).values().cloned().collect();
        let mut states: Vec<JobState> = jobs
            .iter()
            .filter(|j| self.config.is_enabled(j.name()))
            .map(JobController::state)
            .collect();
        states.sort_by(|a, b| a.name.cmp(&b.name));
        states
    }

    pub fn state(&self, name: &str) -> Result<JobState, RegistryError> { Ok(self.get(name)?.state()) }

    pub fn executions(&self) -> Vec<JobExecution> {
        lock(&self.history.executions).iter().cloned().collect()
    }

    pub fn contains(&self, name: &str) -> bool { lock(&self.jobs).contains_key(name) }

    // ---- configuration ----

    /// Stop jobs disabled in configuration, create enabled catalog jobs that
    /// are not running yet (first run seeded from persisted last runs).
    pub async fn sync_with_config(&self) -> SyncReport {
        let last_runs = match self.history.store.load_all().await {
            Ok(runs) => runs,
            Err(e) => {
                warn!(error = %e, "could not load last runs; starting without them");
                Default::default()
            }
        };

        let mut report = SyncReport::default();

        let running: Vec<String> = lock(&self.jobs).keys().cloned().collect();
        for name in running {
            if !self.config.is_enabled(&name) && self.stop_and_remove(&name).is_ok() {
                report.stopped.push(name);
            }
        }

        for name in self.catalog.names() {
            if self.contains(&name) || !self.config.job_settings(&name).is_some_and(|s| s.enabled) {
                continue;
            }
            match self.create_from_config(&name, last_runs.get(&name).copied()) {
                Ok(()) => report.started.push(name),
                Err(e) => {
                    warn!(job = %name, error = %e, "could not start job from configuration");
                    report.failed.push(name);
                }
            }
        }

        report.stopped.sort();
        info!(started = ?report.started, stopped = ?report.stopped, "jobs synced with configuration");
        report
    }
}
