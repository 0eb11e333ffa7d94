// ===============================
// src/scheduler.rs (job controller)
// ===============================
//
// One controller = one tokio task running a single-threaded control loop.
// The loop multiplexes: stop, pause/resume, interval change, manual trigger,
// timer. Exactly one input is serviced per iteration and executions never
// overlap; commands sent while a run is in flight wait in their slot.
//
// Command slots:
//   trigger      mpsc(1) + try_send  -> redundant triggers are dropped
//   pause/resume mpsc(1) + try_send  -> redundant requests are dropped
//   interval     watch               -> latest value wins
//   stop         CancellationToken   -> also seen by the running job
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::{
    sync::{mpsc, watch},
    time::{sleep_until, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::{JobLog, JobState, LogLevel};
use crate::metrics::{JOB_DURATION, JOB_EXECUTING, JOB_RUNS};

pub type JobArgs = Vec<String>;

pub type StartCallback = Arc<dyn Fn(&str, DateTime<Utc>) + Send + Sync>;
pub type CompleteCallback =
    Arc<dyn Fn(&str, DateTime<Utc>, DateTime<Utc>, Vec<JobLog>, Option<&anyhow::Error>) + Send + Sync>;

/// Status sink handed to a running job. Each call appends an `info` line to
/// the controller's log buffer.
#[derive(Clone)]
pub struct StatusReporter {
    sink: Option<Arc<dyn Fn(&str) + Send + Sync>>,
}

impl StatusReporter {
    pub fn new(sink: impl Fn(&str) + Send + Sync + 'static) -> Self {
        Self { sink: Some(Arc::new(sink)) }
    }

    pub fn noop() -> Self { Self { sink: None } }

    pub fn report(&self, status: impl AsRef<str>) {
        if let Some(sink) = &self.sink {
            sink(status.as_ref());
        }
    }
}

/// Everything a job gets from its controller: cancellation and status.
#[derive(Clone)]
pub struct JobContext {
    token: CancellationToken,
    status: StatusReporter,
}

impl JobContext {
    pub fn new(token: CancellationToken, status: StatusReporter) -> Self { Self { token, status } }

    /// Context not attached to any controller (no-op status, never cancelled
    /// unless the caller cancels the returned token).
    pub fn detached() -> Self { Self::new(CancellationToken::new(), StatusReporter::noop()) }

    pub fn status(&self, status: impl AsRef<str>) { self.status.report(status) }

    pub fn reporter(&self) -> StatusReporter { self.status.clone() }

    pub fn token(&self) -> &CancellationToken { &self.token }

    pub fn is_cancelled(&self) -> bool { self.token.is_cancelled() }

    pub async fn cancelled(&self) { self.token.cancelled().await }

    /// Context for a sub-task: cancelled with the parent, or on its own.
    pub fn child(&self) -> Self { Self::new(self.token.child_token(), self.status.clone()) }
}

#[async_trait]
pub trait JobRunner: Send + Sync + 'static {
    async fn run(&self, ctx: JobContext, args: &[String]) -> anyhow::Result<()>;
}

/// Adapter so plain async closures can be scheduled.
pub struct FnRunner<F>(F);

#[async_trait]
impl<F, Fut> JobRunner for FnRunner<F>
where
    F: Fn(JobContext, JobArgs) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn run(&self, ctx: JobContext, args: &[String]) -> anyhow::Result<()> {
        (self.0)(ctx, args.to_vec()).await
    }
}

pub fn job_fn<F, Fut>(f: F) -> Arc<dyn JobRunner>
where
    F: Fn(JobContext, JobArgs) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnRunner(f))
}

#[derive(Debug)]
struct RuntimeState {
    interval: Duration,
    paused: bool,
    started: bool,
    is_executing: bool,
    last_run: Option<DateTime<Utc>>,
    last_run_at: Option<Instant>,
    next_run: Option<DateTime<Utc>>,
    last_error: Option<String>,
    current_status: String,
    run_count: u64,
    logs: Vec<JobLog>,
}

struct Receivers {
    trigger: mpsc::Receiver<()>,
    pause: mpsc::Receiver<bool>,
    interval: watch::Receiver<Duration>,
}

#[derive(Default)]
struct Callbacks {
    on_start: Option<StartCallback>,
    on_complete: Option<CompleteCallback>,
}

struct Inner {
    name: String,
    runner: Arc<dyn JobRunner>,
    args: JobArgs,
    state: Mutex<RuntimeState>,
    callbacks: Mutex<Callbacks>,
    receivers: Mutex<Option<Receivers>>,
    trigger_tx: mpsc::Sender<()>,
    pause_tx: mpsc::Sender<bool>,
    interval_tx: watch::Sender<Duration>,
    token: CancellationToken,
}

/// Handle to one scheduled job. Cheap to clone; all clones drive the same loop.
#[derive(Clone)]
pub struct JobController {
    inner: Arc<Inner>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::zero())
}

impl JobController {
    pub fn new(name: impl Into<String>, interval: Duration, runner: Arc<dyn JobRunner>, args: JobArgs) -> Self {
        let (trigger_tx, trigger) = mpsc::channel(1);
        let (pause_tx, pause) = mpsc::channel(1);
        let (interval_tx, interval_rx) = watch::channel(interval);

        let state = RuntimeState {
            interval,
            paused: false,
            started: false,
            is_executing: false,
            last_run: None,
            last_run_at: None,
            next_run: None,
            last_error: None,
            current_status: String::new(),
            run_count: 0,
            logs: Vec::new(),
        };

        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                runner,
                args,
                state: Mutex::new(state),
                callbacks: Mutex::new(Callbacks::default()),
                receivers: Mutex::new(Some(Receivers { trigger, pause, interval: interval_rx })),
                trigger_tx,
                pause_tx,
                interval_tx,
                token: CancellationToken::new(),
            }),
        }
    }

    pub fn name(&self) -> &str { &self.inner.name }

    pub fn set_on_start(&self, cb: StartCallback) { lock(&self.inner.callbacks).on_start = Some(cb); }

    pub fn set_on_complete(&self, cb: CompleteCallback) { lock(&self.inner.callbacks).on_complete = Some(cb); }

    /// Spawn the control loop and run once right away. No-op if already started.
    pub fn start(&self, parent: &CancellationToken) { self.start_with_last_run(parent, None) }

    /// Like `start`, but a known previous run delays the first execution until
    /// `last_run + interval` (immediate when that is already past).
    pub fn start_with_last_run(&self, parent: &CancellationToken, last_run: Option<DateTime<Utc>>) {
        let inner = &self.inner;
        let rx = {
            let mut st = lock(&inner.state);
            if st.started {
                return;
            }
            let Some(rx) = lock(&inner.receivers).take() else { return };
            st.started = true;
            rx
        };

        let first_delay = last_run.and_then(|last| {
            let mut st = lock(&inner.state);
            let elapsed = (Utc::now() - last).to_std().unwrap_or(Duration::ZERO);
            st.last_run = Some(last);
            st.last_run_at = Instant::now().checked_sub(elapsed);
            let remaining = st.interval.saturating_sub(elapsed);
            if remaining.is_zero() {
                None
            } else {
                st.next_run = Some(last + to_chrono(st.interval));
                Some(remaining)
            }
        });

        // parent scope cancels us; we never cancel the parent
        let parent = parent.clone();
        let token = inner.token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = parent.cancelled() => token.cancel(),
                _ = token.cancelled() => {}
            }
        });

        info!(job = %inner.name, interval_secs = lock(&inner.state).interval.as_secs(), "job started");
        tokio::spawn(Arc::clone(inner).control_loop(rx, first_delay));
    }

    pub fn pause(&self) { let _ = self.inner.pause_tx.try_send(true); }

    pub fn resume(&self) { let _ = self.inner.pause_tx.try_send(false); }

    pub fn trigger(&self) { let _ = self.inner.trigger_tx.try_send(()); }

    pub fn set_interval(&self, interval: Duration) { self.inner.interval_tx.send_replace(interval); }

    pub fn clear_error(&self) { lock(&self.inner.state).last_error = None; }

    /// Terminal. Cancels the loop and whatever execution is in flight.
    pub fn stop(&self) { self.inner.token.cancel(); }

    pub fn is_stopped(&self) -> bool { self.inner.token.is_cancelled() }

    pub fn state(&self) -> JobState {
        let st = lock(&self.inner.state);
        JobState {
            name: self.inner.name.clone(),
            interval: st.interval.as_secs(),
            running: !st.paused,
            last_run_unix: st.last_run.map(|t| t.timestamp()).unwrap_or(0),
            next_run_unix: st.next_run.map(|t| t.timestamp()).unwrap_or(0),
            err: st.last_error.clone(),
            is_executing: st.is_executing,
            current_status: st.current_status.clone(),
            run_count: st.run_count,
            logs: st.logs.clone(),
        }
    }
}

impl Inner {
    async fn control_loop(self: Arc<Self>, mut rx: Receivers, first_delay: Option<Duration>) {
        let mut interval = *rx.interval.borrow_and_update();
        lock(&self.state).interval = interval;

        let mut deadline = match first_delay {
            Some(delay) => Instant::now() + delay,
            None => {
                if self.token.is_cancelled() {
                    return;
                }
                self.run_once().await;
                Instant::now() + interval
            }
        };

        loop {
            let paused = lock(&self.state).paused;

            tokio::select! {
                biased;

                _ = self.token.cancelled() => break,

                Some(p) = rx.pause.recv() => {
                    lock(&self.state).paused = p;
                    deadline = Instant::now() + interval;
                    info!(job = %self.name, paused = p, "pause state changed");
                }

                Ok(()) = rx.interval.changed() => {
                    interval = *rx.interval.borrow_and_update();
                    let mut st = lock(&self.state);
                    st.interval = interval;

                    let elapsed = st.last_run_at.map(|at| at.elapsed());
                    let remaining = elapsed.map(|e| interval.saturating_sub(e)).unwrap_or(Duration::ZERO);
                    deadline = Instant::now() + remaining;
                    if !remaining.is_zero() {
                        st.next_run = st.last_run.map(|last| last + to_chrono(interval));
                    }
                    info!(job = %self.name, interval_secs = interval.as_secs(), remaining_ms = remaining.as_millis() as u64, "interval changed");
                }

                Some(()) = rx.trigger.recv() => {
                    debug!(job = %self.name, "manual trigger");
                    self.run_once().await;
                    deadline = Instant::now() + interval;
                }

                _ = sleep_until(deadline), if !paused => {
                    self.run_once().await;
                    deadline = Instant::now() + interval;
                }
            }
        }

        info!(job = %self.name, "job stopped");
    }

    fn append_status(&self, status: &str) {
        let mut st = lock(&self.state);
        st.logs.push(JobLog::now(status, LogLevel::Info));
        st.current_status = status.to_string();
    }

    async fn run_once(self: &Arc<Self>) {
        let start_time = {
            let mut st = lock(&self.state);
            if st.paused {
                return;
            }
            let now = Utc::now();
            st.is_executing = true;
            st.next_run = Some(now + to_chrono(st.interval));
            st.logs.clear();
            now
        };
        JOB_EXECUTING.with_label_values(&[&self.name]).set(1);

        let on_start = lock(&self.callbacks).on_start.clone();
        if let Some(cb) = on_start {
            cb(&self.name, start_time);
        }

        let reporter = {
            let inner = Arc::clone(self);
            StatusReporter::new(move |s| inner.append_status(s))
        };
        let ctx = JobContext::new(self.token.clone(), reporter);

        // spawned so a panicking job counts as a failed run instead of
        // taking the control loop down with it
        let started = Instant::now();
        let runner = Arc::clone(&self.runner);
        let args = self.args.clone();
        let result = match tokio::spawn(async move { runner.run(ctx, &args).await }).await {
            Ok(r) => r,
            Err(e) => Err(anyhow::anyhow!("job panicked: {e}")),
        };
        let end_time = Utc::now();

        let logs = {
            let mut st = lock(&self.state);
            match &result {
                Ok(()) => {
                    st.last_error = None;
                    st.current_status = "success".to_string();
                    st.logs.push(JobLog::now("success", LogLevel::Success));
                }
                Err(e) => {
                    let msg = format!("{e:#}");
                    st.current_status = "failed".to_string();
                    st.logs.push(JobLog::now(format!("failed: {msg}"), LogLevel::Error));
                    st.last_error = Some(msg);
                }
            }
            st.is_executing = false;
            st.last_run = Some(Utc::now());
            st.last_run_at = Some(Instant::now());
            st.run_count += 1;
            st.logs.clone()
        };

        let status = if result.is_ok() { "success" } else { "failed" };
        JOB_EXECUTING.with_label_values(&[&self.name]).set(0);
        JOB_RUNS.with_label_values(&[&self.name, status]).inc();
        JOB_DURATION
            .with_label_values(&[&self.name])
            .observe(started.elapsed().as_secs_f64());
        match &result {
            Ok(()) => debug!(job = %self.name, "execution completed"),
            Err(e) => warn!(job = %self.name, error = %format!("{e:#}"), "execution failed"),
        }

        // outside the state lock: the callback may query state()
        let on_complete = lock(&self.callbacks).on_complete.clone();
        if let Some(cb) = on_complete {
            cb(&self.name, start_time, end_time, logs, result.as_ref().err());
        }
    }
}
