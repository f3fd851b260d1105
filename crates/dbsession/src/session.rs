//! The public session handle.
//!
//! A [`Session`] owns one database connection through a dedicated worker. All
//! methods take `&self` and the handle is `Clone + Send + Sync`, so any number
//! of threads may submit work; the worker runs it strictly in submission
//! order.
//!
//! # Example
//!
//! ```rust,ignore
//! use dbsession::{QueryRequest, ResultSink, SessionFactory, SessionConfig};
//! use dbsession_core::ConnectionOptions;
//!
//! let factory = SessionFactory::default();
//! let options = ConnectionOptions::new().option("db_file", ":memory:");
//! let session = factory.create("Sqlite", "s1", options, SessionConfig::default())?;
//! session.open()?;
//!
//! let (tx, rx) = std::sync::mpsc::channel();
//! session.execute(
//!     QueryRequest::new("SELECT 1").request_id("r1").sink(ResultSink::Channel(tx)),
//! )?;
//! for event in rx.iter() {
//!     println!("{}", event.to_json());
//!     if event.state.is_terminal() {
//!         break;
//!     }
//! }
//! session.close()?;
//! ```

use crate::cancel::CancellationRegistry;
use crate::config::SessionConfig;
use crate::connector::{ConnectionEvent, ConnectionHooks, Connector, ReconnectMode, SetupHook};
use crate::task::{
    ErrorPayload, QueryRequest, QueryTask, RecordedTask, ResultSink, SchemaAction, SchemaTask,
    Task, TaskOutcome, TaskState, TaskStats,
};
use crate::worker::{self, Job, Latch, catch_panic};
use dbsession_core::{
    Capability, ConnectionOptions, Error, Interrupter, SessionError, SessionErrorKind,
};
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, OnceLock};
use std::thread::{JoinHandle, ThreadId};
use std::time::Duration;

/// Point in a task's life reported to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskPhase {
    Started,
    Finished,
}

/// Callback invoked on the worker thread around every task.
pub type TaskObserver = Arc<dyn Fn(TaskPhase, Option<&str>) + Send + Sync>;

/// Statistics of the most recently completed task.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionStats {
    pub last_error: Option<ErrorPayload>,
    pub last_execution_time: Option<Duration>,
    pub last_insert_id: Option<i64>,
    pub rows_affected: u64,
}

impl SessionStats {
    pub(crate) fn apply(&mut self, stats: &TaskStats) {
        self.last_error.clone_from(&stats.last_error);
        self.last_execution_time = stats.execution_time;
        self.last_insert_id = stats.last_insert_id;
        self.rows_affected = stats.rows_affected;
    }
}

/// Summary of the last task, as shown in status bars.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub state: TaskState,
    pub msg: String,
}

/// State shared between the handle and the worker thread.
pub(crate) struct Shared {
    pub(crate) id: String,
    pub(crate) backend: &'static str,
    pub(crate) config: SessionConfig,
    pub(crate) auto_reconnect: bool,
    /// Held by the worker for the whole duration of a task.
    pub(crate) stats: ReentrantMutex<RefCell<SessionStats>>,
    pub(crate) killed: AtomicBool,
    pub(crate) terminated: Latch,
    pub(crate) registry: CancellationRegistry,
    /// A keep-alive job is queued and not yet handled
    pub(crate) keepalive_pending: AtomicBool,
    hooks: Arc<ConnectionHooks>,
    observers: RwLock<Vec<TaskObserver>>,
    info: Mutex<serde_json::Value>,
    default_schema: Mutex<Option<String>>,
    interrupter: Mutex<Option<Interrupter>>,
    worker_thread: OnceLock<ThreadId>,
}

impl Shared {
    pub(crate) fn notify(&self, phase: TaskPhase, request_id: Option<&str>) {
        let observers = self.observers.read().clone();
        for observer in observers {
            if let Err(panic) = catch_panic(|| observer(phase, request_id)) {
                tracing::error!(session_id = %self.id, panic = %panic, "task observer panicked");
            }
        }
    }

    /// Record what the capability reports about a fresh connection.
    pub(crate) fn publish_connection(&self, capability: &dyn Capability) {
        *self.info.lock() = capability.info();
        *self.default_schema.lock() = capability.default_schema();
        *self.interrupter.lock() = capability.interrupter();
    }

    pub(crate) fn set_worker_thread(&self, id: ThreadId) {
        let _ = self.worker_thread.set(id);
    }

    fn on_worker_thread(&self) -> bool {
        self.worker_thread
            .get()
            .is_some_and(|id| *id == std::thread::current().id())
    }

    pub(crate) fn session_error(&self, kind: SessionErrorKind, message: &str) -> Error {
        Error::Session(SessionError {
            kind,
            session_id: self.id.clone(),
            message: message.to_string(),
        })
    }

    pub(crate) fn closed_error(&self) -> Error {
        self.session_error(SessionErrorKind::Closed, "The session has been closed.")
    }
}

enum Lifecycle {
    /// Constructed, `open()` not called yet
    Idle(Connector),
    /// Worker thread running
    Threaded {
        jobs: Sender<Job>,
        handle: Option<JoinHandle<()>>,
    },
    /// Opened in non-threaded mode; tasks run in the caller
    Inline(Connector),
    Closed,
}

struct SessionInner {
    shared: Arc<Shared>,
    state: Mutex<Lifecycle>,
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        match std::mem::replace(self.state.get_mut(), Lifecycle::Closed) {
            Lifecycle::Threaded { jobs, handle } => {
                // The worker drains, releases and exits on its own.
                let _ = jobs.send(Job::Close);
                drop(handle);
            }
            Lifecycle::Idle(mut connector) | Lifecycle::Inline(mut connector) => {
                connector.release();
                self.shared.terminated.set();
            }
            Lifecycle::Closed => {}
        }
    }
}

/// Handle to one database session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.shared.id)
            .field("backend", &self.inner.shared.backend)
            .field("threaded", &self.inner.shared.config.threaded)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Create a session around `capability`. Nothing connects until
    /// [`open`](Self::open).
    pub fn new(
        id: impl Into<String>,
        capability: Box<dyn Capability>,
        options: ConnectionOptions,
        config: SessionConfig,
    ) -> Self {
        let id = id.into();
        let backend = capability.backend();
        let auto_reconnect = options.auto_reconnect;
        let hooks = Arc::new(ConnectionHooks::new());
        let connector = Connector::new(id.clone(), capability, options)
            .reconnect_policy(config.reconnect_attempts, config.reconnect_delay)
            .hooks(Arc::clone(&hooks));

        let shared = Arc::new(Shared {
            info: Mutex::new(serde_json::json!({ "backend": backend })),
            id,
            backend,
            config,
            auto_reconnect,
            stats: ReentrantMutex::new(RefCell::new(SessionStats::default())),
            killed: AtomicBool::new(false),
            terminated: Latch::new(),
            registry: CancellationRegistry::new(),
            keepalive_pending: AtomicBool::new(false),
            hooks,
            observers: RwLock::new(Vec::new()),
            default_schema: Mutex::new(None),
            interrupter: Mutex::new(None),
            worker_thread: OnceLock::new(),
        });

        Self {
            inner: Arc::new(SessionInner {
                shared,
                state: Mutex::new(Lifecycle::Idle(connector)),
            }),
        }
    }

    fn shared(&self) -> &Shared {
        &self.inner.shared
    }

    pub fn id(&self) -> &str {
        &self.shared().id
    }

    pub fn backend(&self) -> &'static str {
        self.shared().backend
    }

    pub fn config(&self) -> &SessionConfig {
        &self.shared().config
    }

    pub fn auto_reconnect(&self) -> bool {
        self.shared().auto_reconnect
    }

    pub fn cancellation_registry(&self) -> &CancellationRegistry {
        &self.shared().registry
    }

    // ==================== Lifecycle ====================

    /// Connect. In threaded mode this starts the worker and blocks until its
    /// connect attempt finished; a startup error is returned here.
    #[tracing::instrument(level = "info", skip(self), fields(session_id = %self.id()))]
    pub fn open(&self) -> Result<(), Error> {
        let shared = &self.inner.shared;
        let mut state = self.inner.state.lock();
        let connector = match std::mem::replace(&mut *state, Lifecycle::Closed) {
            Lifecycle::Idle(connector) => connector,
            Lifecycle::Closed => return Err(shared.closed_error()),
            other => {
                *state = other;
                return Err(shared.session_error(
                    SessionErrorKind::AlreadyOpen,
                    "The session is already open.",
                ));
            }
        };

        if shared.config.threaded {
            let (jobs_tx, jobs_rx) = mpsc::channel();
            let handle = worker::spawn(Arc::clone(shared), connector, jobs_rx, jobs_tx.clone())?;
            *state = Lifecycle::Threaded {
                jobs: jobs_tx,
                handle: Some(handle),
            };
        } else {
            let mut connector = connector;
            if let Err(e) = connector.open() {
                tracing::error!(error = %e, "failed to open session");
                connector.release();
                shared.terminated.set();
                return Err(e);
            }
            shared.publish_connection(connector.capability());
            *state = Lifecycle::Inline(connector);
        }
        Ok(())
    }

    /// Tear the session down and wait until the capability was released.
    ///
    /// Safe to call any number of times, and on sessions that were never
    /// opened or failed to open.
    #[tracing::instrument(level = "info", skip(self), fields(session_id = %self.id()))]
    pub fn close(&self) -> Result<(), Error> {
        let shared = &self.inner.shared;
        let previous = std::mem::replace(&mut *self.inner.state.lock(), Lifecycle::Closed);
        match previous {
            Lifecycle::Idle(mut connector) | Lifecycle::Inline(mut connector) => {
                connector.release();
                shared.terminated.set();
            }
            Lifecycle::Threaded { jobs, handle } => {
                let _ = jobs.send(Job::Close);
                drop(jobs);
                if shared.on_worker_thread() {
                    // Called from a task callback; the loop exits after it.
                    return Ok(());
                }
                shared.terminated.wait();
                if let Some(handle) = handle {
                    if handle.join().is_err() {
                        tracing::error!("session worker panicked");
                    }
                }
            }
            Lifecycle::Closed => {
                if !shared.on_worker_thread() {
                    shared.terminated.wait();
                }
            }
        }
        Ok(())
    }

    /// Block until the session has terminated, up to `timeout`.
    pub fn wait_terminated(&self, timeout: Duration) -> bool {
        self.shared().terminated.wait_for(timeout)
    }

    pub fn is_open(&self) -> bool {
        let state = self.inner.state.lock();
        matches!(
            *state,
            Lifecycle::Threaded { .. } | Lifecycle::Inline(_)
        ) && !self.shared().terminated.is_set()
    }

    /// Drop and re-establish the connection with a single attempt.
    pub fn reconnect(&self) -> Result<(), Error> {
        self.reconnect_inner(None)
    }

    /// Reconnect using new connection options for this and later connects.
    pub fn reconnect_with(&self, options: ConnectionOptions) -> Result<(), Error> {
        self.reconnect_inner(Some(options))
    }

    #[tracing::instrument(level = "debug", skip(self, options), fields(session_id = %self.id()))]
    fn reconnect_inner(&self, options: Option<ConnectionOptions>) -> Result<(), Error> {
        let shared = &self.inner.shared;
        let mut state = self.inner.state.lock();
        let jobs = match &mut *state {
            Lifecycle::Threaded { jobs, .. } => jobs.clone(),
            Lifecycle::Inline(connector) => {
                if let Some(options) = options {
                    connector.replace_options(options);
                }
                let result = connector.reconnect(ReconnectMode::User);
                if result.is_ok() {
                    shared.publish_connection(connector.capability());
                }
                return result;
            }
            Lifecycle::Idle(_) => {
                return Err(shared.session_error(
                    SessionErrorKind::NotOpen,
                    "The session has not been opened.",
                ));
            }
            Lifecycle::Closed => return Err(shared.closed_error()),
        };
        drop(state);

        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
        jobs.send(Job::Reconnect {
            options,
            reply: reply_tx,
        })
        .map_err(|_| shared.closed_error())?;
        reply_rx.recv().map_err(|_| {
            shared.session_error(
                SessionErrorKind::WorkerGone,
                "The session thread exited before reconnecting.",
            )
        })?
    }

    // ==================== Task submission ====================

    /// Submit a query.
    ///
    /// Threaded sessions enqueue and return `Ok(None)` at once; events arrive
    /// on the request's sink. Non-threaded sessions run the query in the
    /// calling thread and return its outcome.
    pub fn execute(&self, request: QueryRequest) -> Result<Option<TaskOutcome>, Error> {
        // A pending kill targeted the previous query.
        self.shared().killed.store(false, Ordering::SeqCst);
        self.submit(QueryTask::new(request))
    }

    fn submit<T: RecordedTask>(&self, task: T) -> Result<Option<TaskOutcome>, Error> {
        let mut state = self.inner.state.lock();
        match &mut *state {
            Lifecycle::Threaded { jobs, .. } => {
                self.enqueue(jobs, Box::new(task))?;
                Ok(None)
            }
            Lifecycle::Inline(connector) => {
                let mut task = task.recording();
                worker::run_task(self.shared(), connector, &mut task);
                Ok(Some(task.outcome()))
            }
            Lifecycle::Idle(_) => Err(self.shared().session_error(
                SessionErrorKind::NotOpen,
                "The session has not been opened.",
            )),
            Lifecycle::Closed => Err(self.shared().closed_error()),
        }
    }

    /// Submit a custom task. Runs synchronously in non-threaded sessions.
    pub fn add_task(&self, mut task: Box<dyn Task>) -> Result<(), Error> {
        let mut state = self.inner.state.lock();
        match &mut *state {
            Lifecycle::Threaded { jobs, .. } => self.enqueue(jobs, task),
            Lifecycle::Inline(connector) => {
                worker::run_task(self.shared(), connector, task.as_mut());
                Ok(())
            }
            Lifecycle::Idle(_) => Err(self.shared().session_error(
                SessionErrorKind::NotOpen,
                "The session has not been opened.",
            )),
            Lifecycle::Closed => Err(self.shared().closed_error()),
        }
    }

    fn enqueue(&self, jobs: &Sender<Job>, task: Box<dyn Task>) -> Result<(), Error> {
        let registry = &self.shared().registry;
        let request_id = task.request_id().map(str::to_string);
        if let Some(id) = &request_id {
            registry.enqueue(id);
        }
        tracing::trace!(session_id = %self.id(), request_id = ?request_id, "task enqueued");
        if jobs.send(Job::Task(task)).is_err() {
            if let Some(id) = &request_id {
                registry.begin(id);
            }
            return Err(self.shared().closed_error());
        }
        Ok(())
    }

    pub fn start_transaction(&self) -> Result<Option<TaskOutcome>, Error> {
        self.execute(QueryRequest::new("BEGIN"))
    }

    pub fn commit(&self) -> Result<Option<TaskOutcome>, Error> {
        self.execute(QueryRequest::new("COMMIT"))
    }

    pub fn rollback(&self) -> Result<Option<TaskOutcome>, Error> {
        self.execute(QueryRequest::new("ROLLBACK"))
    }

    // ==================== Schemas ====================

    /// Schema the backend reported for the latest connect; `None` before
    /// `open()` or for backends without schemas.
    pub fn default_schema(&self) -> Option<String> {
        self.shared().default_schema.lock().clone()
    }

    /// Report the current schema as the task's `result`.
    pub fn get_current_schema(
        &self,
        request_id: Option<&str>,
        sink: ResultSink,
    ) -> Result<Option<TaskOutcome>, Error> {
        self.submit(SchemaTask::new(
            SchemaAction::Current,
            request_id.map(str::to_string),
            sink,
        ))
    }

    /// Switch the schema unqualified statements resolve against. The task's
    /// `result` is the new current schema.
    pub fn set_current_schema(
        &self,
        schema: impl Into<String>,
        request_id: Option<&str>,
        sink: ResultSink,
    ) -> Result<Option<TaskOutcome>, Error> {
        self.submit(SchemaTask::new(
            SchemaAction::SetCurrent(schema.into()),
            request_id.map(str::to_string),
            sink,
        ))
    }

    /// Mark a queued request for cancellation. Returns `false` when no task
    /// with that id is waiting.
    pub fn cancel_request(&self, request_id: &str) -> bool {
        let marked = self.shared().registry.cancel(request_id);
        tracing::debug!(session_id = %self.id(), request_id, marked, "cancel requested");
        marked
    }

    /// Ask the running query to stop: it ends before its next row fetch, and
    /// a statement still inside the backend is interrupted when the backend
    /// supports it.
    pub fn kill(&self) {
        tracing::debug!(session_id = %self.id(), "kill requested");
        self.shared().killed.store(true, Ordering::SeqCst);
        let interrupter = self.shared().interrupter.lock().clone();
        if let Some(interrupt) = interrupter {
            interrupt();
        }
    }

    pub fn is_killed(&self) -> bool {
        self.shared().killed.load(Ordering::SeqCst)
    }

    pub fn add_task_observer<F>(&self, observer: F)
    where
        F: Fn(TaskPhase, Option<&str>) + Send + Sync + 'static,
    {
        self.shared().observers.write().push(Arc::new(observer));
    }

    /// Observe connects, reconnects and failed attempts. Register before
    /// [`open`](Self::open) to see the initial connect.
    pub fn add_connection_observer<F>(&self, observer: F)
    where
        F: Fn(&ConnectionEvent<'_>) + Send + Sync + 'static,
    {
        self.shared().hooks.add_observer(Arc::new(observer));
    }

    /// Install setup that is redone after every (re)connect.
    pub fn add_setup_hook(&self, hook: impl SetupHook + 'static) {
        self.shared().hooks.add_setup_hook(Box::new(hook));
    }

    // ==================== Status ====================

    fn with_stats<T>(&self, f: impl FnOnce(&SessionStats) -> T) -> Result<T, Error> {
        let shared = self.shared();
        let guard = shared
            .stats
            .try_lock_for(shared.config.status_timeout)
            .ok_or(Error::Timeout)?;
        let stats = guard.try_borrow().map_err(|_| Error::Timeout)?;
        Ok(f(&stats))
    }

    pub fn stats(&self) -> Result<SessionStats, Error> {
        self.with_stats(SessionStats::clone)
    }

    pub fn last_error(&self) -> Result<Option<ErrorPayload>, Error> {
        self.with_stats(|s| s.last_error.clone())
    }

    pub fn last_execution_time(&self) -> Result<Option<Duration>, Error> {
        self.with_stats(|s| s.last_execution_time)
    }

    pub fn last_insert_id(&self) -> Result<Option<i64>, Error> {
        self.with_stats(|s| s.last_insert_id)
    }

    pub fn rows_affected(&self) -> Result<u64, Error> {
        self.with_stats(|s| s.rows_affected)
    }

    pub fn last_status(&self) -> Result<SessionStatus, Error> {
        self.with_stats(|s| match &s.last_error {
            Some(error) => SessionStatus {
                state: TaskState::Error,
                msg: error.msg.clone(),
            },
            None => SessionStatus {
                state: TaskState::Ok,
                msg: format!(
                    "Query finished in {:.3} seconds.",
                    s.last_execution_time.unwrap_or_default().as_secs_f64()
                ),
            },
        })
    }

    /// Session description merged with what the backend reported at connect.
    pub fn info(&self) -> serde_json::Value {
        let shared = self.shared();
        let mut info = shared.info.lock().clone();
        if let Some(map) = info.as_object_mut() {
            map.insert("id".into(), shared.id.clone().into());
            map.insert("threaded".into(), shared.config.threaded.into());
            map.insert("auto_reconnect".into(), shared.auto_reconnect.into());
        }
        info
    }
}
