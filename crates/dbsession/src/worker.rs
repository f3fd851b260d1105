//! The per-session worker thread.
//!
//! One OS thread per session owns the [`Connector`] and drains an unbounded
//! FIFO of [`Job`]s. Everything that touches the capability runs here, one
//! job at a time.
//!
//! A panic raised by a task or one of its callbacks is contained: the task
//! ends in `ERROR` and the worker carries on. Should the loop itself unwind,
//! dropping the worker still releases the capability and signals
//! termination, so `close()` never waits for a thread that is gone.

use crate::connector::{Connector, ReconnectMode};
use crate::keepalive::Prober;
use crate::session::{Shared, TaskPhase};
use crate::task::{Task, TaskContext};
use dbsession_core::{ConnectionOptions, Error, SessionError, SessionErrorKind};
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::sync::mpsc::{self, Receiver, Sender, SyncSender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Messages consumed by the worker loop.
pub(crate) enum Job {
    Task(Box<dyn Task>),
    Reconnect {
        options: Option<ConnectionOptions>,
        reply: SyncSender<Result<(), Error>>,
    },
    KeepAlive,
    Close,
}

// ==================== One-shot latch ====================

/// A one-shot signal that can be awaited by any number of threads.
#[derive(Debug, Default)]
pub struct Latch {
    set: Mutex<bool>,
    cond: Condvar,
}

impl Latch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        *self.set.lock() = true;
        self.cond.notify_all();
    }

    pub fn is_set(&self) -> bool {
        *self.set.lock()
    }

    pub fn wait(&self) {
        let mut set = self.set.lock();
        while !*set {
            self.cond.wait(&mut set);
        }
    }

    /// Returns whether the latch was set before `timeout` elapsed.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut set = self.set.lock();
        while !*set {
            if self.cond.wait_until(&mut set, deadline).timed_out() {
                return *set;
            }
        }
        true
    }
}

// ==================== Spawning ====================

/// Start the worker thread and block until its connect attempt finished.
pub(crate) fn spawn(
    shared: Arc<Shared>,
    connector: Connector,
    jobs: Receiver<Job>,
    keepalive_tx: Sender<Job>,
) -> Result<JoinHandle<()>, Error> {
    let (init_tx, init_rx) = mpsc::sync_channel(1);
    let session_id = shared.id.clone();
    let worker_shared = Arc::clone(&shared);

    let handle = thread::Builder::new()
        .name(format!("sql-{}", session_id))
        .spawn(move || {
            let worker = Worker {
                shared: worker_shared,
                connector,
                jobs,
                prober: None,
                finished: false,
            };
            worker.run(&init_tx, keepalive_tx);
        })
        .map_err(|e| {
            Error::Session(SessionError {
                kind: SessionErrorKind::Spawn,
                session_id: session_id.clone(),
                message: format!("Failed to start the session thread: {}", e),
            })
        })?;
    shared.set_worker_thread(handle.thread().id());

    match init_rx.recv() {
        Ok(Ok(())) => Ok(handle),
        Ok(Err(e)) => {
            let _ = handle.join();
            Err(e)
        }
        Err(_) => {
            let _ = handle.join();
            Err(Error::Session(SessionError {
                kind: SessionErrorKind::WorkerGone,
                session_id,
                message: "The session thread exited during startup.".to_string(),
            }))
        }
    }
}

struct Worker {
    shared: Arc<Shared>,
    connector: Connector,
    jobs: Receiver<Job>,
    prober: Option<Prober>,
    /// Set once the capability was released and termination signalled
    finished: bool,
}

impl Worker {
    fn run(mut self, init: &SyncSender<Result<(), Error>>, keepalive_tx: Sender<Job>) {
        let span = tracing::info_span!("session_worker", session_id = %self.shared.id);
        let _enter = span.enter();

        if let Err(e) = self.connector.open() {
            tracing::error!(error = %e, "failed to open session");
            self.connector.release();
            self.finished = true;
            self.shared.terminated.set();
            let _ = init.send(Err(e));
            return;
        }
        self.shared.publish_connection(self.connector.capability());
        tracing::info!(backend = self.connector.backend(), "session opened");
        let _ = init.send(Ok(()));

        match self.connector.options().keepalive_interval() {
            Some(interval) => {
                let shared = Arc::clone(&self.shared);
                let tick = move || {
                    // One outstanding keep-alive is enough while a long task runs.
                    if shared.keepalive_pending.swap(true, Ordering::SeqCst) {
                        return true;
                    }
                    keepalive_tx.send(Job::KeepAlive).is_ok()
                };
                match Prober::start(&self.shared.id, interval, tick) {
                    Ok(prober) => self.prober = Some(prober),
                    Err(e) => tracing::warn!(error = %e, "failed to start keep-alive prober"),
                }
            }
            None => drop(keepalive_tx),
        }

        loop {
            // Every sender gone means nobody can submit work any more.
            let Ok(job) = self.jobs.recv() else {
                tracing::debug!("job queue disconnected");
                break;
            };
            match job {
                Job::Close => break,
                Job::Reconnect { options, reply } => {
                    if let Some(options) = options {
                        self.connector.replace_options(options);
                    }
                    let result = self.connector.reconnect(ReconnectMode::User);
                    if result.is_ok() {
                        self.shared.publish_connection(self.connector.capability());
                    }
                    let _ = reply.send(result);
                }
                Job::KeepAlive => {
                    self.shared.keepalive_pending.store(false, Ordering::SeqCst);
                    self.connector.keep_alive();
                }
                Job::Task(mut task) => run_task(&self.shared, &mut self.connector, task.as_mut()),
            }
        }

        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(prober) = self.prober.take() {
            prober.stop();
        }

        let mut drained = 0_usize;
        while let Ok(job) = self.jobs.try_recv() {
            match job {
                Job::Task(mut task) => {
                    if let Some(id) = task.request_id() {
                        self.shared.registry.begin(id);
                    }
                    if let Err(panic) = catch_panic(|| task.cancel()) {
                        tracing::error!(panic = %panic, "task panicked while being cancelled");
                    }
                    drained += 1;
                }
                Job::Reconnect { reply, .. } => {
                    let _ = reply.send(Err(self.shared.closed_error()));
                }
                Job::KeepAlive | Job::Close => {}
            }
        }
        if drained > 0 {
            tracing::debug!(drained, "cancelled tasks still queued at close");
        }

        self.connector.release();
        self.finished = true;
        self.shared.terminated.set();
        tracing::info!("session closed");
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if !self.finished {
            tracing::error!(session_id = %self.shared.id, "session worker unwinding");
            self.shutdown();
        }
    }
}

/// Run `f`, turning a panic into its message.
pub(crate) fn catch_panic<T>(f: impl FnOnce() -> T) -> Result<T, String> {
    panic::catch_unwind(AssertUnwindSafe(f)).map_err(|payload| panic_message(payload.as_ref()))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Run one task the way the worker loop does: consult the cancellation
/// registry, reset the kill flag, then execute (or cancel) under the session
/// mutex and copy the task's statistics onto the session.
///
/// A panic inside the task fails it with `ERROR` instead of unwinding into
/// the caller.
pub(crate) fn run_task(shared: &Shared, connector: &mut Connector, task: &mut dyn Task) {
    let request_id = task.request_id().map(str::to_string);
    let cancelled = request_id
        .as_deref()
        .is_some_and(|id| shared.registry.begin(id));
    shared.killed.store(false, Ordering::SeqCst);

    shared.notify(TaskPhase::Started, request_id.as_deref());
    {
        let guard = shared.stats.lock();
        let ran = catch_panic(|| {
            if cancelled {
                tracing::debug!(request_id = ?request_id, "task cancelled before execution");
                task.cancel();
            } else {
                let mut ctx = TaskContext::new(
                    &shared.id,
                    connector,
                    &shared.killed,
                    shared.config.statement_retries,
                );
                task.execute(&mut ctx);
            }
        });
        if let Err(panic) = ran {
            tracing::error!(request_id = ?request_id, panic = %panic, "task panicked");
            let error = Error::Custom(format!("Task panicked: {}", panic));
            if let Err(panic) = catch_panic(|| task.fail(&error)) {
                tracing::error!(
                    request_id = ?request_id,
                    panic = %panic,
                    "task panicked again while reporting the failure"
                );
            }
        }
        guard.borrow_mut().apply(&task.stats());
    }
    shared.notify(TaskPhase::Finished, request_id.as_deref());
}
