//! Ownership of one capability plus its reconnect policy.
//!
//! Every connect attempt, initial or reconnect, goes through the same path:
//! setup hooks get `on_connect`, the capability connects, setup hooks get
//! `on_connected` with the fresh connection, and connection observers hear
//! about the outcome.

use crate::worker::catch_panic;
use dbsession_core::{Capability, ConnectionOptions, Error};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;

/// Whether a reconnect was requested by a caller or triggered by a lost
/// connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectMode {
    /// Single attempt, never retried
    User,
    /// Up to `reconnect_attempts` attempts separated by `reconnect_delay`
    Automatic,
}

/// What a connect attempt was made for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectAttempt {
    Open,
    Reconnect(ReconnectMode),
}

/// Connection life-cycle notification.
#[derive(Debug, Clone, Copy)]
pub enum ConnectionEvent<'a> {
    Connecting(ConnectAttempt),
    Connected(ConnectAttempt),
    Failed(ConnectAttempt, &'a Error),
}

/// Callback invoked for every [`ConnectionEvent`], on the thread that
/// connects.
pub type ConnectionObserver = Arc<dyn Fn(&ConnectionEvent<'_>) + Send + Sync>;

/// Per-connection setup that must be redone after every (re)connect, such
/// as session variables.
pub trait SetupHook: Send {
    /// Before every connect attempt.
    fn on_connect(&mut self) {}

    /// After the capability connected. An error fails the attempt.
    fn on_connected(&mut self, capability: &mut dyn Capability) -> Result<(), Error> {
        let _ = capability;
        Ok(())
    }

    fn on_failed_connection(&mut self, error: &Error) {
        let _ = error;
    }

    /// Once, before the capability is released.
    fn on_close(&mut self) {}
}

/// Observers and setup hooks shared by a session handle and its connector.
#[derive(Default)]
pub struct ConnectionHooks {
    observers: RwLock<Vec<ConnectionObserver>>,
    setup: Mutex<Vec<Box<dyn SetupHook>>>,
}

impl ConnectionHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_observer(&self, observer: ConnectionObserver) {
        self.observers.write().push(observer);
    }

    pub fn add_setup_hook(&self, hook: Box<dyn SetupHook>) {
        self.setup.lock().push(hook);
    }

    fn notify(&self, event: &ConnectionEvent<'_>) {
        let observers = self.observers.read().clone();
        for observer in observers {
            if let Err(panic) = catch_panic(|| observer(event)) {
                tracing::error!(panic = %panic, "connection observer panicked");
            }
        }
    }

    fn before_connect(&self, attempt: ConnectAttempt) {
        for hook in self.setup.lock().iter_mut() {
            hook.on_connect();
        }
        self.notify(&ConnectionEvent::Connecting(attempt));
    }

    fn after_connect(&self, capability: &mut dyn Capability) -> Result<(), Error> {
        for hook in self.setup.lock().iter_mut() {
            hook.on_connected(capability)?;
        }
        Ok(())
    }

    fn connected(&self, attempt: ConnectAttempt) {
        self.notify(&ConnectionEvent::Connected(attempt));
    }

    fn failed(&self, attempt: ConnectAttempt, error: &Error) {
        for hook in self.setup.lock().iter_mut() {
            hook.on_failed_connection(error);
        }
        self.notify(&ConnectionEvent::Failed(attempt, error));
    }

    fn closing(&self) {
        for hook in self.setup.lock().iter_mut() {
            hook.on_close();
        }
    }
}

impl std::fmt::Debug for ConnectionHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHooks")
            .field("observers", &self.observers.read().len())
            .field("setup", &self.setup.lock().len())
            .finish()
    }
}

/// The worker-side owner of a session's capability.
pub struct Connector {
    session_id: String,
    capability: Box<dyn Capability>,
    options: ConnectionOptions,
    hooks: Arc<ConnectionHooks>,
    reconnect_attempts: u32,
    reconnect_delay: Duration,
    reconnects: u64,
    released: bool,
}

impl Connector {
    pub fn new(
        session_id: impl Into<String>,
        capability: Box<dyn Capability>,
        options: ConnectionOptions,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            capability,
            options,
            hooks: Arc::new(ConnectionHooks::new()),
            reconnect_attempts: 3,
            reconnect_delay: Duration::from_secs(5),
            reconnects: 0,
            released: false,
        }
    }

    pub fn reconnect_policy(mut self, attempts: u32, delay: Duration) -> Self {
        self.reconnect_attempts = attempts;
        self.reconnect_delay = delay;
        self
    }

    /// Share `hooks` with the session handle.
    pub fn hooks(mut self, hooks: Arc<ConnectionHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn capability(&mut self) -> &mut dyn Capability {
        &mut *self.capability
    }

    pub fn backend(&self) -> &'static str {
        self.capability.backend()
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    pub fn auto_reconnect(&self) -> bool {
        self.options.auto_reconnect
    }

    /// Successful reconnects performed so far.
    pub fn reconnects(&self) -> u64 {
        self.reconnects
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    pub fn open(&mut self) -> Result<(), Error> {
        self.ensure_not_released()?;
        self.connect_once(ConnectAttempt::Open)
    }

    fn connect_once(&mut self, attempt: ConnectAttempt) -> Result<(), Error> {
        self.hooks.before_connect(attempt);
        let result = self
            .capability
            .connect(&self.options)
            .and_then(|()| self.hooks.after_connect(&mut *self.capability));
        match &result {
            Ok(()) => self.hooks.connected(attempt),
            Err(e) => self.hooks.failed(attempt, e),
        }
        result
    }

    /// Swap the connection options used by subsequent (re)connects.
    ///
    /// `auto_reconnect` is fixed for the session's lifetime and is kept.
    pub fn replace_options(&mut self, mut options: ConnectionOptions) {
        options.auto_reconnect = self.options.auto_reconnect;
        self.options = options;
    }

    pub fn reconnect(&mut self, mode: ReconnectMode) -> Result<(), Error> {
        self.ensure_not_released()?;
        let attempts = match mode {
            ReconnectMode::User => 1,
            ReconnectMode::Automatic => self.reconnect_attempts.max(1),
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            tracing::debug!(
                session_id = %self.session_id,
                ?mode,
                attempt,
                "reconnecting"
            );
            self.capability.disconnect();
            match self.connect_once(ConnectAttempt::Reconnect(mode)) {
                Ok(()) => {
                    self.reconnects += 1;
                    tracing::info!(session_id = %self.session_id, ?mode, attempt, "reconnected");
                    return Ok(());
                }
                Err(e) if attempt < attempts => {
                    tracing::warn!(
                        session_id = %self.session_id,
                        attempt,
                        error = %e,
                        "reconnect attempt failed"
                    );
                    if !self.reconnect_delay.is_zero() {
                        std::thread::sleep(self.reconnect_delay);
                    }
                }
                Err(e) => {
                    tracing::error!(session_id = %self.session_id, attempts, error = %e, "reconnect failed");
                    return Err(e);
                }
            }
        }
    }

    pub fn reconnect_automatic(&mut self) -> Result<(), Error> {
        self.reconnect(ReconnectMode::Automatic)
    }

    /// Keep-alive ping. A lost connection is restored automatically when
    /// the session allows it.
    pub fn keep_alive(&mut self) {
        if self.released {
            return;
        }
        match self.capability.ping() {
            Ok(()) => tracing::trace!(session_id = %self.session_id, "keep-alive ping ok"),
            Err(e) if e.is_connection_lost() && self.auto_reconnect() => {
                tracing::info!(session_id = %self.session_id, error = %e, "keep-alive detected a lost connection");
                let _ = self.reconnect_automatic();
            }
            Err(e) => tracing::warn!(session_id = %self.session_id, error = %e, "keep-alive ping failed"),
        }
    }

    /// Terminal teardown of the capability. Runs at most once.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.hooks.closing();
        self.capability.release();
        tracing::debug!(session_id = %self.session_id, "capability released");
    }

    fn ensure_not_released(&self) -> Result<(), Error> {
        if self.released {
            return Err(Error::Session(dbsession_core::SessionError {
                kind: dbsession_core::SessionErrorKind::Closed,
                session_id: self.session_id.clone(),
                message: "The session has been closed.".to_string(),
            }));
        }
        Ok(())
    }
}

impl Drop for Connector {
    fn drop(&mut self) {
        self.release();
    }
}
