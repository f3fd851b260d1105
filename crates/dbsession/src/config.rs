//! Session worker configuration.

use std::time::Duration;

/// Tunables for one session worker.
///
/// Backend connection details live in
/// [`ConnectionOptions`](dbsession_core::ConnectionOptions); this struct only
/// controls how the engine drives that connection.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Run tasks on a dedicated worker thread (otherwise in the caller)
    pub threaded: bool,
    /// Maximum wait for the session mutex in status accessors
    pub status_timeout: Duration,
    /// Retries of one statement after a lost connection was restored
    pub statement_retries: u32,
    /// Connect attempts made by an automatic reconnect
    pub reconnect_attempts: u32,
    /// Pause between automatic reconnect attempts
    pub reconnect_delay: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            threaded: true,
            status_timeout: Duration::from_secs(5),
            statement_retries: 1,
            reconnect_attempts: 3,
            reconnect_delay: Duration::from_secs(5),
        }
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set threaded mode.
    pub fn threaded(mut self, threaded: bool) -> Self {
        self.threaded = threaded;
        self
    }

    /// Set the status accessor timeout.
    pub fn status_timeout(mut self, timeout: Duration) -> Self {
        self.status_timeout = timeout;
        self
    }

    /// Set the per-statement retry bound.
    pub fn statement_retries(mut self, n: u32) -> Self {
        self.statement_retries = n;
        self
    }

    /// Set the number of automatic reconnect attempts (at least one is made).
    pub fn reconnect_attempts(mut self, n: u32) -> Self {
        self.reconnect_attempts = n;
        self
    }

    /// Set the delay between automatic reconnect attempts.
    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }
}
