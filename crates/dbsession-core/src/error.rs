//! Error types for dbsession operations.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The primary error type for all session and capability operations.
#[derive(Debug)]
pub enum Error {
    /// Connection-related errors (connect, disconnect, lost connection)
    Connection(ConnectionError),
    /// Statement execution errors
    Query(QueryError),
    /// Invalid connection options or session configuration
    Config(ConfigError),
    /// Backend registry errors
    Backend(BackendError),
    /// Session lifecycle and queue errors
    Session(SessionError),
    /// I/O errors
    Io(std::io::Error),
    /// A bounded wait expired
    Timeout,
    /// Custom error with message
    Custom(String),
}

/// The layer an error originated from.
///
/// Carried through to dispatched `ERROR` events so that consumers can tell a
/// server-side failure from a driver or engine failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ErrorSource {
    /// A remote database server rejected the statement
    Database,
    /// The client driver failed (protocol, socket, API misuse)
    Driver,
    /// An embedded storage engine (e.g. SQLite) reported the error
    Storage,
    /// The session engine itself
    Engine,
}

impl ErrorSource {
    pub const fn as_str(self) -> &'static str {
        match self {
            ErrorSource::Database => "DATABASE",
            ErrorSource::Driver => "DRIVER",
            ErrorSource::Storage => "STORAGE",
            ErrorSource::Engine => "ENGINE",
        }
    }
}

impl fmt::Display for ErrorSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub origin: ErrorSource,
    pub code: Option<i64>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Failed to establish connection
    Connect,
    /// Authentication failed
    Authentication,
    /// Connection lost during operation
    Disconnected,
    /// Operation attempted while no connection is open
    NotConnected,
    /// Connection refused
    Refused,
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub origin: ErrorSource,
    pub code: Option<i64>,
    pub sql: Option<String>,
    pub sqlstate: Option<String>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Syntax error in SQL
    Syntax,
    /// Constraint violation (unique, foreign key, etc.)
    Constraint,
    /// Table or column not found
    NotFound,
    /// Permission denied
    Permission,
    /// Data too large for column
    DataTruncation,
    /// Lock contention (busy / deadlock)
    Deadlock,
    /// Statement timeout
    Timeout,
    /// Interrupted by the engine (server-side kill or interrupt)
    Interrupted,
    /// Stopped by the session kill switch while streaming rows
    Killed,
    /// Parameter binding failed
    Bind,
    /// Other database error
    Database,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub option: Option<String>,
}

#[derive(Debug)]
pub struct BackendError {
    pub kind: BackendErrorKind,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendErrorKind {
    /// No constructor registered under the requested name
    NotRegistered,
}

#[derive(Debug)]
pub struct SessionError {
    pub kind: SessionErrorKind,
    pub session_id: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionErrorKind {
    /// `open()` called on a session that was already opened
    AlreadyOpen,
    /// Operation requires an open session
    NotOpen,
    /// The worker has terminated and no longer accepts tasks
    Closed,
    /// The worker thread could not be spawned
    Spawn,
    /// The worker exited without answering a control request
    WorkerGone,
}

impl Error {
    /// Build the error raised when a row-streaming task observes the kill switch.
    pub fn killed(sql: Option<&str>) -> Self {
        Error::Query(QueryError {
            kind: QueryErrorKind::Killed,
            origin: ErrorSource::Engine,
            code: None,
            sql: sql.map(str::to_string),
            sqlstate: None,
            message: "Query killed".to_string(),
            source: None,
        })
    }

    /// Build a `NotConnected` error for capabilities used after disconnect.
    pub fn not_connected(origin: ErrorSource) -> Self {
        Error::Connection(ConnectionError {
            kind: ConnectionErrorKind::NotConnected,
            origin,
            code: None,
            message: "Not connected.".to_string(),
            source: None,
        })
    }

    /// Build a configuration error about a specific option.
    pub fn config(option: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Config(ConfigError {
            message: message.into(),
            option: Some(option.into()),
        })
    }

    /// Is this a transient loss of connectivity that a reconnect may fix?
    pub fn is_connection_lost(&self) -> bool {
        match self {
            Error::Connection(c) => matches!(
                c.kind,
                ConnectionErrorKind::Disconnected | ConnectionErrorKind::NotConnected
            ),
            Error::Io(_) => true,
            _ => false,
        }
    }

    /// Was the statement stopped by the session kill switch?
    pub fn is_killed(&self) -> bool {
        matches!(self, Error::Query(q) if q.kind == QueryErrorKind::Killed)
    }

    /// The layer this error came from.
    pub fn origin(&self) -> ErrorSource {
        match self {
            Error::Connection(c) => c.origin,
            Error::Query(q) => q.origin,
            Error::Io(_) => ErrorSource::Driver,
            _ => ErrorSource::Engine,
        }
    }

    /// Engine-specific error code, if available.
    pub fn code(&self) -> Option<i64> {
        match self {
            Error::Connection(c) => c.code,
            Error::Query(q) => q.code,
            _ => None,
        }
    }

    /// Get SQLSTATE if available (e.g., "23505" for unique violation)
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sqlstate.as_deref(),
            _ => None,
        }
    }

    /// Get the SQL that caused this error, if available
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sql.as_deref(),
            _ => None,
        }
    }

    /// The bare message, without the category prefix used by `Display`.
    pub fn message(&self) -> String {
        match self {
            Error::Connection(e) => e.message.clone(),
            Error::Query(e) => e.message.clone(),
            Error::Config(e) => e.message.clone(),
            Error::Backend(e) => e.to_string(),
            Error::Session(e) => e.message.clone(),
            Error::Io(e) => e.to_string(),
            Error::Timeout => "Operation timed out".to_string(),
            Error::Custom(msg) => msg.clone(),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connection(e) => write!(f, "Connection error: {}", e.message),
            Error::Query(e) => {
                if let Some(sqlstate) = &e.sqlstate {
                    write!(f, "Query error (SQLSTATE {}): {}", sqlstate, e.message)
                } else {
                    write!(f, "Query error: {}", e.message)
                }
            }
            Error::Config(e) => write!(f, "Configuration error: {}", e),
            Error::Backend(e) => write!(f, "Backend error: {}", e),
            Error::Session(e) => write!(f, "Session error: {}", e),
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Timeout => write!(f, "Operation timed out"),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Connection(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Query(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(sqlstate) = &self.sqlstate {
            write!(f, "{} (SQLSTATE {})", self.message, sqlstate)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.option {
            Some(option) => write!(f, "{} (option '{}')", self.message, option),
            None => write!(f, "{}", self.message),
        }
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            BackendErrorKind::NotRegistered => {
                write!(f, "There is no registered session with the name: {}", self.name)
            }
        }
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.session_id, self.message)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Error::Connection(err)
    }
}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

impl From<BackendError> for Error {
    fn from(err: BackendError) -> Self {
        Error::Backend(err)
    }
}

impl From<SessionError> for Error {
    fn from(err: SessionError) -> Self {
        Error::Session(err)
    }
}

/// Result type alias for dbsession operations.
pub type Result<T> = std::result::Result<T, Error>;
