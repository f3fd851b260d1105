//! dbsession - serial, per-connection SQL session workers.
//!
//! A [`Session`] owns exactly one database connection and executes the work
//! submitted to it strictly in order on a dedicated thread, while any number
//! of callers keep submitting concurrently. Results stream back as
//! [`TaskEvent`]s in bounded chunks.
//!
//! - **Serial execution**: one worker thread per session, unbounded FIFO queue
//! - **Streaming**: rows delivered in chunks of `row_packet_size`
//! - **Resilience**: bounded reconnect-and-retry on lost connections, optional
//!   keep-alive probing
//! - **Control**: queued requests can be cancelled, running ones killed
//! - **Hooks**: connection observers and per-connection setup hooks
//!
//! # Quick Start
//!
//! ```ignore
//! use dbsession::prelude::*;
//!
//! let factory = SessionFactory::default();
//! let session = factory.create(
//!     "Sqlite",
//!     "main",
//!     ConnectionOptions::new().option("db_file", "app.db"),
//!     SessionConfig::default(),
//! )?;
//! session.open()?;
//!
//! let (tx, rx) = std::sync::mpsc::channel();
//! session.execute(
//!     QueryRequest::new("SELECT * FROM users")
//!         .request_id("users-1")
//!         .row_packet_size(500)
//!         .sink(tx.into()),
//! )?;
//! for event in rx {
//!     if let Some(chunk) = event.rows() {
//!         println!("{} rows so far", chunk.total_row_count);
//!     }
//!     if event.state.is_terminal() {
//!         break;
//!     }
//! }
//! session.close()?;
//! ```

pub mod cancel;
pub mod config;
pub mod connector;
pub mod factory;
pub mod keepalive;
pub mod session;
pub mod task;
mod worker;

pub use cancel::CancellationRegistry;
pub use config::SessionConfig;
pub use connector::{
    ConnectAttempt, ConnectionEvent, ConnectionHooks, ConnectionObserver, ReconnectMode, SetupHook,
};
pub use factory::{SessionFactory, register_builtin};
pub use session::{Session, SessionStats, SessionStatus, TaskObserver, TaskPhase};
pub use task::{
    Dispatcher, ErrorPayload, QueryRequest, QueryTask, ResultChunk, ResultShape, ResultSink,
    STARTED_MESSAGE, SchemaAction, SchemaTask, Task, TaskContext, TaskData, TaskEvent,
    TaskFailure, TaskOutcome, TaskState, TaskStats, TaskTracker, rows_transferred_message,
};
pub use worker::Latch;

pub use dbsession_core::{
    Capability, Column, ColumnInfo, ConnectionOptions, Error, ErrorSource, Interrupter, Result,
    Row, Value,
};

/// Common imports for session users.
pub mod prelude {
    pub use crate::{
        Capability, ConnectionOptions, Error, QueryRequest, ResultShape, ResultSink, Session,
        SessionConfig, SessionFactory, TaskEvent, TaskState, Value,
    };
}
