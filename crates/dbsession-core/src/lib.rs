//! Core types and traits for dbsession.
//!
//! This crate provides the backend-neutral pieces shared by the session
//! engine and its drivers:
//!
//! - `Capability` trait for the driver-level connection a worker owns
//! - `ConnectionOptions` descriptor with keep-alive and reconnect knobs
//! - `Value`, `Row` and `ColumnInfo` for parameters and fetched data
//! - `Error` taxonomy with origin tagging for dispatched error payloads

pub mod capability;
pub mod error;
pub mod options;
pub mod row;
pub mod value;

pub use capability::{Capability, Interrupter, ResultStats};
pub use error::{
    BackendError, BackendErrorKind, ConfigError, ConnectionError, ConnectionErrorKind, Error,
    ErrorSource, QueryError, QueryErrorKind, Result, SessionError, SessionErrorKind,
};
pub use options::ConnectionOptions;
pub use row::{Column, ColumnInfo, Row};
pub use value::Value;
