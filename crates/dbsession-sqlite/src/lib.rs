//! SQLite backend for dbsession.
//!
// FFI bindings require unsafe code - this is expected for database drivers
#![allow(unsafe_code)]
//!
//! This crate provides [`SqliteCapability`], a [`dbsession_core::Capability`]
//! over the embedded SQLite library, so a session worker can drive a SQLite
//! database file exactly like any other backend.
//!
//! # Example
//!
//! ```rust,ignore
//! use dbsession_core::{Capability, ConnectionOptions};
//! use dbsession_sqlite::SqliteCapability;
//!
//! let mut cap = SqliteCapability::new();
//! cap.connect(&ConnectionOptions::new().option("db_file", ":memory:"))?;
//! cap.execute("SELECT 1 AS one; SELECT 2 AS two", &[])?;
//! while let Some(row) = cap.fetch_row()? { /* ... */ }
//! assert!(cap.next_result()?);
//! ```
//!
//! # Type Mapping
//!
//! | dbsession `Value` | SQLite storage class |
//! |-------------------|----------------------|
//! | `Bool`            | INTEGER (0/1)        |
//! | `Int`             | INTEGER              |
//! | `Double`          | REAL                 |
//! | `Text`, `Json`    | TEXT                 |
//! | `Bytes`           | BLOB                 |
//! | `Null`            | NULL                 |

// Links the bundled amalgamation that the `ffi` declarations resolve against.
use libsqlite3_sys as _;

pub mod connection;
pub mod ffi;
pub mod types;

pub use connection::{Attachment, BACKEND_NAME, OpenFlags, SqliteCapability, SqliteConfig};

/// The SQLite library version.
pub fn sqlite_version() -> &'static str {
    ffi::version()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqlite_version() {
        let version = sqlite_version();
        assert!(
            version.starts_with('3'),
            "Expected SQLite 3.x, got {}",
            version
        );
    }
}
