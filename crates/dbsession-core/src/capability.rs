//! The driver-level contract a session worker drives.
//!
//! A [`Capability`] is the single object that talks to a database engine. The
//! session worker owns it exclusively: no other thread ever calls into it, so
//! implementations only need to be `Send`.
//!
//! The statement protocol is cursor-like:
//!
//! 1. [`execute`](Capability::execute) runs one statement text and positions
//!    the cursor on its first result set.
//! 2. [`columns`](Capability::columns) and [`fetch_row`](Capability::fetch_row)
//!    read the current result set until `fetch_row` yields `None`.
//! 3. [`next_result`](Capability::next_result) advances to the following
//!    result set, returning `false` once the statement is exhausted.
//!
//! The only thing a capability may hand to another thread is its
//! [`Interrupter`], which aborts the statement currently running.

use crate::error::{Error, Result};
use crate::options::ConnectionOptions;
use crate::row::{ColumnInfo, Row};
use crate::value::Value;
use serde::Serialize;
use std::sync::Arc;

/// Outcome counters of the most recent statement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResultStats {
    pub rows_affected: u64,
    pub last_insert_id: Option<i64>,
}

/// Thread-safe handle that aborts the statement a capability is running.
///
/// Calling it while no statement runs must be harmless.
pub type Interrupter = Arc<dyn Fn() + Send + Sync>;

/// A live (or connectable) database connection.
pub trait Capability: Send {
    /// Backend name, as registered in the session factory.
    fn backend(&self) -> &'static str;

    /// Establish the connection described by `options`.
    ///
    /// Called once at session start and again for every reconnect, after
    /// [`disconnect`](Capability::disconnect).
    fn connect(&mut self, options: &ConnectionOptions) -> Result<()>;

    /// Drop the current connection, keeping the capability reusable.
    fn disconnect(&mut self);

    /// Terminal teardown. The worker calls this exactly once.
    fn release(&mut self) {
        self.disconnect();
    }

    fn is_connected(&self) -> bool;

    /// Execute a statement, binding `params` positionally.
    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<()>;

    /// Column metadata of the current result set (empty for statements that
    /// return no rows).
    fn columns(&self) -> Arc<ColumnInfo>;

    /// Fetch the next row of the current result set.
    fn fetch_row(&mut self) -> Result<Option<Row>>;

    /// Advance to the next result set of the current statement.
    fn next_result(&mut self) -> Result<bool>;

    fn stats(&self) -> ResultStats;

    /// Cheap liveness check used by the keep-alive prober.
    fn ping(&mut self) -> Result<()> {
        self.execute("SELECT 1", &[])?;
        while self.fetch_row()?.is_some() {}
        while self.next_result()? {
            while self.fetch_row()?.is_some() {}
        }
        Ok(())
    }

    /// Descriptive information about the connected server or file.
    fn info(&self) -> serde_json::Value {
        serde_json::json!({ "backend": self.backend() })
    }

    /// Schema selected by the connection options.
    fn default_schema(&self) -> Option<String> {
        None
    }

    /// Schema unqualified statements currently resolve against.
    fn current_schema(&self) -> Option<String> {
        self.default_schema()
    }

    /// Make `schema` the one unqualified statements resolve against.
    fn set_current_schema(&mut self, schema: &str) -> Result<()> {
        Err(Error::Custom(format!(
            "The {} backend cannot switch to schema '{}'.",
            self.backend(),
            schema
        )))
    }

    /// Handle used by `kill` to stop a statement from another thread.
    fn interrupter(&self) -> Option<Interrupter> {
        None
    }
}

impl<C: Capability + ?Sized> Capability for Box<C> {
    fn backend(&self) -> &'static str {
        (**self).backend()
    }

    fn connect(&mut self, options: &ConnectionOptions) -> Result<()> {
        (**self).connect(options)
    }

    fn disconnect(&mut self) {
        (**self).disconnect();
    }

    fn release(&mut self) {
        (**self).release();
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<()> {
        (**self).execute(sql, params)
    }

    fn columns(&self) -> Arc<ColumnInfo> {
        (**self).columns()
    }

    fn fetch_row(&mut self) -> Result<Option<Row>> {
        (**self).fetch_row()
    }

    fn next_result(&mut self) -> Result<bool> {
        (**self).next_result()
    }

    fn stats(&self) -> ResultStats {
        (**self).stats()
    }

    fn ping(&mut self) -> Result<()> {
        (**self).ping()
    }

    fn info(&self) -> serde_json::Value {
        (**self).info()
    }

    fn default_schema(&self) -> Option<String> {
        (**self).default_schema()
    }

    fn current_schema(&self) -> Option<String> {
        (**self).current_schema()
    }

    fn set_current_schema(&mut self, schema: &str) -> Result<()> {
        (**self).set_current_schema(schema)
    }

    fn interrupter(&self) -> Option<Interrupter> {
        (**self).interrupter()
    }
}
