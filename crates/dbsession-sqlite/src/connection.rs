//! SQLite connection capability.
//!
//! [`SqliteCapability`] wraps one `sqlite3` handle and exposes it through the
//! cursor-style [`Capability`] protocol. A statement text may hold several
//! `;`-separated statements; each one becomes its own result set and
//! [`Capability::next_result`] walks through them using the prepare tail.
//!
//! The configured database and its attachments are all schemas of one
//! connection. Switching the current schema reopens the connection with that
//! database as `main` and attaches the others, so unqualified names resolve
//! against it. An in-memory database does not survive such a switch.

// Allow casts in FFI code where we need to match C types exactly
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::borrow_as_ptr)] // FFI requires raw pointers

use crate::ffi;
use crate::types;
use dbsession_core::{
    Capability, Column, ColumnInfo, ConnectionOptions, Error, ErrorSource, Interrupter,
    ResultStats, Row, Value,
    error::{ConnectionError, ConnectionErrorKind, QueryError, QueryErrorKind},
};
use std::ffi::{CStr, CString, c_int};
use std::path::Path;
use std::ptr;
use std::sync::{Arc, Mutex, PoisonError};

/// Backend name used for factory registration.
pub const BACKEND_NAME: &str = "Sqlite";

const DEFAULT_BUSY_TIMEOUT_MS: u32 = 5000;

/// Flags controlling how database files are opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenFlags {
    /// Open for reading only.
    pub read_only: bool,
    /// Create the database if it doesn't exist (ignored when read-only).
    pub create: bool,
    /// Enable URI filename interpretation.
    pub uri: bool,
}

impl Default for OpenFlags {
    fn default() -> Self {
        Self {
            read_only: false,
            create: true,
            uri: false,
        }
    }
}

impl OpenFlags {
    pub fn read_only() -> Self {
        Self {
            read_only: true,
            create: false,
            uri: false,
        }
    }

    fn to_sqlite_flags(self) -> c_int {
        // The handle never leaves the session worker thread.
        let mut flags = ffi::SQLITE_OPEN_NOMUTEX;
        if self.read_only {
            flags |= ffi::SQLITE_OPEN_READONLY;
        } else {
            flags |= ffi::SQLITE_OPEN_READWRITE;
            if self.create {
                flags |= ffi::SQLITE_OPEN_CREATE;
            }
        }
        if self.uri {
            flags |= ffi::SQLITE_OPEN_URI;
        }
        flags
    }
}

/// An extra database file attached under its own schema name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub database_name: String,
    pub path: String,
}

/// Configuration for opening a SQLite database, derived from the session's
/// connection options.
///
/// | option            | meaning                                   |
/// |-------------------|-------------------------------------------|
/// | `db_file`         | database path or `:memory:` (required)    |
/// | `database_name`   | schema name; defaults to the file stem    |
/// | `attach`          | list of `{db_file, database_name}` objects |
/// | `read_only`       | open without write access                 |
/// | `busy_timeout_ms` | lock wait in milliseconds (default 5000)  |
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqliteConfig {
    pub path: String,
    pub database_name: String,
    pub attachments: Vec<Attachment>,
    pub flags: OpenFlags,
    pub busy_timeout_ms: u32,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self::memory()
    }
}

impl SqliteConfig {
    pub fn file(path: impl Into<String>) -> Self {
        let path = path.into();
        Self {
            database_name: schema_name_for(&path),
            path,
            attachments: Vec::new(),
            flags: OpenFlags::default(),
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
        }
    }

    pub fn memory() -> Self {
        Self {
            database_name: "main".to_string(),
            ..Self::file(":memory:")
        }
    }

    pub fn flags(mut self, flags: OpenFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn busy_timeout(mut self, ms: u32) -> Self {
        self.busy_timeout_ms = ms;
        self
    }

    pub fn attach(mut self, database_name: impl Into<String>, path: impl Into<String>) -> Self {
        self.attachments.push(Attachment {
            database_name: database_name.into(),
            path: path.into(),
        });
        self
    }

    /// Build a config from session connection options.
    pub fn from_options(options: &ConnectionOptions) -> Result<Self, Error> {
        let (database_name, path) = database_entry(&options.options)?;
        let mut config = Self::file(path);
        config.database_name = database_name;

        if let Some(attach) = options.get("attach") {
            let entries = attach.as_array().ok_or_else(|| {
                Error::config("attach", "The 'attach' option must be a list of databases.")
            })?;
            for entry in entries {
                let map = entry.as_object().ok_or_else(|| {
                    Error::config("attach", "Each attached database must be an object.")
                })?;
                let (database_name, path) = database_entry(map)?;
                config.attachments.push(Attachment {
                    database_name,
                    path,
                });
            }
        }

        if options.get_bool("read_only") == Some(true) {
            config.flags = OpenFlags::read_only();
        }
        if let Some(ms) = options.get_u64("busy_timeout_ms") {
            config.busy_timeout_ms = u32::try_from(ms).unwrap_or(u32::MAX);
        }
        Ok(config)
    }

    /// Every database as `(schema, path)`, the main one first.
    pub fn databases(&self) -> impl Iterator<Item = (&str, &str)> {
        std::iter::once((self.database_name.as_str(), self.path.as_str())).chain(
            self.attachments
                .iter()
                .map(|a| (a.database_name.as_str(), a.path.as_str())),
        )
    }

    pub fn has_database(&self, schema: &str) -> bool {
        self.databases().any(|(name, _)| name == schema)
    }

    /// The same set of databases with `schema` opened as the main one.
    pub fn rooted_at(&self, schema: &str) -> Option<SqliteConfig> {
        let (_, path) = self.databases().find(|(name, _)| *name == schema)?;
        let attachments = self
            .databases()
            .filter(|(name, _)| *name != schema)
            .map(|(name, path)| Attachment {
                database_name: name.to_string(),
                path: path.to_string(),
            })
            .collect();
        Some(SqliteConfig {
            path: path.to_string(),
            database_name: schema.to_string(),
            attachments,
            flags: self.flags,
            busy_timeout_ms: self.busy_timeout_ms,
        })
    }
}

fn schema_name_for(path: &str) -> String {
    Path::new(path)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn database_entry(
    map: &serde_json::Map<String, serde_json::Value>,
) -> Result<(String, String), Error> {
    let path = map.get("db_file").and_then(serde_json::Value::as_str);
    let name = match map.get("database_name").and_then(serde_json::Value::as_str) {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => path.map(schema_name_for).unwrap_or_default(),
    };
    match path {
        Some(path) if !path.is_empty() => Ok((name, path.to_string())),
        _ => Err(Error::config(
            "db_file",
            format!("The 'db_file' option was not set for the '{}' database.", name),
        )),
    }
}

/// The open handle as seen by [`Interrupter`]s on other threads.
struct InterruptTarget(*mut ffi::sqlite3);

// SAFETY: the pointer is only passed to sqlite3_interrupt, which may be called
// from any thread, and only while the mutex keeps the handle from closing.
unsafe impl Send for InterruptTarget {}

/// A SQLite-backed [`Capability`].
///
/// Not `Sync`: the handle is opened without SQLite's internal mutex and must
/// only be driven by the thread that owns the capability.
pub struct SqliteCapability {
    db: *mut ffi::sqlite3,
    /// Currently open layout, with the current schema as main
    config: Option<SqliteConfig>,
    /// Layout from the connection options
    base: Option<SqliteConfig>,
    current_schema: Option<String>,
    interrupt: Arc<Mutex<InterruptTarget>>,
    cursor: Option<Cursor>,
    stats: ResultStats,
}

// SAFETY: the handle is only used by whichever single thread owns the
// capability; ownership transfer between threads is sound for SQLite
// connections that are not used concurrently.
unsafe impl Send for SqliteCapability {}

impl Default for SqliteCapability {
    fn default() -> Self {
        Self::new()
    }
}

impl SqliteCapability {
    pub fn new() -> Self {
        Self {
            db: ptr::null_mut(),
            config: None,
            base: None,
            current_schema: None,
            interrupt: Arc::new(Mutex::new(InterruptTarget(ptr::null_mut()))),
            cursor: None,
            stats: ResultStats::default(),
        }
    }

    /// Open a database directly from a config, bypassing option parsing.
    pub fn open(config: &SqliteConfig) -> Result<Self, Error> {
        let mut cap = Self::new();
        cap.open_schema(config.clone(), &config.database_name)?;
        Ok(cap)
    }

    /// Open an in-memory database.
    pub fn open_memory() -> Result<Self, Error> {
        Self::open(&SqliteConfig::memory())
    }

    pub fn config(&self) -> Option<&SqliteConfig> {
        self.config.as_ref()
    }

    fn open_schema(&mut self, base: SqliteConfig, schema: &str) -> Result<(), Error> {
        let rooted = base.rooted_at(schema).ok_or_else(|| unknown_schema(schema))?;
        self.open_with(&rooted)?;
        self.current_schema = Some(schema.to_string());
        self.base = Some(base);
        Ok(())
    }

    fn open_with(&mut self, config: &SqliteConfig) -> Result<(), Error> {
        self.close_handle();

        let c_path = CString::new(config.path.as_str()).map_err(|_| {
            Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::Connect,
                origin: ErrorSource::Storage,
                code: None,
                message: "Invalid path: contains null byte".to_string(),
                source: None,
            })
        })?;

        let mut db: *mut ffi::sqlite3 = ptr::null_mut();
        // SAFETY: We pass valid pointers and check the return value
        let rc = unsafe {
            ffi::sqlite3_open_v2(
                c_path.as_ptr(),
                &mut db,
                config.flags.to_sqlite_flags(),
                ptr::null(),
            )
        };

        if rc != ffi::SQLITE_OK {
            let msg = if db.is_null() {
                ffi::error_string(rc).to_string()
            } else {
                let msg = last_error_message(db);
                // SAFETY: db came from sqlite3_open_v2 and is closed exactly once
                unsafe { ffi::sqlite3_close_v2(db) };
                msg
            };
            tracing::warn!(path = %config.path, code = rc, "failed to open sqlite database");
            return Err(Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::Connect,
                origin: ErrorSource::Storage,
                code: Some(i64::from(rc)),
                message: format!("Failed to open database: {}", msg),
                source: None,
            }));
        }

        if config.busy_timeout_ms > 0 {
            // SAFETY: db is valid
            unsafe {
                ffi::sqlite3_busy_timeout(db, config.busy_timeout_ms.min(i32::MAX as u32) as c_int);
            }
        }
        self.db = db;
        self.interrupt_target().0 = db;

        let mut setup = Vec::new();
        if !config.flags.read_only {
            setup.push("PRAGMA journal_mode = WAL".to_string());
        }
        for attachment in &config.attachments {
            setup.push(format!(
                "ATTACH '{}' AS '{}'",
                attachment.path.replace('\'', "''"),
                attachment.database_name.replace('\'', "''")
            ));
        }
        for sql in &setup {
            if let Err(e) = self.run_to_completion(sql) {
                self.close_handle();
                return Err(e);
            }
        }

        tracing::debug!(
            path = %config.path,
            database = %config.database_name,
            attached = config.attachments.len(),
            "sqlite database opened"
        );
        self.config = Some(config.clone());
        Ok(())
    }

    fn run_to_completion(&mut self, sql: &str) -> Result<(), Error> {
        self.execute(sql, &[])?;
        while self.fetch_row()?.is_some() {}
        while self.next_result()? {
            while self.fetch_row()?.is_some() {}
        }
        self.cursor = None;
        Ok(())
    }

    fn interrupt_target(&self) -> std::sync::MutexGuard<'_, InterruptTarget> {
        self.interrupt.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn close_handle(&mut self) {
        // Statements must be finalized before the handle goes away.
        self.cursor = None;
        // No interrupt may be in flight once the handle closes.
        self.interrupt_target().0 = ptr::null_mut();
        if !self.db.is_null() {
            // SAFETY: db is a valid handle that is closed exactly once
            let rc = unsafe { ffi::sqlite3_close_v2(self.db) };
            if rc != ffi::SQLITE_OK {
                tracing::warn!(code = rc, "sqlite3_close_v2 reported an error");
            }
            self.db = ptr::null_mut();
        }
    }

    fn cursor_mut(&mut self) -> Option<&mut Cursor> {
        self.cursor.as_mut()
    }
}

impl Drop for SqliteCapability {
    fn drop(&mut self) {
        self.close_handle();
    }
}

impl Capability for SqliteCapability {
    fn backend(&self) -> &'static str {
        BACKEND_NAME
    }

    fn connect(&mut self, options: &ConnectionOptions) -> Result<(), Error> {
        let base = SqliteConfig::from_options(options)?;
        // A reconnect keeps the schema switched to, if it still exists.
        let schema = match &self.current_schema {
            Some(schema) if base.has_database(schema) => schema.clone(),
            _ => base.database_name.clone(),
        };
        self.open_schema(base, &schema)
    }

    fn disconnect(&mut self) {
        self.close_handle();
    }

    fn is_connected(&self) -> bool {
        !self.db.is_null()
    }

    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<(), Error> {
        if self.db.is_null() {
            return Err(Error::not_connected(ErrorSource::Storage));
        }
        self.cursor = None;

        let mut cursor = Cursor::new(self.db, sql, params)?;
        let started = cursor.advance();
        self.stats = cursor.stats;
        self.cursor = Some(cursor);
        started.map(|_| ())
    }

    fn columns(&self) -> Arc<ColumnInfo> {
        self.cursor
            .as_ref()
            .map_or_else(|| Arc::new(ColumnInfo::default()), |c| Arc::clone(&c.columns))
    }

    fn fetch_row(&mut self) -> Result<Option<Row>, Error> {
        let Some(cursor) = self.cursor_mut() else {
            return Ok(None);
        };
        let row = cursor.fetch();
        self.stats = self.cursor.as_ref().map_or(self.stats, |c| c.stats);
        row
    }

    fn next_result(&mut self) -> Result<bool, Error> {
        let Some(cursor) = self.cursor_mut() else {
            return Ok(false);
        };
        let more = cursor.advance();
        self.stats = self.cursor.as_ref().map_or(self.stats, |c| c.stats);
        more
    }

    fn stats(&self) -> ResultStats {
        self.stats
    }

    fn info(&self) -> serde_json::Value {
        let mut info = serde_json::json!({
            "backend": BACKEND_NAME,
            "version": ffi::version(),
        });
        if let Some(base) = &self.base {
            let databases = base
                .databases()
                .map(|(name, path)| (name.to_string(), serde_json::Value::String(path.to_string())))
                .collect();
            info["databases"] = serde_json::Value::Object(databases);
            info["default_schema"] = base.database_name.clone().into();
        }
        info
    }

    fn default_schema(&self) -> Option<String> {
        self.base.as_ref().map(|base| base.database_name.clone())
    }

    fn current_schema(&self) -> Option<String> {
        self.current_schema.clone()
    }

    fn set_current_schema(&mut self, schema: &str) -> Result<(), Error> {
        let Some(base) = self.base.clone() else {
            return Err(Error::not_connected(ErrorSource::Storage));
        };
        if !base.has_database(schema) {
            return Err(unknown_schema(schema));
        }
        if self.current_schema.as_deref() == Some(schema) && self.is_connected() {
            return Ok(());
        }

        let previous = self
            .current_schema
            .clone()
            .unwrap_or_else(|| base.database_name.clone());
        tracing::debug!(from = %previous, to = %schema, "switching sqlite schema");
        if let Err(e) = self.open_schema(base.clone(), schema) {
            if let Err(restore) = self.open_schema(base, &previous) {
                tracing::warn!(schema = %previous, error = %restore, "failed to reopen previous schema");
            }
            return Err(e);
        }
        Ok(())
    }

    fn interrupter(&self) -> Option<Interrupter> {
        let target = Arc::clone(&self.interrupt);
        Some(Arc::new(move || {
            let target = target.lock().unwrap_or_else(PoisonError::into_inner);
            if !target.0.is_null() {
                // SAFETY: the handle stays open while the lock is held
                unsafe { ffi::sqlite3_interrupt(target.0) };
            }
        }))
    }
}

// ==================== Cursor ====================

/// Iteration state over the statements of one `execute` call.
struct Cursor {
    db: *mut ffi::sqlite3,
    text: CString,
    /// Byte offset of the next unprepared statement in `text`.
    offset: usize,
    params: Vec<Value>,
    stmt: *mut ffi::sqlite3_stmt,
    stmt_sql: String,
    columns: Arc<ColumnInfo>,
    /// First row, stepped eagerly so that column types can be inferred.
    peeked: Option<Row>,
    exhausted: bool,
    stats: ResultStats,
    /// `sqlite3_total_changes` and last rowid before the current statement
    changes_before: c_int,
    rowid_before: i64,
}

impl Cursor {
    fn new(db: *mut ffi::sqlite3, sql: &str, params: &[Value]) -> Result<Self, Error> {
        let text = CString::new(sql).map_err(|_| {
            Error::Query(QueryError {
                kind: QueryErrorKind::Syntax,
                origin: ErrorSource::Storage,
                code: None,
                sql: Some(sql.to_string()),
                sqlstate: None,
                message: "SQL contains null byte".to_string(),
                source: None,
            })
        })?;
        Ok(Self {
            db,
            text,
            offset: 0,
            params: params.to_vec(),
            stmt: ptr::null_mut(),
            stmt_sql: String::new(),
            columns: Arc::new(ColumnInfo::default()),
            peeked: None,
            exhausted: true,
            stats: ResultStats::default(),
            changes_before: 0,
            rowid_before: 0,
        })
    }

    /// Finalize the current statement, then prepare and start the next one.
    fn advance(&mut self) -> Result<bool, Error> {
        self.finalize();
        if !self.prepare_next()? {
            return Ok(false);
        }
        self.start()?;
        Ok(true)
    }

    fn prepare_next(&mut self) -> Result<bool, Error> {
        let total = self.text.as_bytes().len();
        loop {
            if self.offset >= total {
                return Ok(false);
            }
            let base = self.text.as_ptr();
            let mut stmt: *mut ffi::sqlite3_stmt = ptr::null_mut();
            let mut tail: *const std::ffi::c_char = ptr::null();

            // SAFETY: offset < total, so the pointer stays inside the buffer
            let rc = unsafe {
                ffi::sqlite3_prepare_v2(
                    self.db,
                    base.add(self.offset),
                    (total - self.offset) as c_int,
                    &mut stmt,
                    &mut tail,
                )
            };

            let consumed = if tail.is_null() {
                total
            } else {
                // SAFETY: tail points into the same buffer as base
                unsafe { tail.offset_from(base) as usize }
            };
            let sql = String::from_utf8_lossy(&self.text.as_bytes()[self.offset..consumed])
                .trim()
                .to_string();

            if rc != ffi::SQLITE_OK {
                // Remaining statements are abandoned after a prepare failure.
                self.offset = total;
                return Err(query_error(self.db, rc, &sql));
            }
            self.offset = consumed.max(self.offset + 1).min(total);

            // Whitespace or a lone comment compiles to no statement.
            if stmt.is_null() {
                continue;
            }
            self.stmt = stmt;
            self.stmt_sql = sql;
            return Ok(true);
        }
    }

    fn start(&mut self) -> Result<(), Error> {
        // SAFETY: stmt was just prepared
        let needed = unsafe { ffi::sqlite3_bind_parameter_count(self.stmt) } as usize;
        if needed > self.params.len() {
            return Err(Error::Query(QueryError {
                kind: QueryErrorKind::Bind,
                origin: ErrorSource::Storage,
                code: Some(i64::from(ffi::SQLITE_RANGE)),
                sql: Some(self.stmt_sql.clone()),
                sqlstate: None,
                message: format!(
                    "Incorrect number of bindings supplied. The current statement uses {}, and there are {} supplied.",
                    needed,
                    self.params.len()
                ),
                source: None,
            }));
        }
        for (i, value) in self.params.iter().take(needed).enumerate() {
            // SAFETY: stmt is valid and i + 1 is within the parameter count
            let rc = unsafe { types::bind_value(self.stmt, (i + 1) as c_int, value) };
            if rc != ffi::SQLITE_OK {
                let mut err = query_error(self.db, rc, &self.stmt_sql);
                if let Error::Query(q) = &mut err {
                    q.kind = QueryErrorKind::Bind;
                    q.message = format!("Failed to bind parameter {}: {}", i + 1, q.message);
                }
                return Err(err);
            }
        }

        // SAFETY: stmt is valid
        let count = unsafe { ffi::sqlite3_column_count(self.stmt) };
        let mut columns: Vec<Column> = (0..count)
            .map(|i| {
                // SAFETY: i is a valid column index
                let (name, decl) = unsafe {
                    (
                        types::column_name(self.stmt, i),
                        types::column_decltype(self.stmt, i),
                    )
                };
                Column::new(name, decl.unwrap_or_default())
            })
            .collect();

        // SAFETY: db is valid
        unsafe {
            self.changes_before = ffi::sqlite3_total_changes(self.db);
            self.rowid_before = ffi::sqlite3_last_insert_rowid(self.db);
        }
        self.stats = ResultStats::default();
        self.exhausted = false;
        let first = self.step_values()?;
        if let Some(values) = &first {
            for (column, value) in columns.iter_mut().zip(values) {
                if column.type_name.is_empty() {
                    column.type_name = types::storage_class_name(value).to_string();
                }
            }
        }
        self.columns = Arc::new(ColumnInfo::new(columns));
        self.peeked = first.map(|values| Row::new(Arc::clone(&self.columns), values));
        Ok(())
    }

    fn fetch(&mut self) -> Result<Option<Row>, Error> {
        if let Some(row) = self.peeked.take() {
            return Ok(Some(row));
        }
        Ok(self
            .step_values()?
            .map(|values| Row::new(Arc::clone(&self.columns), values)))
    }

    fn step_values(&mut self) -> Result<Option<Vec<Value>>, Error> {
        if self.exhausted || self.stmt.is_null() {
            return Ok(None);
        }
        // SAFETY: stmt is valid
        let rc = unsafe { ffi::sqlite3_step(self.stmt) };
        match rc {
            ffi::SQLITE_ROW => {
                // SAFETY: the statement just returned SQLITE_ROW
                let count = unsafe { ffi::sqlite3_column_count(self.stmt) };
                let values = (0..count)
                    .map(|i| unsafe { types::read_column(self.stmt, i) })
                    .collect();
                Ok(Some(values))
            }
            ffi::SQLITE_DONE => {
                self.exhausted = true;
                self.record_stats();
                Ok(None)
            }
            _ => {
                self.exhausted = true;
                Err(query_error(self.db, rc, &self.stmt_sql))
            }
        }
    }

    /// `sqlite3_changes` keeps the count of the last INSERT, UPDATE or DELETE
    /// across other statements, so it only counts when the total moved.
    fn record_stats(&mut self) {
        // SAFETY: db and stmt are valid while the cursor lives
        let (returns_rows, total, changes, rowid) = unsafe {
            (
                ffi::sqlite3_column_count(self.stmt) > 0,
                ffi::sqlite3_total_changes(self.db),
                ffi::sqlite3_changes(self.db),
                ffi::sqlite3_last_insert_rowid(self.db),
            )
        };
        let modified = total != self.changes_before;
        let inserted = modified && (rowid != self.rowid_before || is_insert(&self.stmt_sql));
        self.stats = ResultStats {
            rows_affected: if modified && !returns_rows {
                u64::try_from(changes).unwrap_or(0)
            } else {
                0
            },
            last_insert_id: (inserted && rowid != 0).then_some(rowid),
        };
    }

    fn finalize(&mut self) {
        if !self.stmt.is_null() {
            // SAFETY: stmt is valid and finalized exactly once
            unsafe { ffi::sqlite3_finalize(self.stmt) };
            self.stmt = ptr::null_mut();
        }
        self.peeked = None;
        self.exhausted = true;
        self.columns = Arc::new(ColumnInfo::default());
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        self.finalize();
    }
}

// Helper functions

fn is_insert(sql: &str) -> bool {
    let keyword = sql.split_whitespace().next().unwrap_or_default();
    keyword.eq_ignore_ascii_case("INSERT") || keyword.eq_ignore_ascii_case("REPLACE")
}

fn unknown_schema(schema: &str) -> Error {
    Error::Query(QueryError {
        kind: QueryErrorKind::NotFound,
        origin: ErrorSource::Storage,
        code: None,
        sql: None,
        sqlstate: None,
        message: format!("Unknown schema '{}'.", schema),
        source: None,
    })
}

fn last_error_message(db: *mut ffi::sqlite3) -> String {
    // SAFETY: db is valid, errmsg returns a valid C string
    unsafe {
        let ptr = ffi::sqlite3_errmsg(db);
        CStr::from_ptr(ptr).to_string_lossy().into_owned()
    }
}

fn query_error(db: *mut ffi::sqlite3, rc: c_int, sql: &str) -> Error {
    // SAFETY: db is valid
    let code = unsafe { ffi::sqlite3_errcode(db) };
    let code = if code == ffi::SQLITE_OK { rc } else { code };
    let message = last_error_message(db);
    tracing::debug!(code, sql, error = %message, "sqlite statement failed");

    Error::Query(QueryError {
        kind: error_code_to_kind(code),
        origin: ErrorSource::Storage,
        code: Some(i64::from(code)),
        sql: Some(sql.to_string()),
        sqlstate: None,
        message,
        source: None,
    })
}

fn error_code_to_kind(code: c_int) -> QueryErrorKind {
    match code & 0xff {
        ffi::SQLITE_ERROR => QueryErrorKind::Syntax,
        ffi::SQLITE_CONSTRAINT => QueryErrorKind::Constraint,
        ffi::SQLITE_BUSY | ffi::SQLITE_LOCKED => QueryErrorKind::Deadlock,
        ffi::SQLITE_PERM | ffi::SQLITE_AUTH | ffi::SQLITE_READONLY => QueryErrorKind::Permission,
        ffi::SQLITE_NOTFOUND | ffi::SQLITE_CANTOPEN => QueryErrorKind::NotFound,
        ffi::SQLITE_TOOBIG => QueryErrorKind::DataTruncation,
        ffi::SQLITE_INTERRUPT => QueryErrorKind::Interrupted,
        ffi::SQLITE_RANGE | ffi::SQLITE_MISUSE => QueryErrorKind::Bind,
        ffi::SQLITE_IOERR | ffi::SQLITE_NOTADB => QueryErrorKind::Database,
        _ => QueryErrorKind::Database,
    }
}
