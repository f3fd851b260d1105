//! Units of work executed by a session worker.
//!
//! Every [`Task`] reports its progress as a sequence of [`TaskEvent`]s:
//! one `PENDING` start event, any number of `PENDING` data events, and then
//! exactly one terminal event (`OK`, `ERROR` or `CANCELLED`). Events are
//! delivered to the task's [`ResultSink`]; failures are additionally routed
//! into an optional [`TaskTracker`].

use crate::connector::Connector;
use dbsession_core::{Capability, Column, Error, ErrorSource, Row, Value};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::time::{Duration, Instant};

pub const STARTED_MESSAGE: &str = "Execution started...";

// ==================== States and payloads ====================

/// Life-cycle state carried by a dispatched event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskState {
    Pending,
    Ok,
    Error,
    Cancelled,
}

impl TaskState {
    pub const fn as_str(self) -> &'static str {
        match self {
            TaskState::Pending => "PENDING",
            TaskState::Ok => "OK",
            TaskState::Error => "ERROR",
            TaskState::Cancelled => "CANCELLED",
        }
    }

    pub const fn is_terminal(self) -> bool {
        !matches!(self, TaskState::Pending)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Serializable description of an error, as stored in session statistics
/// and attached to `ERROR` events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorPayload {
    pub msg: String,
    pub source: ErrorSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sqlstate: Option<String>,
}

impl From<&Error> for ErrorPayload {
    fn from(err: &Error) -> Self {
        Self {
            msg: err.message(),
            source: err.origin(),
            code: err.code(),
            sqlstate: err.sqlstate().map(str::to_string),
        }
    }
}

impl fmt::Display for ErrorPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.msg)
    }
}

/// One streamed piece of a result set.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultChunk {
    /// Present only on the first chunk of each result set
    #[serde(skip_serializing_if = "Option::is_none")]
    pub columns: Option<Vec<Column>>,
    pub rows: Vec<serde_json::Value>,
    /// Rows of this result set transferred so far, including this chunk
    pub total_row_count: usize,
    /// Seconds since the statement started
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_time: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_insert_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows_affected: Option<u64>,
    pub done: bool,
}

/// Data attached to an event.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskData {
    Rows(ResultChunk),
    /// A single computed value, published under `result`
    Result(serde_json::Value),
}

/// A single dispatch from a task to its sink.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskEvent {
    pub request_id: Option<String>,
    pub state: TaskState,
    pub message: Option<String>,
    pub error: Option<ErrorPayload>,
    pub data: Option<TaskData>,
}

impl TaskEvent {
    pub fn rows(&self) -> Option<&ResultChunk> {
        match &self.data {
            Some(TaskData::Rows(chunk)) => Some(chunk),
            _ => None,
        }
    }

    /// Render the event as the JSON document handed to front ends.
    ///
    /// ```text
    /// {"request_id": "r1",
    ///  "request_state": {"type": "ERROR", "msg": "...", "source": "STORAGE", "code": 1},
    ///  ...data fields}
    /// ```
    pub fn to_json(&self) -> serde_json::Value {
        let mut state = serde_json::Map::new();
        state.insert("type".into(), self.state.as_str().into());
        let msg = self
            .error
            .as_ref()
            .map(|e| e.msg.clone())
            .or_else(|| self.message.clone())
            .unwrap_or_default();
        state.insert("msg".into(), msg.into());
        if let Some(error) = &self.error {
            state.insert("source".into(), error.source.as_str().into());
            if let Some(code) = error.code {
                state.insert("code".into(), code.into());
            }
            if let Some(sqlstate) = &error.sqlstate {
                state.insert("sqlstate".into(), sqlstate.clone().into());
            }
        }

        let mut doc = serde_json::Map::new();
        doc.insert(
            "request_id".into(),
            self.request_id
                .clone()
                .map_or(serde_json::Value::Null, serde_json::Value::String),
        );
        doc.insert("request_state".into(), serde_json::Value::Object(state));
        match &self.data {
            Some(TaskData::Rows(chunk)) => {
                if let Ok(serde_json::Value::Object(fields)) = serde_json::to_value(chunk) {
                    doc.extend(fields);
                }
            }
            Some(TaskData::Result(value)) => {
                doc.insert("result".into(), value.clone());
            }
            None => {}
        }
        serde_json::Value::Object(doc)
    }
}

// ==================== Sinks and trackers ====================

/// Where a task delivers its events.
pub enum ResultSink {
    Channel(mpsc::Sender<TaskEvent>),
    Callback(Box<dyn FnMut(TaskEvent) + Send>),
    Discard,
}

impl ResultSink {
    pub fn callback<F>(f: F) -> Self
    where
        F: FnMut(TaskEvent) + Send + 'static,
    {
        ResultSink::Callback(Box::new(f))
    }

    fn deliver(&mut self, event: TaskEvent) {
        match self {
            ResultSink::Channel(tx) => {
                if tx.send(event).is_err() {
                    tracing::trace!("result receiver dropped; event discarded");
                }
            }
            ResultSink::Callback(f) => f(event),
            ResultSink::Discard => {}
        }
    }
}

impl Default for ResultSink {
    fn default() -> Self {
        ResultSink::Discard
    }
}

impl fmt::Debug for ResultSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResultSink::Channel(_) => f.write_str("ResultSink::Channel"),
            ResultSink::Callback(_) => f.write_str("ResultSink::Callback"),
            ResultSink::Discard => f.write_str("ResultSink::Discard"),
        }
    }
}

impl From<mpsc::Sender<TaskEvent>> for ResultSink {
    fn from(tx: mpsc::Sender<TaskEvent>) -> Self {
        ResultSink::Channel(tx)
    }
}

/// A task that ended in `ERROR` or `CANCELLED`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    pub request_id: Option<String>,
    pub state: TaskState,
    pub error: Option<ErrorPayload>,
}

/// Completion-tracking handle collecting failed and cancelled tasks.
#[derive(Debug, Clone, Default)]
pub struct TaskTracker {
    failures: Arc<Mutex<Vec<TaskFailure>>>,
}

impl TaskTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, failure: TaskFailure) {
        self.failures.lock().push(failure);
    }

    pub fn failures(&self) -> Vec<TaskFailure> {
        self.failures.lock().clone()
    }

    pub fn take(&self) -> Vec<TaskFailure> {
        std::mem::take(&mut *self.failures.lock())
    }
}

/// Pushes events for one task, enforcing a single terminal state.
#[derive(Debug)]
pub struct Dispatcher {
    request_id: Option<String>,
    sink: ResultSink,
    tracker: Option<TaskTracker>,
    recorded: Option<Vec<TaskEvent>>,
    terminal: Option<TaskState>,
}

impl Dispatcher {
    pub fn new(request_id: Option<String>, sink: ResultSink, tracker: Option<TaskTracker>) -> Self {
        Self {
            request_id,
            sink,
            tracker,
            recorded: None,
            terminal: None,
        }
    }

    /// Keep a copy of every dispatched event.
    pub fn record_events(&mut self) {
        self.recorded.get_or_insert_with(Vec::new);
    }

    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }

    pub fn terminal_state(&self) -> Option<TaskState> {
        self.terminal
    }

    pub fn take_events(&mut self) -> Vec<TaskEvent> {
        self.recorded.take().unwrap_or_default()
    }

    pub fn dispatch(
        &mut self,
        state: TaskState,
        message: Option<String>,
        data: Option<TaskData>,
        error: Option<ErrorPayload>,
    ) {
        if let Some(previous) = self.terminal {
            tracing::warn!(
                request_id = ?self.request_id,
                %previous,
                %state,
                "dispatch after terminal state ignored"
            );
            return;
        }
        if state.is_terminal() {
            self.terminal = Some(state);
        }

        if matches!(state, TaskState::Error | TaskState::Cancelled) {
            if let Some(tracker) = &self.tracker {
                tracker.record(TaskFailure {
                    request_id: self.request_id.clone(),
                    state,
                    error: error.clone(),
                });
            }
        }

        let event = TaskEvent {
            request_id: self.request_id.clone(),
            state,
            message,
            error,
            data,
        };
        if let Some(recorded) = &mut self.recorded {
            recorded.push(event.clone());
        }
        self.sink.deliver(event);
    }
}

// ==================== Task contract ====================

/// Outcome counters of a finished task, copied onto the session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskStats {
    pub last_error: Option<ErrorPayload>,
    pub execution_time: Option<Duration>,
    pub last_insert_id: Option<i64>,
    pub rows_affected: u64,
    pub cancelled: bool,
}

/// Everything a task may touch while the worker runs it.
pub struct TaskContext<'a> {
    session_id: &'a str,
    connector: &'a mut Connector,
    killed: &'a AtomicBool,
    statement_retries: u32,
}

impl<'a> TaskContext<'a> {
    pub(crate) fn new(
        session_id: &'a str,
        connector: &'a mut Connector,
        killed: &'a AtomicBool,
        statement_retries: u32,
    ) -> Self {
        Self {
            session_id,
            connector,
            killed,
            statement_retries,
        }
    }

    pub fn session_id(&self) -> &str {
        self.session_id
    }

    pub fn capability(&mut self) -> &mut dyn Capability {
        self.connector.capability()
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    pub fn auto_reconnect(&self) -> bool {
        self.connector.auto_reconnect()
    }

    pub fn statement_retries(&self) -> u32 {
        self.statement_retries
    }

    /// Attempt an automatic reconnect. Returns `false` when auto-reconnect is
    /// disabled or every attempt failed.
    pub fn reconnect(&mut self) -> bool {
        if !self.connector.auto_reconnect() {
            return false;
        }
        self.connector.reconnect_automatic().is_ok()
    }
}

/// A unit of work run by a session worker.
///
/// The worker calls exactly one of [`execute`](Task::execute) or
/// [`cancel`](Task::cancel), exactly once. If that call panics, the worker
/// follows up with [`fail`](Task::fail).
pub trait Task: Send {
    fn request_id(&self) -> Option<&str>;

    fn execute(&mut self, ctx: &mut TaskContext<'_>);

    /// Dispatch `CANCELLED` without running.
    fn cancel(&mut self);

    /// Dispatch `ERROR` for `error` unless a terminal state went out already.
    fn fail(&mut self, error: &Error);

    fn stats(&self) -> TaskStats;
}

/// Tasks that can hand back their events after running in the caller.
pub(crate) trait RecordedTask: Task + Sized + 'static {
    fn recording(self) -> Self;

    fn outcome(self) -> TaskOutcome;
}

/// Result of a task run synchronously in the caller (non-threaded sessions).
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub state: TaskState,
    pub events: Vec<TaskEvent>,
    pub stats: TaskStats,
}

// ==================== Query task ====================

/// How a query task publishes the rows it reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResultShape {
    /// Stream every row in chunks of `row_packet_size`
    #[default]
    Rows,
    /// Publish the first column of the first row as `result`
    OneField,
    /// Publish the first column of every row as a list in `result`
    OneFieldList,
}

/// Parameters of a query submission.
///
/// ```
/// use dbsession::{QueryRequest, ResultSink};
///
/// let (tx, _rx) = std::sync::mpsc::channel();
/// let request = QueryRequest::new("SELECT * FROM actor")
///     .request_id("r-17")
///     .row_packet_size(1000)
///     .sink(ResultSink::Channel(tx));
/// assert_eq!(request.statements().len(), 1);
/// ```
#[derive(Debug, Default)]
pub struct QueryRequest {
    statements: Vec<String>,
    params: Vec<Value>,
    sink: ResultSink,
    request_id: Option<String>,
    tracker: Option<TaskTracker>,
    row_packet_size: i64,
    shape: ResultShape,
}

impl QueryRequest {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            statements: vec![sql.into()],
            ..Self::default()
        }
    }

    /// A request running several statements in order.
    pub fn batch<I, S>(statements: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            statements: statements.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn params(mut self, params: Vec<Value>) -> Self {
        self.params = params;
        self
    }

    pub fn sink(mut self, sink: ResultSink) -> Self {
        self.sink = sink;
        self
    }

    pub fn request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }

    pub fn tracker(mut self, tracker: TaskTracker) -> Self {
        self.tracker = Some(tracker);
        self
    }

    /// Maximum rows per streamed chunk; zero or negative disables chunking.
    pub fn row_packet_size(mut self, size: i64) -> Self {
        self.row_packet_size = size;
        self
    }

    pub fn shape(mut self, shape: ResultShape) -> Self {
        self.shape = shape;
        self
    }

    pub fn statements(&self) -> &[String] {
        &self.statements
    }

    pub fn get_request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }
}

/// Runs a list of statements, streaming their result sets.
#[derive(Debug)]
pub struct QueryTask {
    statements: Vec<String>,
    params: Vec<Value>,
    row_packet_size: usize,
    shape: ResultShape,
    dispatcher: Dispatcher,
    stats: TaskStats,
    /// Rows of the current statement already reached the sink
    streamed: bool,
}

impl QueryTask {
    pub fn new(request: QueryRequest) -> Self {
        Self {
            statements: request.statements,
            params: request.params,
            row_packet_size: usize::try_from(request.row_packet_size).unwrap_or(0),
            shape: request.shape,
            dispatcher: Dispatcher::new(request.request_id, request.sink, request.tracker),
            stats: TaskStats::default(),
            streamed: false,
        }
    }

    /// Keep a copy of dispatched events for [`into_outcome`](Self::into_outcome).
    pub fn record_events(mut self) -> Self {
        self.dispatcher.record_events();
        self
    }

    pub fn into_outcome(mut self) -> TaskOutcome {
        TaskOutcome {
            state: self.dispatcher.terminal_state().unwrap_or(TaskState::Pending),
            events: self.dispatcher.take_events(),
            stats: self.stats,
        }
    }

    fn run(&mut self, ctx: &mut TaskContext<'_>) -> Result<(), Error> {
        let count = self.statements.len();
        if count == 0 {
            self.finish(ResultChunk {
                columns: None,
                rows: Vec::new(),
                total_row_count: 0,
                execution_time: Some(0.0),
                last_insert_id: None,
                rows_affected: None,
                done: true,
            }, None);
            return Ok(());
        }

        for index in 0..count {
            let sql = self.statements[index].clone();
            let last = index + 1 == count;
            let mut retries = 0;
            self.streamed = false;
            loop {
                match self.run_statement(ctx, &sql, last) {
                    Ok(()) => break,
                    // Whatever the backend reports for an interrupted statement.
                    Err(e) if ctx.is_killed() && !e.is_killed() => {
                        tracing::debug!(error = %e, "statement interrupted by kill");
                        return Err(Error::killed(Some(&sql)));
                    }
                    // Re-running after rows went out would deliver them twice.
                    Err(e)
                        if e.is_connection_lost()
                            && !self.streamed
                            && retries < ctx.statement_retries() =>
                    {
                        retries += 1;
                        tracing::info!(
                            session_id = ctx.session_id(),
                            request_id = ?self.dispatcher.request_id(),
                            attempt = retries,
                            error = %e,
                            "connection lost while executing statement"
                        );
                        if !ctx.reconnect() {
                            return Err(e);
                        }
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }

    fn run_statement(
        &mut self,
        ctx: &mut TaskContext<'_>,
        sql: &str,
        last_statement: bool,
    ) -> Result<(), Error> {
        tracing::trace!(session_id = ctx.session_id(), sql, "executing statement");
        let started = Instant::now();
        ctx.capability().execute(sql, &self.params)?;

        loop {
            let columns = ctx.capability().columns();
            let mut first_chunk = true;
            let mut buffer: Vec<Row> = Vec::new();
            let mut field_values: Vec<serde_json::Value> = Vec::new();
            let mut total = 0_usize;

            loop {
                if ctx.is_killed() {
                    return Err(Error::killed(Some(sql)));
                }
                let Some(row) = ctx.capability().fetch_row()? else {
                    break;
                };
                total += 1;
                match self.shape {
                    ResultShape::Rows => {
                        if self.row_packet_size > 0 && buffer.len() >= self.row_packet_size {
                            let rows = buffer.drain(..).map(|r| r.to_json()).collect();
                            let chunk = ResultChunk {
                                columns: first_chunk.then(|| columns.columns().to_vec()),
                                rows,
                                total_row_count: total - 1,
                                execution_time: None,
                                last_insert_id: None,
                                rows_affected: None,
                                done: false,
                            };
                            first_chunk = false;
                            self.streamed = true;
                            self.dispatcher.dispatch(
                                TaskState::Pending,
                                None,
                                Some(TaskData::Rows(chunk)),
                                None,
                            );
                        }
                        buffer.push(row);
                    }
                    ResultShape::OneField => {
                        if field_values.is_empty() {
                            field_values.push(first_field(&row));
                        }
                    }
                    ResultShape::OneFieldList => field_values.push(first_field(&row)),
                }
            }

            let stats = ctx.capability().stats();
            self.stats.rows_affected = stats.rows_affected;
            self.stats.last_insert_id = stats.last_insert_id;

            let more = ctx.capability().next_result()?;
            let final_set = last_statement && !more;
            let chunk = ResultChunk {
                columns: first_chunk.then(|| columns.columns().to_vec()),
                rows: buffer.iter().map(Row::to_json).collect(),
                total_row_count: total,
                execution_time: Some(started.elapsed().as_secs_f64()),
                last_insert_id: stats.last_insert_id,
                rows_affected: Some(stats.rows_affected),
                done: final_set,
            };

            let shaped = match self.shape {
                ResultShape::Rows => None,
                ResultShape::OneField => {
                    Some(field_values.pop().unwrap_or(serde_json::Value::Null))
                }
                ResultShape::OneFieldList => Some(serde_json::Value::Array(field_values)),
            };

            if final_set {
                self.finish(chunk, shaped);
            } else if self.shape == ResultShape::Rows {
                self.streamed = true;
                self.dispatcher
                    .dispatch(TaskState::Pending, None, Some(TaskData::Rows(chunk)), None);
            }

            if !more {
                return Ok(());
            }
        }
    }

    fn finish(&mut self, chunk: ResultChunk, shaped: Option<serde_json::Value>) {
        let message = rows_transferred_message(chunk.total_row_count);
        let data = match shaped {
            Some(value) => TaskData::Result(value),
            None => TaskData::Rows(chunk),
        };
        self.dispatcher
            .dispatch(TaskState::Ok, Some(message), Some(data), None);
    }
}

impl Task for QueryTask {
    fn request_id(&self) -> Option<&str> {
        self.dispatcher.request_id()
    }

    fn execute(&mut self, ctx: &mut TaskContext<'_>) {
        let started = Instant::now();
        self.dispatcher.dispatch(
            TaskState::Pending,
            Some(STARTED_MESSAGE.to_string()),
            None,
            None,
        );

        let result = self.run(ctx);
        self.stats.execution_time = Some(started.elapsed());

        if let Err(e) = result {
            tracing::debug!(
                session_id = ctx.session_id(),
                request_id = ?self.dispatcher.request_id(),
                error = %e,
                "query task failed"
            );
            self.fail(&e);
        }
    }

    fn cancel(&mut self) {
        self.stats.cancelled = true;
        self.dispatcher
            .dispatch(TaskState::Cancelled, None, None, None);
    }

    fn fail(&mut self, error: &Error) {
        fail_with(&mut self.dispatcher, &mut self.stats, error);
    }

    fn stats(&self) -> TaskStats {
        self.stats.clone()
    }
}

impl RecordedTask for QueryTask {
    fn recording(self) -> Self {
        self.record_events()
    }

    fn outcome(self) -> TaskOutcome {
        self.into_outcome()
    }
}

fn fail_with(dispatcher: &mut Dispatcher, stats: &mut TaskStats, error: &Error) {
    if dispatcher.terminal_state().is_some() {
        return;
    }
    let payload = ErrorPayload::from(error);
    stats.last_error = Some(payload.clone());
    dispatcher.dispatch(TaskState::Error, Some(payload.msg.clone()), None, Some(payload));
}

// ==================== Schema task ====================

/// What a [`SchemaTask`] does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaAction {
    Current,
    SetCurrent(String),
}

/// Reports or switches the schema unqualified statements resolve against.
///
/// Ends in `OK` with the current schema name (after a switch, the new one)
/// published as `result`, or `null` when the backend has no notion of it.
#[derive(Debug)]
pub struct SchemaTask {
    action: SchemaAction,
    dispatcher: Dispatcher,
    stats: TaskStats,
}

impl SchemaTask {
    pub fn new(action: SchemaAction, request_id: Option<String>, sink: ResultSink) -> Self {
        Self {
            action,
            dispatcher: Dispatcher::new(request_id, sink, None),
            stats: TaskStats::default(),
        }
    }

    pub fn tracker(mut self, tracker: TaskTracker) -> Self {
        self.dispatcher.tracker = Some(tracker);
        self
    }

    pub fn action(&self) -> &SchemaAction {
        &self.action
    }

    fn run(&self, capability: &mut dyn Capability) -> Result<Option<String>, Error> {
        if let SchemaAction::SetCurrent(schema) = &self.action {
            capability.set_current_schema(schema)?;
        }
        Ok(capability.current_schema())
    }
}

impl Task for SchemaTask {
    fn request_id(&self) -> Option<&str> {
        self.dispatcher.request_id()
    }

    fn execute(&mut self, ctx: &mut TaskContext<'_>) {
        let started = Instant::now();
        self.dispatcher.dispatch(
            TaskState::Pending,
            Some(STARTED_MESSAGE.to_string()),
            None,
            None,
        );

        let result = self.run(ctx.capability());
        self.stats.execution_time = Some(started.elapsed());
        match result {
            Ok(schema) => {
                tracing::debug!(session_id = ctx.session_id(), schema = ?schema, "current schema");
                let value = schema.map_or(serde_json::Value::Null, serde_json::Value::String);
                self.dispatcher
                    .dispatch(TaskState::Ok, None, Some(TaskData::Result(value)), None);
            }
            Err(e) => self.fail(&e),
        }
    }

    fn cancel(&mut self) {
        self.stats.cancelled = true;
        self.dispatcher
            .dispatch(TaskState::Cancelled, None, None, None);
    }

    fn fail(&mut self, error: &Error) {
        fail_with(&mut self.dispatcher, &mut self.stats, error);
    }

    fn stats(&self) -> TaskStats {
        self.stats.clone()
    }
}

impl RecordedTask for SchemaTask {
    fn recording(mut self) -> Self {
        self.dispatcher.record_events();
        self
    }

    fn outcome(mut self) -> TaskOutcome {
        TaskOutcome {
            state: self.dispatcher.terminal_state().unwrap_or(TaskState::Pending),
            events: self.dispatcher.take_events(),
            stats: self.stats,
        }
    }
}

fn first_field(row: &Row) -> serde_json::Value {
    row.get(0).map_or(serde_json::Value::Null, Value::to_json)
}

/// Final status line of a row-producing task.
pub fn rows_transferred_message(count: usize) -> String {
    if count == 1 {
        "Full result set consisting of 1 row transferred.".to_string()
    } else {
        format!("Full result set consisting of {} rows transferred.", count)
    }
}
