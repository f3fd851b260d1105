//! Scripted in-memory capability shared by the integration tests.
//!
//! Statements understood by [`Stub::execute`]:
//!
//! - `ROWS n[,m...]` one result set per count, rows `[0]..[n-1]` in column `n`
//! - `GATE` blocks until [`Gate::open`] was called, or fails once the stub's
//!   interrupter fired
//! - `SLEEP ms` sleeps, then behaves like a write
//! - `FAIL` raises a syntax error
//! - anything else is a write affecting one row

#![allow(dead_code)]

use dbsession::{
    Capability, Column, ColumnInfo, ConnectionOptions, Error, ErrorSource, Interrupter, Row,
    Value,
};
use dbsession_core::{
    ConnectionError, ConnectionErrorKind, QueryError, QueryErrorKind, ResultStats,
};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::mpsc::Receiver;
use std::time::{Duration, Instant};

use dbsession::{TaskEvent, TaskState};

/// Counters and failure knobs shared between a test and its stub.
#[derive(Debug, Default)]
pub struct Script {
    pub connects: u32,
    pub disconnects: u32,
    pub releases: u32,
    pub pings: u32,
    pub executed: Vec<String>,
    /// Upcoming connect attempts that fail
    pub fail_connects: u32,
    /// Upcoming executes that fail with a lost connection
    pub drop_connection: u32,
    /// Row fetches that still succeed before the connection drops mid-result
    pub fail_fetch_after: Option<u32>,
    /// Calls of the stub's interrupter
    pub interrupts: u32,
    /// Schemas `set_current_schema` accepts besides `main`
    pub schemas: Vec<String>,
    /// Options passed to the latest connect
    pub last_host: Option<String>,
}

#[derive(Debug, Default)]
struct GateState {
    open: bool,
    interrupted: bool,
}

#[derive(Debug, Default)]
pub struct Gate {
    state: Mutex<GateState>,
    cond: Condvar,
}

impl Gate {
    pub fn open(&self) {
        self.state.lock().open = true;
        self.cond.notify_all();
    }

    /// Fail the `GATE` statement that is waiting, or the next one.
    pub fn interrupt(&self) {
        self.state.lock().interrupted = true;
        self.cond.notify_all();
    }

    /// Returns `false` when interrupted.
    fn pass(&self) -> bool {
        let mut state = self.state.lock();
        while !state.open && !state.interrupted {
            self.cond.wait(&mut state);
        }
        !std::mem::take(&mut state.interrupted)
    }
}

pub struct Stub {
    script: Arc<Mutex<Script>>,
    gate: Arc<Gate>,
    connected: bool,
    columns: Arc<ColumnInfo>,
    current: VecDeque<Row>,
    pending: VecDeque<usize>,
    rows_affected: u64,
    schema: String,
}

impl Stub {
    pub fn new() -> (Self, Arc<Mutex<Script>>, Arc<Gate>) {
        let script = Arc::new(Mutex::new(Script::default()));
        let gate = Arc::new(Gate::default());
        let stub = Self {
            script: Arc::clone(&script),
            gate: Arc::clone(&gate),
            connected: false,
            columns: Arc::new(ColumnInfo::default()),
            current: VecDeque::new(),
            pending: VecDeque::new(),
            rows_affected: 0,
            schema: "main".to_string(),
        };
        (stub, script, gate)
    }

    fn load(&mut self, count: usize) {
        self.columns = Arc::new(ColumnInfo::new(vec![Column::new("n", "INTEGER")]));
        let columns = Arc::clone(&self.columns);
        self.current = (0..count)
            .map(|i| Row::new(Arc::clone(&columns), vec![Value::Int(i as i64)]))
            .collect();
        self.rows_affected = 0;
    }

    fn lost() -> Error {
        Error::Connection(ConnectionError {
            kind: ConnectionErrorKind::Disconnected,
            origin: ErrorSource::Driver,
            code: Some(2013),
            message: "Lost connection to server during query".into(),
            source: None,
        })
    }
}

impl Capability for Stub {
    fn backend(&self) -> &'static str {
        "Stub"
    }

    fn connect(&mut self, options: &ConnectionOptions) -> Result<(), Error> {
        let mut script = self.script.lock();
        script.connects += 1;
        script.last_host = options.get_str("host").map(str::to_string);
        if script.fail_connects > 0 {
            script.fail_connects -= 1;
            return Err(Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::Refused,
                origin: ErrorSource::Driver,
                code: None,
                message: "Connection refused".into(),
                source: None,
            }));
        }
        self.connected = true;
        Ok(())
    }

    fn disconnect(&mut self) {
        self.script.lock().disconnects += 1;
        self.connected = false;
    }

    fn release(&mut self) {
        self.script.lock().releases += 1;
        self.connected = false;
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn execute(&mut self, sql: &str, _params: &[Value]) -> Result<(), Error> {
        {
            let mut script = self.script.lock();
            script.executed.push(sql.to_string());
            if script.drop_connection > 0 {
                script.drop_connection -= 1;
                self.connected = false;
            }
        }
        if !self.connected {
            return Err(Self::lost());
        }

        self.current.clear();
        self.pending.clear();
        self.columns = Arc::new(ColumnInfo::default());

        let mut words = sql.split_whitespace();
        match (words.next(), words.next()) {
            (Some("ROWS"), Some(counts)) => {
                let mut counts = counts
                    .split(',')
                    .map(|c| c.parse::<usize>().unwrap_or(0))
                    .collect::<VecDeque<_>>();
                let first = counts.pop_front().unwrap_or(0);
                self.pending = counts;
                self.load(first);
            }
            (Some("GATE"), _) => {
                if !self.gate.pass() {
                    return Err(Error::Query(QueryError {
                        kind: QueryErrorKind::Interrupted,
                        origin: ErrorSource::Driver,
                        code: None,
                        sql: Some(sql.to_string()),
                        sqlstate: None,
                        message: "interrupted".into(),
                        source: None,
                    }));
                }
                self.rows_affected = 0;
            }
            (Some("SLEEP"), Some(ms)) => {
                std::thread::sleep(Duration::from_millis(ms.parse().unwrap_or(0)));
                self.rows_affected = 1;
            }
            (Some("FAIL"), _) => {
                return Err(Error::Query(QueryError {
                    kind: QueryErrorKind::Syntax,
                    origin: ErrorSource::Database,
                    code: Some(1064),
                    sql: Some(sql.to_string()),
                    sqlstate: Some("42000".into()),
                    message: "You have an error in your SQL syntax".into(),
                    source: None,
                }));
            }
            _ => self.rows_affected = 1,
        }
        Ok(())
    }

    fn columns(&self) -> Arc<ColumnInfo> {
        Arc::clone(&self.columns)
    }

    fn fetch_row(&mut self) -> Result<Option<Row>, Error> {
        {
            let mut script = self.script.lock();
            match script.fail_fetch_after {
                Some(0) => {
                    script.fail_fetch_after = None;
                    self.connected = false;
                    return Err(Self::lost());
                }
                Some(n) => script.fail_fetch_after = Some(n - 1),
                None => {}
            }
        }
        Ok(self.current.pop_front())
    }

    fn next_result(&mut self) -> Result<bool, Error> {
        match self.pending.pop_front() {
            Some(count) => {
                self.load(count);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn stats(&self) -> ResultStats {
        ResultStats {
            rows_affected: self.rows_affected,
            last_insert_id: (self.rows_affected > 0).then_some(42),
        }
    }

    fn default_schema(&self) -> Option<String> {
        Some("main".to_string())
    }

    fn current_schema(&self) -> Option<String> {
        Some(self.schema.clone())
    }

    fn set_current_schema(&mut self, schema: &str) -> Result<(), Error> {
        if schema != "main" && !self.script.lock().schemas.iter().any(|s| s == schema) {
            return Err(Error::Query(QueryError {
                kind: QueryErrorKind::NotFound,
                origin: ErrorSource::Database,
                code: Some(1049),
                sql: None,
                sqlstate: Some("42000".into()),
                message: format!("Unknown database '{}'", schema),
                source: None,
            }));
        }
        self.schema = schema.to_string();
        Ok(())
    }

    fn interrupter(&self) -> Option<Interrupter> {
        let script = Arc::clone(&self.script);
        let gate = Arc::clone(&self.gate);
        Some(Arc::new(move || {
            script.lock().interrupts += 1;
            gate.interrupt();
        }))
    }

    fn ping(&mut self) -> Result<(), Error> {
        self.script.lock().pings += 1;
        if self.connected {
            Ok(())
        } else {
            Err(Error::not_connected(ErrorSource::Driver))
        }
    }
}

/// Collect events until the next terminal one.
pub fn until_terminal(rx: &Receiver<TaskEvent>) -> Vec<TaskEvent> {
    let mut events = Vec::new();
    loop {
        let event = rx
            .recv_timeout(Duration::from_secs(10))
            .expect("timed out waiting for a task event");
        let terminal = event.state.is_terminal();
        events.push(event);
        if terminal {
            return events;
        }
    }
}

pub fn terminal_state(events: &[TaskEvent]) -> TaskState {
    events.last().map_or(TaskState::Pending, |e| e.state)
}

/// Poll `cond` until it holds or a generous deadline passes.
pub fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}
