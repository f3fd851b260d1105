mod common;

use common::{Gate, Script, Stub, eventually, terminal_state, until_terminal};
use dbsession::{
    Capability, ConnectionEvent, ConnectionOptions, Error, QueryRequest, ResultSink, Session,
    SessionConfig, SetupHook, TaskData, TaskEvent, TaskPhase, TaskState, TaskTracker,
};
use dbsession_core::{SessionError, SessionErrorKind};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

fn fast_config() -> SessionConfig {
    SessionConfig::default().reconnect_delay(Duration::ZERO)
}

fn stub_session(
    options: ConnectionOptions,
    config: SessionConfig,
) -> (Session, Arc<Mutex<Script>>, Arc<Gate>) {
    let (stub, script, gate) = Stub::new();
    let session = Session::new("test", Box::new(stub), options, config);
    (session, script, gate)
}

fn opened() -> (Session, Arc<Mutex<Script>>, Arc<Gate>) {
    let (session, script, gate) = stub_session(ConnectionOptions::new(), fast_config());
    session.open().expect("open stub session");
    (session, script, gate)
}

/// Close on a helper thread so a hanging close fails the test instead of
/// blocking it.
fn close_within(session: &Session, timeout: Duration) -> bool {
    let (tx, rx) = mpsc::channel();
    let handle = session.clone();
    std::thread::spawn(move || {
        let _ = tx.send(handle.close());
    });
    matches!(rx.recv_timeout(timeout), Ok(Ok(())))
}

fn streamed_rows(events: &[TaskEvent]) -> Vec<serde_json::Value> {
    events
        .iter()
        .filter_map(|e| e.rows())
        .flat_map(|c| c.rows.iter().cloned())
        .collect()
}

fn column_headers(events: &[TaskEvent]) -> usize {
    events
        .iter()
        .filter_map(|e| e.rows())
        .filter(|c| c.columns.is_some())
        .count()
}

fn session_error_kind(err: &Error) -> Option<SessionErrorKind> {
    match err {
        Error::Session(SessionError { kind, .. }) => Some(*kind),
        _ => None,
    }
}

#[test]
fn tasks_run_in_submission_order_one_at_a_time() {
    let (session, script, _) = opened();
    let active = Arc::new(AtomicUsize::new(0));
    let overlaps = Arc::new(AtomicUsize::new(0));
    {
        let active = Arc::clone(&active);
        let overlaps = Arc::clone(&overlaps);
        session.add_task_observer(move |phase, _| match phase {
            TaskPhase::Started => {
                if active.fetch_add(1, Ordering::SeqCst) != 0 {
                    overlaps.fetch_add(1, Ordering::SeqCst);
                }
            }
            TaskPhase::Finished => {
                active.fetch_sub(1, Ordering::SeqCst);
            }
        });
    }

    let (tx, rx) = mpsc::channel();
    let submitters: Vec<_> = (0..4)
        .map(|t| {
            let session = session.clone();
            let tx = tx.clone();
            std::thread::spawn(move || {
                for i in 0..5 {
                    session
                        .execute(
                            QueryRequest::new(format!("SLEEP 1 t{t}-{i}"))
                                .request_id(format!("t{t}-{i}"))
                                .sink(ResultSink::Channel(tx.clone())),
                        )
                        .unwrap();
                }
            })
        })
        .collect();
    for s in submitters {
        s.join().unwrap();
    }
    drop(tx);
    session.close().unwrap();

    let events: Vec<_> = rx.iter().collect();
    assert_eq!(overlaps.load(Ordering::SeqCst), 0);

    // Exactly one terminal event per request, all OK.
    let mut terminals: HashMap<String, usize> = HashMap::new();
    for event in events.iter().filter(|e| e.state.is_terminal()) {
        assert_eq!(event.state, TaskState::Ok);
        *terminals
            .entry(event.request_id.clone().unwrap())
            .or_default() += 1;
    }
    assert_eq!(terminals.len(), 20);
    assert!(terminals.values().all(|n| *n == 1));

    // Per submitter, the worker saw statements in the order they were sent.
    let executed = script.lock().executed.clone();
    for t in 0..4 {
        let mine: Vec<_> = executed
            .iter()
            .filter(|sql| sql.contains(&format!(" t{t}-")))
            .cloned()
            .collect();
        let expected: Vec<_> = (0..5).map(|i| format!("SLEEP 1 t{t}-{i}")).collect();
        assert_eq!(mine, expected);
    }
}

#[test]
fn start_event_precedes_terminal_event() {
    let (session, _, _) = opened();
    let (tx, rx) = mpsc::channel();
    session
        .execute(QueryRequest::new("UPDATE t").request_id("u1").sink(tx.into()))
        .unwrap();
    let events = until_terminal(&rx);
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].state, TaskState::Pending);
    assert_eq!(events[0].message.as_deref(), Some("Execution started..."));
    assert_eq!(events[1].state, TaskState::Ok);
    assert_eq!(events[1].request_id.as_deref(), Some("u1"));
    session.close().unwrap();
}

#[test]
fn cancel_before_dequeue_dispatches_cancelled_without_payload() {
    let (session, script, gate) = opened();
    let tracker = TaskTracker::new();
    let (tx, rx) = mpsc::channel();

    session
        .execute(QueryRequest::new("GATE").request_id("blocker"))
        .unwrap();
    session
        .execute(
            QueryRequest::new("ROWS 3")
                .request_id("victim")
                .tracker(tracker.clone())
                .sink(tx.into()),
        )
        .unwrap();

    assert!(session.cancel_request("victim"));
    gate.open();

    let events = until_terminal(&rx);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].state, TaskState::Cancelled);
    assert!(events[0].data.is_none());
    assert!(events[0].error.is_none());

    session.close().unwrap();
    assert!(!script.lock().executed.contains(&"ROWS 3".to_string()));
    let failures = tracker.take();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].state, TaskState::Cancelled);
    assert_eq!(failures[0].request_id.as_deref(), Some("victim"));
}

#[test]
fn cancel_after_completion_is_a_no_op() {
    let (session, _, _) = opened();
    let (tx, rx) = mpsc::channel();
    session
        .execute(QueryRequest::new("ROWS 1").request_id("done").sink(tx.clone().into()))
        .unwrap();
    assert_eq!(terminal_state(&until_terminal(&rx)), TaskState::Ok);

    assert!(!session.cancel_request("done"));

    // A later request reusing the id is unaffected.
    session
        .execute(QueryRequest::new("ROWS 1").request_id("done").sink(tx.into()))
        .unwrap();
    assert_eq!(terminal_state(&until_terminal(&rx)), TaskState::Ok);
    session.close().unwrap();
}

#[test]
fn close_twice_releases_once() {
    let (session, script, _) = opened();
    session.close().unwrap();
    session.close().unwrap();
    assert_eq!(script.lock().releases, 1);
    assert!(!session.is_open());

    let err = session.execute(QueryRequest::new("ROWS 1")).unwrap_err();
    assert_eq!(session_error_kind(&err), Some(SessionErrorKind::Closed));
}

#[test]
fn closing_a_never_opened_session_releases_once() {
    let (session, script, _) = stub_session(ConnectionOptions::new(), fast_config());
    session.close().unwrap();
    session.close().unwrap();
    let script = script.lock();
    assert_eq!(script.connects, 0);
    assert_eq!(script.releases, 1);
}

#[test]
fn dropping_the_last_handle_releases_the_capability() {
    let (session, script, _) = opened();
    let other = session.clone();
    drop(session);
    assert_eq!(script.lock().releases, 0);
    drop(other);
    assert!(eventually(|| script.lock().releases == 1));
}

#[test]
fn open_failure_is_returned_to_the_caller() {
    let (session, script, _) = stub_session(ConnectionOptions::new(), fast_config());
    script.lock().fail_connects = 1;

    let err = session.open().unwrap_err();
    assert!(matches!(err, Error::Connection(_)));
    assert_eq!(err.message(), "Connection refused");
    assert!(session.wait_terminated(Duration::from_secs(5)));
    assert_eq!(script.lock().releases, 1);

    session.close().unwrap();
    assert_eq!(script.lock().releases, 1);
}

#[test]
fn second_open_is_rejected() {
    let (session, _, _) = opened();
    let err = session.open().unwrap_err();
    assert_eq!(session_error_kind(&err), Some(SessionErrorKind::AlreadyOpen));
    session.close().unwrap();
}

#[test]
fn execute_before_open_is_rejected() {
    let (session, _, _) = stub_session(ConnectionOptions::new(), fast_config());
    let err = session.execute(QueryRequest::new("ROWS 1")).unwrap_err();
    assert_eq!(session_error_kind(&err), Some(SessionErrorKind::NotOpen));
}

#[test]
fn lost_connection_is_retried_after_one_reconnect() {
    let options = ConnectionOptions::new().auto_reconnect(true);
    let (session, script, _) = stub_session(options, fast_config());
    session.open().unwrap();
    script.lock().drop_connection = 1;

    let (tx, rx) = mpsc::channel();
    session
        .execute(QueryRequest::new("ROWS 2").sink(tx.into()))
        .unwrap();
    let events = until_terminal(&rx);
    assert_eq!(terminal_state(&events), TaskState::Ok);
    assert_eq!(events.last().unwrap().rows().unwrap().total_row_count, 2);

    session.close().unwrap();
    let script = script.lock();
    assert_eq!(script.connects, 2);
    assert_eq!(script.executed, vec!["ROWS 2", "ROWS 2"]);
}

#[test]
fn lost_connection_without_auto_reconnect_fails() {
    let (session, script, _) = opened();
    script.lock().drop_connection = 1;

    let (tx, rx) = mpsc::channel();
    session
        .execute(QueryRequest::batch(["ROWS 1", "ROWS 2"]).sink(tx.into()))
        .unwrap();
    let events = until_terminal(&rx);
    let last = events.last().unwrap();
    assert_eq!(last.state, TaskState::Error);
    assert_eq!(
        last.error.as_ref().unwrap().msg,
        "Lost connection to server during query"
    );

    session.close().unwrap();
    let script = script.lock();
    assert_eq!(script.connects, 1);
    // The remaining statement was abandoned.
    assert_eq!(script.executed, vec!["ROWS 1"]);
}

#[test]
fn persistent_connection_loss_is_retried_a_bounded_number_of_times() {
    let options = ConnectionOptions::new().auto_reconnect(true);
    let config = fast_config().statement_retries(1).reconnect_attempts(2);
    let (session, script, _) = stub_session(options, config);
    session.open().unwrap();
    script.lock().drop_connection = 100;

    let (tx, rx) = mpsc::channel();
    session
        .execute(QueryRequest::new("ROWS 1").sink(tx.into()))
        .unwrap();
    assert_eq!(terminal_state(&until_terminal(&rx)), TaskState::Error);
    session.close().unwrap();
    assert_eq!(script.lock().executed.len(), 2);
}

#[test]
fn failed_automatic_reconnect_surfaces_the_statement_error() {
    let options = ConnectionOptions::new().auto_reconnect(true);
    let config = fast_config().reconnect_attempts(3);
    let (session, script, _) = stub_session(options, config);
    session.open().unwrap();
    {
        let mut script = script.lock();
        script.drop_connection = 1;
        script.fail_connects = 3;
    }

    let (tx, rx) = mpsc::channel();
    session
        .execute(QueryRequest::new("ROWS 1").sink(tx.into()))
        .unwrap();
    let events = until_terminal(&rx);
    assert_eq!(terminal_state(&events), TaskState::Error);
    session.close().unwrap();
    // One initial connect plus three automatic attempts.
    assert_eq!(script.lock().connects, 4);
}

#[test]
fn user_reconnect_makes_a_single_attempt() {
    let options = ConnectionOptions::new().auto_reconnect(true);
    let (session, script, _) = stub_session(options, fast_config());
    session.open().unwrap();

    session.reconnect().unwrap();
    assert_eq!(script.lock().connects, 2);

    script.lock().fail_connects = 5;
    assert!(session.reconnect().is_err());
    assert_eq!(script.lock().connects, 3);
    session.close().unwrap();
}

#[test]
fn reconnect_with_new_options() {
    let (session, script, _) = opened();
    session
        .reconnect_with(ConnectionOptions::new().option("host", "replica"))
        .unwrap();
    assert_eq!(script.lock().last_host.as_deref(), Some("replica"));
    session.close().unwrap();

    let err = session.reconnect().unwrap_err();
    assert_eq!(session_error_kind(&err), Some(SessionErrorKind::Closed));
}

#[test]
fn status_accessors_time_out_while_a_task_runs() {
    let config = fast_config().status_timeout(Duration::from_millis(50));
    let (session, _, gate) = stub_session(ConnectionOptions::new(), config);
    session.open().unwrap();

    let started = Arc::new(AtomicUsize::new(0));
    {
        let started = Arc::clone(&started);
        session.add_task_observer(move |phase, _| {
            if phase == TaskPhase::Started {
                started.fetch_add(1, Ordering::SeqCst);
            }
        });
    }
    session.execute(QueryRequest::new("GATE")).unwrap();
    assert!(eventually(|| started.load(Ordering::SeqCst) == 1));
    // Started fires just before the worker takes the session mutex.
    std::thread::sleep(Duration::from_millis(20));

    assert!(matches!(session.last_error(), Err(Error::Timeout)));
    assert!(matches!(session.rows_affected(), Err(Error::Timeout)));

    gate.open();
    session.close().unwrap();
    assert_eq!(session.rows_affected().unwrap(), 0);
}

#[test]
fn status_accessors_work_from_a_result_callback() {
    let (session, _, _) = opened();
    let (tx, rx) = mpsc::channel();
    let handle = session.clone();
    let sink = ResultSink::callback(move |event| {
        if event.state.is_terminal() {
            let _ = tx.send(handle.last_error().is_ok());
        }
    });
    session
        .execute(QueryRequest::new("ROWS 1").sink(sink))
        .unwrap();
    assert!(rx.recv_timeout(Duration::from_secs(10)).unwrap());
    session.close().unwrap();
}

#[test]
fn statistics_follow_the_last_task() {
    let (session, _, _) = opened();
    let (tx, rx) = mpsc::channel();

    session
        .execute(QueryRequest::new("INSERT x").sink(tx.clone().into()))
        .unwrap();
    until_terminal(&rx);
    assert_eq!(session.rows_affected().unwrap(), 1);
    assert_eq!(session.last_insert_id().unwrap(), Some(42));
    assert!(session.last_error().unwrap().is_none());
    let status = session.last_status().unwrap();
    assert_eq!(status.state, TaskState::Ok);
    assert!(status.msg.starts_with("Query finished in "));
    assert!(session.last_execution_time().unwrap().is_some());

    session
        .execute(QueryRequest::new("FAIL").sink(tx.into()))
        .unwrap();
    let events = until_terminal(&rx);
    let error = events.last().unwrap().error.clone().unwrap();
    assert_eq!(error.code, Some(1064));
    assert_eq!(error.sqlstate.as_deref(), Some("42000"));

    let status = session.last_status().unwrap();
    assert_eq!(status.state, TaskState::Error);
    assert_eq!(status.msg, "You have an error in your SQL syntax");
    assert_eq!(session.last_error().unwrap(), Some(error));
    session.close().unwrap();
}

#[test]
fn kill_stops_a_streaming_query() {
    let (session, _, _) = opened();
    let (tx, rx) = mpsc::channel();
    let handle = session.clone();
    let sink = ResultSink::callback(move |event| {
        if event.rows().is_some() && event.state == TaskState::Pending {
            handle.kill();
        }
        let _ = tx.send(event);
    });
    session
        .execute(
            QueryRequest::new("ROWS 100")
                .row_packet_size(1)
                .sink(sink),
        )
        .unwrap();

    let events = until_terminal(&rx);
    let last = events.last().unwrap();
    assert_eq!(last.state, TaskState::Error);
    assert_eq!(last.error.as_ref().unwrap().msg, "Query killed");
    let streamed: usize = events
        .iter()
        .filter_map(|e| e.rows())
        .map(|c| c.rows.len())
        .sum();
    assert!(streamed < 100);

    // The next task starts with a clear kill flag.
    let (tx, rx) = mpsc::channel();
    session
        .execute(QueryRequest::new("ROWS 3").sink(tx.into()))
        .unwrap();
    assert_eq!(terminal_state(&until_terminal(&rx)), TaskState::Ok);
    assert!(!session.is_killed());
    session.close().unwrap();
}

#[test]
fn close_from_a_result_callback_does_not_deadlock() {
    let (session, script, _) = opened();
    let handle = session.clone();
    let sink = ResultSink::callback(move |event| {
        if event.state.is_terminal() {
            handle.close().unwrap();
        }
    });
    session
        .execute(QueryRequest::new("ROWS 1").sink(sink))
        .unwrap();
    assert!(session.wait_terminated(Duration::from_secs(10)));
    assert_eq!(script.lock().releases, 1);
    session.close().unwrap();
}

#[test]
fn observers_see_every_task() {
    let (session, _, _) = opened();
    let seen = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = Arc::clone(&seen);
        session.add_task_observer(move |phase, id| {
            seen.lock().push((phase, id.map(str::to_string)));
        });
    }
    session
        .execute(QueryRequest::new("ROWS 1").request_id("a"))
        .unwrap();
    session.execute(QueryRequest::new("ROWS 1")).unwrap();
    session.close().unwrap();

    assert_eq!(
        *seen.lock(),
        vec![
            (TaskPhase::Started, Some("a".to_string())),
            (TaskPhase::Finished, Some("a".to_string())),
            (TaskPhase::Started, None),
            (TaskPhase::Finished, None),
        ]
    );
}

#[test]
fn keep_alive_pings_without_touching_statistics() {
    let options = ConnectionOptions::new().ping_interval(Duration::from_millis(10));
    let (session, script, _) = stub_session(options, fast_config());
    session.open().unwrap();

    assert!(eventually(|| script.lock().pings >= 3));
    assert_eq!(session.rows_affected().unwrap(), 0);
    assert!(session.last_execution_time().unwrap().is_none());

    session.close().unwrap();
    let pings = script.lock().pings;
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(script.lock().pings, pings);
    assert_eq!(script.lock().releases, 1);
}

#[test]
fn transaction_helpers_submit_plain_statements() {
    let (session, script, _) = opened();
    session.start_transaction().unwrap();
    session.execute(QueryRequest::new("INSERT x")).unwrap();
    session.rollback().unwrap();
    session.start_transaction().unwrap();
    session.commit().unwrap();
    session.close().unwrap();
    assert_eq!(
        script.lock().executed,
        vec!["BEGIN", "INSERT x", "ROLLBACK", "BEGIN", "COMMIT"]
    );
}

#[test]
fn non_threaded_sessions_return_the_outcome() {
    let config = fast_config().threaded(false);
    let (session, script, _) = stub_session(ConnectionOptions::new(), config);
    session.open().unwrap();

    let outcome = session
        .execute(QueryRequest::new("ROWS 4").row_packet_size(2))
        .unwrap()
        .expect("non-threaded execute returns an outcome");
    assert_eq!(outcome.state, TaskState::Ok);
    let states: Vec<_> = outcome.events.iter().map(|e| e.state).collect();
    assert_eq!(
        states,
        vec![TaskState::Pending, TaskState::Pending, TaskState::Ok]
    );
    assert_eq!(session.rows_affected().unwrap(), 0);

    session.reconnect().unwrap();
    session.close().unwrap();
    session.close().unwrap();
    let script = script.lock();
    assert_eq!(script.connects, 2);
    assert_eq!(script.releases, 1);
}

#[test]
fn info_describes_the_session() {
    let (session, _, _) = opened();
    let info = session.info();
    assert_eq!(info["id"], "test");
    assert_eq!(info["backend"], "Stub");
    assert_eq!(info["threaded"], true);
    assert_eq!(info["auto_reconnect"], false);
    session.close().unwrap();
}

#[test]
fn panicking_result_callback_fails_only_its_task() {
    let (session, _, _) = opened();
    let tracker = TaskTracker::new();
    let sink = ResultSink::callback(|event| {
        if event.state == TaskState::Pending && event.rows().is_some() {
            panic!("sink boom");
        }
    });
    session
        .execute(
            QueryRequest::new("ROWS 3")
                .request_id("boom")
                .row_packet_size(1)
                .tracker(tracker.clone())
                .sink(sink),
        )
        .unwrap();

    let (tx, rx) = mpsc::channel();
    session
        .execute(QueryRequest::new("ROWS 2").sink(tx.into()))
        .unwrap();
    assert_eq!(terminal_state(&until_terminal(&rx)), TaskState::Ok);

    let failures = tracker.take();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].state, TaskState::Error);
    assert_eq!(
        failures[0].error.as_ref().unwrap().msg,
        "Task panicked: sink boom"
    );
    assert!(close_within(&session, Duration::from_secs(3)));
}

struct PanicOnReconnect {
    connects: u32,
}

impl SetupHook for PanicOnReconnect {
    fn on_connected(&mut self, _capability: &mut dyn Capability) -> Result<(), Error> {
        self.connects += 1;
        if self.connects == 2 {
            panic!("setup boom");
        }
        Ok(())
    }
}

#[test]
fn worker_panic_outside_a_task_still_terminates_the_session() {
    let (session, script, _) = stub_session(ConnectionOptions::new(), fast_config());
    session.add_setup_hook(PanicOnReconnect { connects: 0 });
    session.open().unwrap();

    let err = session.reconnect().unwrap_err();
    assert_eq!(session_error_kind(&err), Some(SessionErrorKind::WorkerGone));
    assert!(session.wait_terminated(Duration::from_secs(5)));
    assert!(!session.is_open());
    assert!(close_within(&session, Duration::from_secs(3)));
    assert_eq!(script.lock().releases, 1);
}

#[test]
fn out_of_range_ping_interval_runs_without_keep_alive() {
    let options = ConnectionOptions {
        ping_interval: Some(1e30),
        ..ConnectionOptions::default()
    };
    let (session, script, _) = stub_session(options, fast_config());
    session.open().unwrap();

    let (tx, rx) = mpsc::channel();
    session
        .execute(QueryRequest::new("ROWS 1").sink(tx.into()))
        .unwrap();
    assert_eq!(terminal_state(&until_terminal(&rx)), TaskState::Ok);
    assert!(close_within(&session, Duration::from_secs(3)));
    assert_eq!(script.lock().pings, 0);
}

#[test]
fn connection_lost_after_streaming_is_not_retried() {
    let options = ConnectionOptions::new().auto_reconnect(true);
    let (session, script, _) = stub_session(options, fast_config());
    session.open().unwrap();
    script.lock().fail_fetch_after = Some(3);

    let (tx, rx) = mpsc::channel();
    session
        .execute(
            QueryRequest::new("ROWS 5")
                .row_packet_size(2)
                .sink(tx.into()),
        )
        .unwrap();
    let events = until_terminal(&rx);
    assert_eq!(terminal_state(&events), TaskState::Error);
    assert_eq!(
        streamed_rows(&events),
        vec![serde_json::json!([0]), serde_json::json!([1])]
    );
    assert_eq!(column_headers(&events), 1);

    session.close().unwrap();
    let script = script.lock();
    assert_eq!(script.executed, vec!["ROWS 5"]);
    assert_eq!(script.connects, 1);
}

#[test]
fn connection_lost_before_the_first_chunk_is_retried() {
    let options = ConnectionOptions::new().auto_reconnect(true);
    let (session, script, _) = stub_session(options, fast_config());
    session.open().unwrap();
    script.lock().fail_fetch_after = Some(1);

    let (tx, rx) = mpsc::channel();
    session
        .execute(
            QueryRequest::new("ROWS 5")
                .row_packet_size(2)
                .sink(tx.into()),
        )
        .unwrap();
    let events = until_terminal(&rx);
    assert_eq!(terminal_state(&events), TaskState::Ok);
    let expected: Vec<_> = (0..5).map(|i| serde_json::json!([i])).collect();
    assert_eq!(streamed_rows(&events), expected);
    assert_eq!(column_headers(&events), 1);

    session.close().unwrap();
    let script = script.lock();
    assert_eq!(script.executed, vec!["ROWS 5", "ROWS 5"]);
    assert_eq!(script.connects, 2);
}

fn describe(event: &ConnectionEvent<'_>) -> String {
    match event {
        ConnectionEvent::Connecting(attempt) => format!("connecting {attempt:?}"),
        ConnectionEvent::Connected(attempt) => format!("connected {attempt:?}"),
        ConnectionEvent::Failed(attempt, error) => {
            format!("failed {attempt:?}: {}", error.message())
        }
    }
}

#[test]
fn connection_observers_follow_open_and_reconnect() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let (session, _, _) = stub_session(ConnectionOptions::new(), fast_config());
    {
        let seen = Arc::clone(&seen);
        session.add_connection_observer(move |event| seen.lock().push(describe(event)));
    }
    session.open().unwrap();
    session.reconnect().unwrap();
    session.close().unwrap();
    assert_eq!(
        *seen.lock(),
        vec![
            "connecting Open",
            "connected Open",
            "connecting Reconnect(User)",
            "connected Reconnect(User)",
        ]
    );

    let seen = Arc::new(Mutex::new(Vec::new()));
    let (session, script, _) = stub_session(ConnectionOptions::new(), fast_config());
    script.lock().fail_connects = 1;
    {
        let seen = Arc::clone(&seen);
        session.add_connection_observer(move |event| seen.lock().push(describe(event)));
    }
    assert!(session.open().is_err());
    session.close().unwrap();
    assert_eq!(
        *seen.lock(),
        vec!["connecting Open", "failed Open: Connection refused"]
    );
}

struct SessionVariables {
    applied: Arc<AtomicUsize>,
}

impl SetupHook for SessionVariables {
    fn on_connected(&mut self, capability: &mut dyn Capability) -> Result<(), Error> {
        capability.execute("SET sql_mode = 'ANSI'", &[])?;
        self.applied.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[test]
fn setup_hooks_are_redone_after_every_connect() {
    let applied = Arc::new(AtomicUsize::new(0));
    let options = ConnectionOptions::new().auto_reconnect(true);
    let (session, script, _) = stub_session(options, fast_config());
    session.add_setup_hook(SessionVariables {
        applied: Arc::clone(&applied),
    });
    session.open().unwrap();
    session.reconnect().unwrap();

    script.lock().drop_connection = 1;
    let (tx, rx) = mpsc::channel();
    session
        .execute(QueryRequest::new("ROWS 1").sink(tx.into()))
        .unwrap();
    assert_eq!(terminal_state(&until_terminal(&rx)), TaskState::Ok);
    session.close().unwrap();

    assert_eq!(applied.load(Ordering::SeqCst), 3);
    let script = script.lock();
    assert_eq!(
        script.executed,
        vec![
            "SET sql_mode = 'ANSI'",
            "SET sql_mode = 'ANSI'",
            "ROWS 1",
            "SET sql_mode = 'ANSI'",
            "ROWS 1",
        ]
    );
}

#[test]
fn current_schema_can_be_read_and_switched() {
    let (session, script, _) = stub_session(ConnectionOptions::new(), fast_config());
    assert_eq!(session.default_schema(), None);
    session.open().unwrap();
    assert_eq!(session.default_schema().as_deref(), Some("main"));
    script.lock().schemas.push("audit".to_string());

    let (tx, rx) = mpsc::channel();
    session
        .get_current_schema(Some("s1"), tx.clone().into())
        .unwrap();
    let events = until_terminal(&rx);
    let last = events.last().unwrap();
    assert_eq!(last.state, TaskState::Ok);
    assert_eq!(last.request_id.as_deref(), Some("s1"));
    assert_eq!(last.data, Some(TaskData::Result(serde_json::json!("main"))));

    session
        .set_current_schema("audit", None, tx.clone().into())
        .unwrap();
    let events = until_terminal(&rx);
    assert_eq!(
        events.last().unwrap().data,
        Some(TaskData::Result(serde_json::json!("audit")))
    );

    session
        .set_current_schema("missing", None, tx.clone().into())
        .unwrap();
    let events = until_terminal(&rx);
    let last = events.last().unwrap();
    assert_eq!(last.state, TaskState::Error);
    assert_eq!(last.error.as_ref().unwrap().msg, "Unknown database 'missing'");

    session.get_current_schema(None, tx.into()).unwrap();
    assert_eq!(
        until_terminal(&rx).last().unwrap().data,
        Some(TaskData::Result(serde_json::json!("audit")))
    );
    // The default schema is the one the connection started with.
    assert_eq!(session.default_schema().as_deref(), Some("main"));
    session.close().unwrap();
}

#[test]
fn kill_interrupts_a_statement_inside_the_backend() {
    let (session, script, _) = opened();
    let started = Arc::new(AtomicUsize::new(0));
    {
        let started = Arc::clone(&started);
        session.add_task_observer(move |phase, _| {
            if phase == TaskPhase::Started {
                started.fetch_add(1, Ordering::SeqCst);
            }
        });
    }
    let (tx, rx) = mpsc::channel();
    session
        .execute(QueryRequest::new("GATE").sink(tx.into()))
        .unwrap();
    assert!(eventually(|| started.load(Ordering::SeqCst) == 1));
    session.kill();

    let events = until_terminal(&rx);
    let last = events.last().unwrap();
    assert_eq!(last.state, TaskState::Error);
    assert_eq!(last.error.as_ref().unwrap().msg, "Query killed");
    assert_eq!(script.lock().interrupts, 1);
    session.close().unwrap();
}

#[test]
fn keep_alive_does_not_pile_up_behind_a_long_task() {
    let options = ConnectionOptions::new().ping_interval(Duration::from_millis(10));
    let (session, script, gate) = stub_session(options, fast_config());
    session.open().unwrap();

    let started = Arc::new(AtomicUsize::new(0));
    {
        let started = Arc::clone(&started);
        session.add_task_observer(move |phase, _| {
            if phase == TaskPhase::Started {
                started.fetch_add(1, Ordering::SeqCst);
            }
        });
    }
    session.execute(QueryRequest::new("GATE")).unwrap();
    assert!(eventually(|| started.load(Ordering::SeqCst) == 1));
    std::thread::sleep(Duration::from_millis(300));
    let before = script.lock().pings;

    gate.open();
    let (tx, rx) = mpsc::channel();
    session
        .execute(QueryRequest::new("ROWS 1").sink(tx.into()))
        .unwrap();
    assert_eq!(terminal_state(&until_terminal(&rx)), TaskState::Ok);
    let burst = script.lock().pings - before;
    assert!(burst < 10, "{burst} pings ran back to back");
    session.close().unwrap();
}
