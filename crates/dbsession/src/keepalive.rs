//! Idle-connection keep-alive timer.
//!
//! The prober never touches the capability itself. On every tick it hands a
//! keep-alive job to the session queue and the worker performs the ping, so
//! the capability stays single-owner.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

#[derive(Default)]
struct StopSignal {
    stopped: Mutex<bool>,
    wake: Condvar,
}

/// A timer thread bound to one session.
pub struct Prober {
    signal: Arc<StopSignal>,
    handle: Option<JoinHandle<()>>,
}

impl Prober {
    /// Start ticking every `interval`. The thread exits when stopped or when
    /// `tick` returns `false`.
    pub fn start<F>(session_id: &str, interval: Duration, mut tick: F) -> std::io::Result<Self>
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let signal = Arc::new(StopSignal::default());
        let thread_signal = Arc::clone(&signal);
        let span_id = session_id.to_string();

        let handle = thread::Builder::new()
            .name(format!("ping-{}", session_id))
            .spawn(move || {
                tracing::debug!(session_id = %span_id, ?interval, "keep-alive prober started");
                let mut stopped = thread_signal.stopped.lock();
                let mut deadline = Instant::now() + interval;
                loop {
                    if *stopped {
                        break;
                    }
                    if thread_signal
                        .wake
                        .wait_until(&mut stopped, deadline)
                        .timed_out()
                    {
                        if *stopped {
                            break;
                        }
                        deadline = Instant::now() + interval;
                        let keep_going =
                            parking_lot::MutexGuard::unlocked(&mut stopped, &mut tick);
                        if !keep_going {
                            break;
                        }
                    }
                }
                tracing::debug!(session_id = %span_id, "keep-alive prober stopped");
            })?;

        Ok(Self {
            signal,
            handle: Some(handle),
        })
    }

    /// Wake the prober immediately and wait for its thread to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        *self.signal.stopped.lock() = true;
        self.signal.wake.notify_all();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::warn!("keep-alive prober panicked");
            }
        }
    }
}

impl Drop for Prober {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn ticks_on_interval() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        let prober = Prober::start("t1", Duration::from_millis(10), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            true
        })
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while ticks.load(Ordering::SeqCst) < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        prober.stop();
        assert!(ticks.load(Ordering::SeqCst) >= 3);
    }

    #[test]
    fn stop_does_not_wait_for_the_interval() {
        let prober = Prober::start("t2", Duration::from_secs(3600), || true).unwrap();
        let started = Instant::now();
        prober.stop();
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn tick_returning_false_ends_the_thread() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        let prober = Prober::start("t3", Duration::from_millis(1), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            false
        })
        .unwrap();
        thread::sleep(Duration::from_millis(50));
        prober.stop();
        assert_eq!(ticks.load(Ordering::SeqCst), 1);
    }
}
