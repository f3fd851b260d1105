//! Best-effort cancellation of queued requests.
//!
//! A [`CancellationRegistry`] belongs to one session. Request ids are
//! registered when their task is enqueued and consumed when the worker
//! dequeues it, so marking an id only has an effect while the task is still
//! waiting in the queue.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

#[derive(Debug, Default)]
struct RegistryState {
    /// Queued tasks per request id; ids may repeat.
    queued: HashMap<String, usize>,
    cancelled: HashSet<String>,
}

/// Set of request ids marked for cancellation, shared between a session
/// handle and its worker.
#[derive(Debug, Clone, Default)]
pub struct CancellationRegistry {
    state: Arc<Mutex<RegistryState>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that a task carrying `request_id` entered the queue.
    pub fn enqueue(&self, request_id: &str) {
        let mut state = self.state.lock();
        *state.queued.entry(request_id.to_string()).or_insert(0) += 1;
    }

    /// Mark `request_id` for cancellation.
    ///
    /// Returns `false` (and records nothing) when no task with that id is
    /// waiting in the queue.
    pub fn cancel(&self, request_id: &str) -> bool {
        let mut state = self.state.lock();
        if state.queued.get(request_id).copied().unwrap_or(0) == 0 {
            return false;
        }
        state.cancelled.insert(request_id.to_string());
        true
    }

    /// Called by the worker when a task leaves the queue. Returns whether it
    /// must be cancelled instead of executed. The mark is consumed.
    pub fn begin(&self, request_id: &str) -> bool {
        let mut state = self.state.lock();
        if let Some(count) = state.queued.get_mut(request_id) {
            *count -= 1;
            if *count == 0 {
                state.queued.remove(request_id);
            }
        }
        state.cancelled.remove(request_id)
    }

    pub fn is_cancelled(&self, request_id: &str) -> bool {
        self.state.lock().cancelled.contains(request_id)
    }

    /// Number of queued tasks that carry a request id.
    pub fn pending(&self) -> usize {
        self.state.lock().queued.values().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_before_dequeue() {
        let registry = CancellationRegistry::new();
        registry.enqueue("r1");
        assert!(registry.cancel("r1"));
        assert!(registry.is_cancelled("r1"));
        assert!(registry.begin("r1"));
        assert!(!registry.is_cancelled("r1"));
        assert_eq!(registry.pending(), 0);
    }

    #[test]
    fn cancel_after_dequeue_is_a_noop() {
        let registry = CancellationRegistry::new();
        registry.enqueue("r1");
        assert!(!registry.begin("r1"));
        assert!(!registry.cancel("r1"));
        assert!(!registry.is_cancelled("r1"));
    }

    #[test]
    fn unknown_id_is_ignored() {
        let registry = CancellationRegistry::new();
        assert!(!registry.cancel("nope"));
        assert!(!registry.begin("nope"));
    }

    #[test]
    fn duplicate_ids_share_one_mark() {
        let registry = CancellationRegistry::new();
        registry.enqueue("dup");
        registry.enqueue("dup");
        assert_eq!(registry.pending(), 2);
        assert!(registry.cancel("dup"));
        assert!(registry.begin("dup"));
        // The mark was consumed by the first task.
        assert!(!registry.begin("dup"));
        assert_eq!(registry.pending(), 0);
    }

    #[test]
    fn clones_share_state() {
        let registry = CancellationRegistry::new();
        let worker_side = registry.clone();
        registry.enqueue("a");
        assert!(registry.cancel("a"));
        assert!(worker_side.begin("a"));
    }
}
