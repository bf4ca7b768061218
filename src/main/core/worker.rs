use std::cell::RefCell;
use std::sync::Arc;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;

use crate::host::node::NodeInfo;

/// When the process started, for the wall-clock time in log lines.
static START: Lazy<Instant> = Lazy::new(Instant::now);

// thread-local global state
std::thread_local! {
    static WORKER: RefCell<Worker> = const { RefCell::new(Worker::new()) };
}

/// Context for the current thread, readable by code that has no access to the kernel (such as
/// the logger).
#[derive(Debug)]
pub struct Worker {
    // The node whose events are being processed.
    active_node: Option<Arc<NodeInfo>>,
    // Emulation time of the event being processed.
    now: Option<Duration>,
}

impl Worker {
    const fn new() -> Self {
        Self {
            active_node: None,
            now: None,
        }
    }

    /// Run `f` with the worker of this thread. Returns `None` if the thread-local has already
    /// been destroyed.
    fn with<F, R>(f: F) -> Option<R>
    where
        F: FnOnce(&RefCell<Worker>) -> R,
    {
        WORKER.try_with(|w| f(w)).ok()
    }

    /// Run `f` with the active node, or return `None` if there is none.
    #[must_use]
    pub fn with_active_node<F, R>(f: F) -> Option<R>
    where
        F: FnOnce(&NodeInfo) -> R,
    {
        Worker::with(|w| w.borrow().active_node.as_deref().map(f)).flatten()
    }

    pub fn active_node() -> Option<Arc<NodeInfo>> {
        Worker::with(|w| w.borrow().active_node.clone()).flatten()
    }

    pub fn set_active_node(info: Arc<NodeInfo>) {
        let old = Worker::with(|w| w.borrow_mut().active_node.replace(info)).flatten();
        debug_assert!(old.is_none());
    }

    pub fn clear_active_node() {
        Worker::with(|w| w.borrow_mut().active_node.take());
    }

    pub fn set_current_time(t: Duration) {
        Worker::with(|w| w.borrow_mut().now.replace(t));
    }

    pub fn clear_current_time() {
        Worker::with(|w| w.borrow_mut().now.take());
    }

    pub fn current_time() -> Option<Duration> {
        Worker::with(|w| w.borrow().now).flatten()
    }

    /// Wall-clock time since the process started.
    pub fn elapsed() -> Duration {
        START.elapsed()
    }
}

/// Marks a node as active for as long as it's alive.
pub struct ActiveNodeGuard(());

impl ActiveNodeGuard {
    pub fn new(info: Arc<NodeInfo>) -> Self {
        Worker::set_active_node(info);
        Self(())
    }
}

impl Drop for ActiveNodeGuard {
    fn drop(&mut self) {
        Worker::clear_active_node();
    }
}
