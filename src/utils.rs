//! Shared utilities: the outbound message queue and operator-facing error
//! formatting.

use std::collections::VecDeque;
use std::fmt::Write;

use parking_lot::{Condvar, Mutex};

/// Unbounded FIFO with a condition variable, drained by the router loop.
pub struct MessageQueue<T> {
    items: Mutex<VecDeque<T>>,
    ready: Condvar,
}

impl<T> Default for MessageQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> MessageQueue<T> {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
        }
    }

    /// Push an item and wake one waiter.
    pub fn enqueue(&self, item: T) {
        self.items.lock().push_back(item);
        self.ready.notify_one();
    }

    /// Take every queued item in FIFO order.
    pub fn try_drain(&self) -> Vec<T> {
        self.items.lock().drain(..).collect()
    }

    /// True when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Block until an item is queued or the timeout elapses. Returns true
    /// when the queue is non-empty.
    pub fn wait_nonempty(&self, timeout: std::time::Duration) -> bool {
        let mut items = self.items.lock();
        if items.is_empty() {
            self.ready.wait_for(&mut items, timeout);
        }
        !items.is_empty()
    }
}

/// Format an error for operator consumption, with a hint for the common
/// failure classes.
pub fn format_user_error(error: &anyhow::Error) -> String {
    let mut out = String::new();
    let message = format!("{error:#}");

    writeln!(&mut out, "error: {message}").ok();

    if message.contains("bind") || message.contains("address") {
        writeln!(&mut out).ok();
        writeln!(&mut out, "A socket could not be bound. Check that no other").ok();
        writeln!(&mut out, "rdpmux instance is running and that the base port").ok();
        writeln!(&mut out, "range is free (ss -tlnp | grep <port>).").ok();
    } else if message.contains("certificate") || message.contains("TLS") {
        writeln!(&mut out).ok();
        writeln!(&mut out, "TLS certificates could not be loaded. Expected").ok();
        writeln!(&mut out, "server.crt and server.key under the configuration").ok();
        writeln!(&mut out, "directory (--config-path, default /etc/rdpmux).").ok();
    } else if message.contains("bus") || message.contains("dbus") {
        writeln!(&mut out).ok();
        writeln!(&mut out, "The management bus name could not be acquired.").ok();
        writeln!(&mut out, "Check the D-Bus policy for org.RDPMux.RDPMux and").ok();
        writeln!(&mut out, "that the system bus is reachable.").ok();
    }

    writeln!(&mut out).ok();
    writeln!(&mut out, "Run with -v (repeatable) for detailed logs.").ok();
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn queue_is_fifo() {
        let queue = MessageQueue::new();
        queue.enqueue(1);
        queue.enqueue(2);
        queue.enqueue(3);
        assert_eq!(queue.try_drain(), vec![1, 2, 3]);
        assert!(queue.is_empty());
    }

    #[test]
    fn wait_nonempty_sees_queued_items() {
        let queue = MessageQueue::new();
        queue.enqueue(7u32);
        assert!(queue.wait_nonempty(Duration::from_millis(1)));

        queue.try_drain();
        assert!(!queue.wait_nonempty(Duration::from_millis(1)));
    }

    #[test]
    fn user_error_mentions_bind_hint() {
        let err = anyhow::anyhow!("failed to bind 0.0.0.0:3901");
        let formatted = format_user_error(&err);
        assert!(formatted.contains("bind"));
        assert!(formatted.contains("-v"));
    }
}
