//! Session contract
//!
//! A session is the application's per-connection callback handler. The
//! server creates one fresh session per accepted connection through a
//! [`SessionFactory`], and the connection drives its callbacks:
//!
//! 1. [`Session::on_connect`] exactly once, before anything else
//! 2. [`Session::on_message`] once per inbound frame, in arrival order
//! 3. [`Session::on_disconnect`] exactly once; no message follows it
//!
//! Callbacks run on the connection's I/O tasks and must not block. Hand
//! long-running work off to a spawned task.

use std::sync::Arc;

use bytes::Bytes;

use crate::net::connection::Conn;

/// Per-connection callback handler supplied by the application
pub trait Session: Send + Sync + 'static {
    /// The connection is established; `conn` stays valid for its lifetime
    fn on_connect(&self, conn: Arc<dyn Conn>);

    /// One complete inbound frame, in canonical layout
    fn on_message(&self, frame: Bytes);

    /// The connection has closed
    fn on_disconnect(&self);
}

/// Creates one session per accepted connection
pub trait SessionFactory: Send + Sync + 'static {
    fn create(&self) -> Arc<dyn Session>;
}

impl<F, S> SessionFactory for F
where
    F: Fn() -> S + Send + Sync + 'static,
    S: Session,
{
    fn create(&self) -> Arc<dyn Session> {
        Arc::new(self())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Noop;

    impl Session for Noop {
        fn on_connect(&self, _conn: Arc<dyn Conn>) {}
        fn on_message(&self, _frame: Bytes) {}
        fn on_disconnect(&self) {}
    }

    #[test]
    fn test_closure_factory_creates_fresh_sessions() {
        let created = Arc::new(AtomicUsize::new(0));
        let counter = created.clone();
        let factory = move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Noop
        };

        let first = factory.create();
        let second = factory.create();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(created.load(Ordering::SeqCst), 2);
    }
}
