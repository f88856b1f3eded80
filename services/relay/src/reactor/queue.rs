//! Cross-thread hand-off to the reactor thread.
//!
//! Worker threads never touch the selector. They push a task onto the
//! [`SelectorQueue`] and wake the reactor, which runs the queued tasks
//! after dispatching ready keys.

use std::sync::mpsc::Sender;
use std::sync::Arc;

use mio::{Token, Waker};
use tracing::{debug, trace, warn};

use super::{Ops, ReactorContext};
use crate::buffer::BufferStateListener;

/// A task executed on the reactor thread with full access to its state.
pub type ReactorTask = Box<dyn FnOnce(&mut ReactorContext<'_>) + Send + 'static>;

/// Sending half of the reactor's task queue, paired with its waker.
#[derive(Clone)]
pub struct SelectorQueue {
    tx: Sender<ReactorTask>,
    waker: Arc<Waker>,
}

impl SelectorQueue {
    pub(crate) fn new(tx: Sender<ReactorTask>, waker: Arc<Waker>) -> Self {
        Self { tx, waker }
    }

    /// Enqueue `task` and wake the reactor.
    ///
    /// Tasks submitted after the reactor has stopped are dropped.
    pub fn submit<F>(&self, task: F)
    where
        F: FnOnce(&mut ReactorContext<'_>) + Send + 'static,
    {
        if self.tx.send(Box::new(task)).is_err() {
            trace!("Reactor stopped; task dropped");
            return;
        }
        self.wake();
    }

    /// Interrupt a blocking `poll` on the reactor thread.
    pub fn wake(&self) {
        if let Err(e) = self.waker.wake() {
            warn!(error = %e, "Failed to wake reactor");
        }
    }
}

/// Re-enables one interest op on one key.
///
/// Installed as a [`BufferStateListener`]: the read side of a buffer asks
/// for its source key's READ, the drain side for its destination key's
/// WRITE. Stale tokens are ignored by the reactor.
pub struct InterestRequest {
    queue: SelectorQueue,
    token: Token,
    ops: Ops,
}

impl InterestRequest {
    /// Re-arm READ on `token`.
    pub fn read(queue: SelectorQueue, token: Token) -> Self {
        Self {
            queue,
            token,
            ops: Ops::READ,
        }
    }

    /// Re-arm WRITE on `token`.
    pub fn write(queue: SelectorQueue, token: Token) -> Self {
        Self {
            queue,
            token,
            ops: Ops::WRITE,
        }
    }
}

impl BufferStateListener for InterestRequest {
    fn notify(&self) {
        let (token, ops) = (self.token, self.ops);
        self.queue.submit(move |cx| {
            if let Err(e) = cx.enable(token, ops) {
                debug!(token = token.0, ops = ?ops, error = %e, "Failed to re-arm interest");
            }
        });
    }
}
