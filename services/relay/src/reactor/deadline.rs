//! Deadline scheduling for the reactor.
//!
//! A [`DeadlineAction`] is a callback bound to an absolute monotonic
//! instant. Actions sit in an [`UpdateablePriorityQueue`] owned by the
//! reactor thread; scheduling returns the element handle so the action can
//! be cancelled (or moved) in O(log n) before it fires. Cancelling through
//! a handle whose action has already fired is a harmless no-op.

use std::cmp::Ordering;
use std::fmt;
use std::time::{Duration, Instant};

use tcprelay_pqueue::{ElementRef, UpdateablePriorityQueue};

use super::queue::ReactorTask;
use super::ReactorContext;

/// Handle to a scheduled deadline.
pub type DeadlineRef = ElementRef;

/// A callback to run on the reactor thread at or after `deadline`.
pub struct DeadlineAction {
    deadline: Instant,
    /// Insertion order; breaks ties between equal deadlines.
    seq: u64,
    action: ReactorTask,
}

impl DeadlineAction {
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Run the action.
    pub fn fire(self, cx: &mut ReactorContext<'_>) {
        (self.action)(cx)
    }
}

impl PartialEq for DeadlineAction {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for DeadlineAction {}

impl PartialOrd for DeadlineAction {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DeadlineAction {
    fn cmp(&self, other: &Self) -> Ordering {
        self.deadline
            .cmp(&other.deadline)
            .then(self.seq.cmp(&other.seq))
    }
}

impl fmt::Debug for DeadlineAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeadlineAction")
            .field("deadline", &self.deadline)
            .field("seq", &self.seq)
            .finish_non_exhaustive()
    }
}

/// Deadline actions ordered by expiry.
#[derive(Default)]
pub struct DeadlineQueue {
    queue: UpdateablePriorityQueue<DeadlineAction>,
    next_seq: u64,
}

impl DeadlineQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `action` to run at `deadline`.
    pub fn schedule<F>(&mut self, deadline: Instant, action: F) -> DeadlineRef
    where
        F: FnOnce(&mut ReactorContext<'_>) + Send + 'static,
    {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.add(DeadlineAction {
            deadline,
            seq,
            action: Box::new(action),
        })
    }

    /// Schedule `action` to run `delay` from now.
    pub fn schedule_after<F>(&mut self, delay: Duration, action: F) -> DeadlineRef
    where
        F: FnOnce(&mut ReactorContext<'_>) + Send + 'static,
    {
        self.schedule(Instant::now() + delay, action)
    }

    /// Cancel a pending action. Returns `false` if it already fired or was
    /// cancelled.
    pub fn cancel(&mut self, elem: DeadlineRef) -> bool {
        self.queue.remove(elem).is_some()
    }

    /// Move a pending action to a new deadline.
    pub fn reschedule(&mut self, elem: DeadlineRef, deadline: Instant) -> bool {
        self.queue
            .update(elem, |action| action.deadline = deadline)
            .is_some()
    }

    pub fn is_pending(&self, elem: DeadlineRef) -> bool {
        self.queue.contains(elem)
    }

    /// The earliest pending deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.queue.peek().map(DeadlineAction::deadline)
    }

    /// Remove and return every action due at `now`, earliest first.
    pub fn expire(&mut self, now: Instant) -> Vec<DeadlineAction> {
        self.expire_scheduled_before(now, u64::MAX)
    }

    /// Marks the actions scheduled so far; see [`expire_scheduled_before`].
    ///
    /// [`expire_scheduled_before`]: Self::expire_scheduled_before
    pub fn mark(&self) -> u64 {
        self.next_seq
    }

    /// Like [`expire`](Self::expire), but stops at the first due action
    /// scheduled after `mark` was taken. It stays queued for a later call.
    pub fn expire_scheduled_before(&mut self, now: Instant, mark: u64) -> Vec<DeadlineAction> {
        let mut due = Vec::new();
        while self
            .queue
            .peek()
            .is_some_and(|action| action.deadline <= now && action.seq < mark)
        {
            if let Some(action) = self.queue.poll() {
                due.push(action);
            }
        }
        due
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Drop every pending action without running it.
    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

impl fmt::Debug for DeadlineQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeadlineQueue")
            .field("pending", &self.queue.len())
            .field("next_deadline", &self.next_deadline())
            .finish()
    }
}
