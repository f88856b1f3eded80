//! Single-threaded reactor loop.
//!
//! The reactor owns the selector (`mio::Poll`), every key's interest set,
//! and the deadline queue. Nothing else mutates them: other threads talk
//! to the reactor only through the [`SelectorQueue`] plus a wake-up.
//!
//! Each pass of the loop:
//!
//! ```text
//! poll(timeout = next deadline)
//!   -> dispatch ready keys to their handlers (run / run_async)
//!   -> drain tasks queued by worker threads (interest re-arming, closes)
//!   -> fire expired deadline actions
//! ```
//!
//! Interest ops are tracked per key as [`Ops`]. mio delivers edge-triggered
//! readiness, so re-enabling an op re-registers the descriptor, which makes
//! the kernel re-evaluate readiness and report it again if still present.
//! A key with no ops left is deregistered until an op is enabled again.

mod deadline;
mod queue;

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::ops::BitOr;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use mio::event::Event;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use tracing::{debug, info, trace};

use crate::config::DEFAULT_EVENT_CAPACITY;
use crate::executor::Executor;

pub use deadline::{DeadlineAction, DeadlineQueue, DeadlineRef};
pub use queue::{InterestRequest, ReactorTask, SelectorQueue};

/// Token reserved for the cross-thread waker.
pub const WAKER_TOKEN: Token = Token(0);

const FIRST_KEY_TOKEN: usize = 1;

/// Interest ops of a key.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Ops(u8);

impl Ops {
    pub const NONE: Ops = Ops(0);
    pub const READ: Ops = Ops(1);
    pub const WRITE: Ops = Ops(1 << 1);
    pub const CONNECT: Ops = Ops(1 << 2);

    pub fn contains(self, other: Ops) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: Ops) -> bool {
        self.0 & other.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub fn with(self, other: Ops) -> Ops {
        Ops(self.0 | other.0)
    }

    #[must_use]
    pub fn without(self, other: Ops) -> Ops {
        Ops(self.0 & !other.0)
    }

    /// The mio interest for these ops; CONNECT and WRITE both wait for
    /// writability.
    fn interest(self) -> Option<Interest> {
        let read = self.contains(Ops::READ);
        let write = self.intersects(Ops::WRITE.with(Ops::CONNECT));
        match (read, write) {
            (true, true) => Some(Interest::READABLE.add(Interest::WRITABLE)),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

impl BitOr for Ops {
    type Output = Ops;

    fn bitor(self, rhs: Ops) -> Ops {
        self.with(rhs)
    }
}

impl fmt::Debug for Ops {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("NONE");
        }
        let names = [(Ops::READ, "READ"), (Ops::WRITE, "WRITE"), (Ops::CONNECT, "CONNECT")];
        let mut first = true;
        for (op, name) in names {
            if self.contains(op) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

/// Handler attached to a key.
///
/// Handlers are invoked on the reactor thread only. A handler that can
/// run asynchronously is expected to hand blocking work to the executor
/// from `run_async` and return immediately.
pub trait EventHandler: Send {
    fn can_run_async(&self) -> bool {
        false
    }

    /// Handle readiness synchronously.
    fn run(&mut self, cx: &mut ReactorContext<'_>, event: &Event) -> io::Result<()>;

    /// Handle readiness by dispatching work elsewhere.
    fn run_async(&mut self, cx: &mut ReactorContext<'_>, event: &Event) -> io::Result<()> {
        self.run(cx, event)
    }

    /// Release resources. Called when `run`/`run_async` fails and when the
    /// reactor shuts down.
    fn close(&mut self, cx: &mut ReactorContext<'_>);
}

/// Registration state of one key.
struct Key {
    fd: RawFd,
    ops: Ops,
    registered: bool,
    /// `None` while the handler is being dispatched.
    handler: Option<Box<dyn EventHandler>>,
    cancelled: bool,
}

/// Reactor state lent to handlers, selector tasks and deadline actions.
pub struct ReactorContext<'r> {
    registry: &'r Registry,
    keys: &'r mut HashMap<Token, Key>,
    next_token: &'r mut usize,
    deadlines: &'r mut DeadlineQueue,
    executor: &'r Arc<dyn Executor>,
    queue: &'r SelectorQueue,
}

impl<'r> ReactorContext<'r> {
    /// Allocate a token. Tokens are never reused.
    pub fn next_token(&mut self) -> Token {
        let token = Token(*self.next_token);
        *self.next_token += 1;
        token
    }

    /// Attach `handler` to the descriptor `fd` under `token` with the
    /// given ops. The descriptor must stay open until the key is cancelled.
    pub fn register(
        &mut self,
        token: Token,
        fd: RawFd,
        ops: Ops,
        handler: Box<dyn EventHandler>,
    ) -> io::Result<()> {
        let mut key = Key {
            fd,
            ops: Ops::NONE,
            registered: false,
            handler: Some(handler),
            cancelled: false,
        };
        apply(self.registry, token, &mut key, ops)?;
        self.keys.insert(token, key);
        trace!(token = token.0, ops = ?ops, "Key registered");
        Ok(())
    }

    /// Current ops of `token`, if the key is live.
    pub fn interest(&self, token: Token) -> Option<Ops> {
        self.keys
            .get(&token)
            .filter(|key| !key.cancelled)
            .map(|key| key.ops)
    }

    pub fn is_registered(&self, token: Token) -> bool {
        self.interest(token).is_some()
    }

    /// Number of live keys.
    pub fn key_count(&self) -> usize {
        self.keys.values().filter(|key| !key.cancelled).count()
    }

    /// Replace the ops of `token`. Unknown or cancelled keys are ignored.
    pub fn set_interest(&mut self, token: Token, ops: Ops) -> io::Result<()> {
        match self.keys.get_mut(&token) {
            Some(key) if !key.cancelled => apply(self.registry, token, key, ops),
            _ => Ok(()),
        }
    }

    /// Add `ops` to `token`, re-arming readiness reporting.
    pub fn enable(&mut self, token: Token, ops: Ops) -> io::Result<()> {
        match self.interest(token) {
            Some(current) => self.set_interest(token, current.with(ops)),
            None => Ok(()),
        }
    }

    /// Remove `ops` from `token`.
    pub fn disable(&mut self, token: Token, ops: Ops) -> io::Result<()> {
        match self.interest(token) {
            Some(current) if current.intersects(ops) => {
                self.set_interest(token, current.without(ops))
            }
            _ => Ok(()),
        }
    }

    /// Deregister and drop the key. Returns `false` if it was already gone.
    pub fn cancel(&mut self, token: Token) -> bool {
        let Some(key) = self.keys.get_mut(&token) else {
            return false;
        };
        if key.cancelled {
            return false;
        }
        if key.registered {
            if let Err(e) = self.registry.deregister(&mut SourceFd(&key.fd)) {
                debug!(token = token.0, error = %e, "Deregister failed");
            }
            key.registered = false;
        }
        if key.handler.is_some() {
            self.keys.remove(&token);
        } else {
            // Being dispatched; the reactor drops it when the call returns.
            key.cancelled = true;
        }
        trace!(token = token.0, "Key cancelled");
        true
    }

    pub fn deadlines(&mut self) -> &mut DeadlineQueue {
        &mut *self.deadlines
    }

    pub fn executor(&self) -> &Arc<dyn Executor> {
        self.executor
    }

    pub fn queue(&self) -> &SelectorQueue {
        self.queue
    }
}

fn apply(registry: &Registry, token: Token, key: &mut Key, ops: Ops) -> io::Result<()> {
    key.ops = ops;
    let mut source = SourceFd(&key.fd);
    match (ops.interest(), key.registered) {
        (Some(interest), false) => {
            registry.register(&mut source, token, interest)?;
            key.registered = true;
        }
        (Some(interest), true) => registry.reregister(&mut source, token, interest)?,
        (None, true) => {
            registry.deregister(&mut source)?;
            key.registered = false;
        }
        (None, false) => {}
    }
    Ok(())
}

/// Thread-safe handle for submitting work to, and stopping, a reactor.
#[derive(Clone)]
pub struct ReactorHandle {
    queue: SelectorQueue,
    shutdown: Arc<AtomicBool>,
}

impl ReactorHandle {
    /// Run `task` on the reactor thread.
    pub fn submit<F>(&self, task: F)
    where
        F: FnOnce(&mut ReactorContext<'_>) + Send + 'static,
    {
        self.queue.submit(task);
    }

    /// Ask the reactor to close every key and return from `run`.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.queue.wake();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

/// The event loop.
pub struct Reactor {
    poll: Poll,
    keys: HashMap<Token, Key>,
    next_token: usize,
    deadlines: DeadlineQueue,
    executor: Arc<dyn Executor>,
    queue: SelectorQueue,
    tasks: Receiver<ReactorTask>,
    shutdown: Arc<AtomicBool>,
    event_capacity: usize,
}

impl Reactor {
    pub fn new(executor: Arc<dyn Executor>) -> io::Result<Self> {
        Self::with_event_capacity(executor, DEFAULT_EVENT_CAPACITY)
    }

    pub fn with_event_capacity(
        executor: Arc<dyn Executor>,
        event_capacity: usize,
    ) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let (tx, tasks) = mpsc::channel();

        Ok(Self {
            poll,
            keys: HashMap::new(),
            next_token: FIRST_KEY_TOKEN,
            deadlines: DeadlineQueue::new(),
            executor,
            queue: SelectorQueue::new(tx, waker),
            tasks,
            shutdown: Arc::new(AtomicBool::new(false)),
            event_capacity: event_capacity.max(1),
        })
    }

    pub fn handle(&self) -> ReactorHandle {
        ReactorHandle {
            queue: self.queue.clone(),
            shutdown: Arc::clone(&self.shutdown),
        }
    }

    /// Number of live keys.
    pub fn key_count(&self) -> usize {
        self.keys.values().filter(|key| !key.cancelled).count()
    }

    /// Run `f` against the reactor state from the owning thread (used to
    /// register listeners before the loop starts).
    pub fn with_context<R>(&mut self, f: impl FnOnce(&mut ReactorContext<'_>) -> R) -> R {
        let mut cx = self.context();
        f(&mut cx)
    }

    /// Loop until [`ReactorHandle::shutdown`] is called.
    pub fn run(&mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(self.event_capacity);
        info!(event_capacity = self.event_capacity, "Reactor started");

        while !self.shutdown.load(Ordering::Acquire) {
            let timeout = self
                .deadlines
                .next_deadline()
                .map(|deadline| deadline.saturating_duration_since(Instant::now()));
            self.run_once(&mut events, timeout)?;
        }

        self.close_all();
        info!("Reactor stopped");
        Ok(())
    }

    /// Run the loop on a dedicated thread.
    pub fn spawn(mut self) -> io::Result<JoinHandle<io::Result<()>>> {
        thread::Builder::new()
            .name("relay-reactor".to_string())
            .spawn(move || self.run())
    }

    /// One selector pass: poll, dispatch, drain queued tasks, fire
    /// expired deadlines.
    ///
    /// Deadlines scheduled by handlers or tasks during the pass are not
    /// fired before the next pass, even when already due.
    pub fn run_once(&mut self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        match self.poll.poll(events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }
        let mark = self.deadlines.mark();

        for event in events.iter() {
            if event.token() == WAKER_TOKEN {
                continue;
            }
            self.dispatch(event);
        }

        self.run_selector_tasks();
        self.fire_expired(Instant::now(), mark);
        Ok(())
    }

    fn context(&mut self) -> ReactorContext<'_> {
        ReactorContext {
            registry: self.poll.registry(),
            keys: &mut self.keys,
            next_token: &mut self.next_token,
            deadlines: &mut self.deadlines,
            executor: &self.executor,
            queue: &self.queue,
        }
    }

    fn dispatch(&mut self, event: &Event) {
        let token = event.token();
        let Some(mut handler) = self
            .keys
            .get_mut(&token)
            .filter(|key| !key.cancelled)
            .and_then(|key| key.handler.take())
        else {
            return;
        };

        let mut cx = self.context();
        let result = if handler.can_run_async() {
            handler.run_async(&mut cx, event)
        } else {
            handler.run(&mut cx, event)
        };
        if let Err(e) = result {
            debug!(token = token.0, error = %e, "Handler failed");
            handler.close(&mut cx);
            cx.cancel(token);
        }

        self.restore(token, handler);
    }

    fn restore(&mut self, token: Token, handler: Box<dyn EventHandler>) {
        match self.keys.get_mut(&token) {
            Some(key) if !key.cancelled => key.handler = Some(handler),
            Some(_) => {
                self.keys.remove(&token);
            }
            None => {}
        }
    }

    fn run_selector_tasks(&mut self) {
        let tasks: Vec<ReactorTask> = self.tasks.try_iter().collect();
        if tasks.is_empty() {
            return;
        }
        trace!(count = tasks.len(), "Running selector tasks");
        let mut cx = self.context();
        for task in tasks {
            task(&mut cx);
        }
    }

    fn fire_expired(&mut self, now: Instant, mark: u64) {
        let due = self.deadlines.expire_scheduled_before(now, mark);
        if due.is_empty() {
            return;
        }
        trace!(count = due.len(), "Firing deadline actions");
        let mut cx = self.context();
        for action in due {
            action.fire(&mut cx);
        }
    }

    fn close_all(&mut self) {
        let tokens: Vec<Token> = self.keys.keys().copied().collect();
        for token in tokens {
            let Some(mut handler) = self.keys.get_mut(&token).and_then(|key| key.handler.take())
            else {
                continue;
            };
            let mut cx = self.context();
            handler.close(&mut cx);
            cx.cancel(token);
            self.restore(token, handler);
        }
        self.keys.clear();
        self.deadlines.clear();
    }
}

impl fmt::Debug for Reactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reactor")
            .field("keys", &self.key_count())
            .field("deadlines", &self.deadlines)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::net::{TcpListener as StdListener, TcpStream as StdStream};

    use parking_lot::Mutex;

    use crate::executor::InlineExecutor;

    fn reactor() -> Reactor {
        Reactor::new(Arc::new(InlineExecutor)).unwrap()
    }

    /// Connected pair: (mio side under test, std peer).
    fn socket_pair() -> (mio::net::TcpStream, StdStream) {
        let listener = StdListener::bind("127.0.0.1:0").unwrap();
        let peer = StdStream::connect(listener.local_addr().unwrap()).unwrap();
        let (accepted, _) = listener.accept().unwrap();
        accepted.set_nonblocking(true).unwrap();
        (mio::net::TcpStream::from_std(accepted), peer)
    }

    /// Records readable events and withdraws READ after each one.
    struct Recorder {
        token: Token,
        seen: Arc<Mutex<Vec<Token>>>,
        closed: Arc<AtomicBool>,
        fail: bool,
    }

    impl EventHandler for Recorder {
        fn run(&mut self, cx: &mut ReactorContext<'_>, event: &Event) -> io::Result<()> {
            if event.is_readable() {
                self.seen.lock().push(self.token);
                cx.disable(self.token, Ops::READ)?;
            }
            if self.fail {
                return Err(io::Error::other("boom"));
            }
            Ok(())
        }

        fn close(&mut self, _cx: &mut ReactorContext<'_>) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn register_recorder(
        reactor: &mut Reactor,
        stream: &mio::net::TcpStream,
        fail: bool,
    ) -> (Token, Arc<Mutex<Vec<Token>>>, Arc<AtomicBool>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let token = reactor.with_context(|cx| {
            let token = cx.next_token();
            let handler = Recorder {
                token,
                seen: Arc::clone(&seen),
                closed: Arc::clone(&closed),
                fail,
            };
            cx.register(token, stream.as_raw_fd(), Ops::READ, Box::new(handler))
                .unwrap();
            token
        });
        (token, seen, closed)
    }

    const TICK: Option<Duration> = Some(Duration::from_millis(50));

    #[test]
    fn test_ops_mapping() {
        assert_eq!(Ops::NONE.interest(), None);
        assert_eq!(Ops::READ.interest(), Some(Interest::READABLE));
        assert_eq!(Ops::CONNECT.interest(), Some(Interest::WRITABLE));
        assert_eq!(
            (Ops::READ | Ops::WRITE).interest(),
            Some(Interest::READABLE | Interest::WRITABLE)
        );
        assert!((Ops::READ | Ops::CONNECT).contains(Ops::CONNECT));
        assert_eq!((Ops::READ | Ops::WRITE).without(Ops::READ), Ops::WRITE);
        assert_eq!(format!("{:?}", Ops::READ | Ops::CONNECT), "READ|CONNECT");
    }

    #[test]
    fn test_withdrawn_interest_is_rearmed_by_task() {
        let mut reactor = reactor();
        let mut events = Events::with_capacity(16);
        let (stream, mut peer) = socket_pair();
        let (token, seen, _) = register_recorder(&mut reactor, &stream, false);

        peer.write_all(b"ping").unwrap();
        reactor.run_once(&mut events, Some(Duration::from_secs(5))).unwrap();
        assert_eq!(seen.lock().len(), 1);
        reactor.with_context(|cx| assert_eq!(cx.interest(token), Some(Ops::NONE)));

        // Data is still unread, but READ is withdrawn: no further dispatch.
        reactor.run_once(&mut events, TICK).unwrap();
        assert_eq!(seen.lock().len(), 1);

        let handle = reactor.handle();
        handle.submit(move |cx| cx.enable(token, Ops::READ).unwrap());
        for _ in 0..3 {
            reactor.run_once(&mut events, TICK).unwrap();
        }
        assert_eq!(seen.lock().len(), 2);
    }

    #[test]
    fn test_failed_handler_is_closed_and_dropped() {
        let mut reactor = reactor();
        let mut events = Events::with_capacity(16);
        let (stream, mut peer) = socket_pair();
        let (token, _, closed) = register_recorder(&mut reactor, &stream, true);
        assert_eq!(reactor.key_count(), 1);

        peer.write_all(b"x").unwrap();
        reactor.run_once(&mut events, Some(Duration::from_secs(5))).unwrap();

        assert!(closed.load(Ordering::SeqCst));
        assert_eq!(reactor.key_count(), 0);
        reactor.with_context(|cx| {
            assert!(!cx.is_registered(token));
            assert!(!cx.cancel(token));
        });
    }

    #[test]
    fn test_stale_token_requests_are_ignored() {
        let mut reactor = reactor();
        reactor.with_context(|cx| {
            let token = cx.next_token();
            assert!(cx.enable(token, Ops::READ).is_ok());
            assert!(cx.disable(token, Ops::READ).is_ok());
            assert!(!cx.cancel(token));
            assert_ne!(cx.next_token(), token);
        });
    }

    #[test]
    fn test_deadlines_fire_in_order_and_cancelled_never_runs() {
        let mut reactor = reactor();
        let mut events = Events::with_capacity(16);
        let fired = Arc::new(Mutex::new(Vec::new()));

        let cancelled = reactor.with_context(|cx| {
            let base = Instant::now();
            let mut refs = Vec::new();
            for (label, delay) in [(3, 30), (1, 10), (2, 20), (4, 15)] {
                let fired = Arc::clone(&fired);
                refs.push(cx.deadlines().schedule(
                    base + Duration::from_millis(delay),
                    move |_| fired.lock().push(label),
                ));
            }
            let doomed = refs[3];
            assert!(cx.deadlines().cancel(doomed));
            doomed
        });

        let stop = Instant::now() + Duration::from_secs(5);
        while fired.lock().len() < 3 && Instant::now() < stop {
            reactor.run_once(&mut events, TICK).unwrap();
        }
        assert_eq!(*fired.lock(), vec![1, 2, 3]);
        reactor.with_context(|cx| assert!(!cx.deadlines().cancel(cancelled)));
    }

    #[test]
    fn test_deadline_scheduled_during_pass_fires_next_pass() {
        let mut reactor = reactor();
        let mut events = Events::with_capacity(16);
        let fired = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&fired);
        reactor.handle().submit(move |cx| {
            cx.deadlines()
                .schedule_after(Duration::ZERO, move |_| flag.store(true, Ordering::SeqCst));
        });
        reactor.run_once(&mut events, TICK).unwrap();
        assert!(!fired.load(Ordering::SeqCst));
        reactor.with_context(|cx| assert_eq!(cx.deadlines().len(), 1));

        reactor.run_once(&mut events, Some(Duration::ZERO)).unwrap();
        assert!(fired.load(Ordering::SeqCst));
        reactor.with_context(|cx| assert!(cx.deadlines().is_empty()));
    }

    #[test]
    fn test_shutdown_stops_spawned_reactor() {
        let reactor = reactor();
        let handle = reactor.handle();
        let thread = reactor.spawn().unwrap();

        let (tx, rx) = std::sync::mpsc::channel();
        handle.submit(move |cx| {
            tx.send(cx.next_token()).unwrap();
        });
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());

        handle.shutdown();
        assert!(handle.is_shutdown());
        thread.join().unwrap().unwrap();
    }

    #[test]
    fn test_shutdown_closes_handlers() {
        let mut reactor = reactor();
        let (stream, _peer) = socket_pair();
        let (_, _, closed) = register_recorder(&mut reactor, &stream, false);

        reactor.handle().shutdown();
        reactor.run().unwrap();
        assert!(closed.load(Ordering::SeqCst));
        assert_eq!(reactor.key_count(), 0);
    }
}
