//! Worker executors for socket I/O.
//!
//! The reactor never performs a read or write itself; it hands each one to
//! an [`Executor`]. Tasks are short (a single non-blocking syscall plus
//! buffer bookkeeping) but may run concurrently for different buffers.

use std::io;

use tokio::runtime::{Builder, Handle, Runtime};

/// A unit of work handed to a worker thread.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Default number of async worker threads in a [`WorkerPool`].
pub const DEFAULT_WORKER_THREADS: usize = 2;

/// Default cap on blocking threads running relay I/O tasks.
pub const DEFAULT_MAX_IO_THREADS: usize = 512;

/// Runs tasks off the reactor thread.
pub trait Executor: Send + Sync {
    fn execute(&self, task: Task);
}

/// Tasks go to the runtime's blocking pool.
impl Executor for Handle {
    fn execute(&self, task: Task) {
        // The JoinHandle is dropped; failures surface through the task itself.
        drop(self.spawn_blocking(task));
    }
}

/// Dedicated tokio runtime whose blocking pool performs relay I/O.
pub struct WorkerPool {
    runtime: Runtime,
}

impl WorkerPool {
    /// Build a pool with `worker_threads` async workers and up to
    /// `max_io_threads` threads for relay I/O.
    pub fn new(worker_threads: usize, max_io_threads: usize) -> io::Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(worker_threads.max(1))
            .max_blocking_threads(max_io_threads.max(1))
            .thread_name("relay-worker")
            .enable_all()
            .build()?;
        Ok(Self { runtime })
    }

    pub fn handle(&self) -> &Handle {
        self.runtime.handle()
    }

    /// Drive a future to completion on the pool (used by the binary to
    /// wait for a shutdown signal).
    pub fn block_on<F: std::future::Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }
}

impl Executor for WorkerPool {
    fn execute(&self, task: Task) {
        self.runtime.handle().execute(task);
    }
}

/// Runs every task on the calling thread.
#[cfg(test)]
pub(crate) struct InlineExecutor;

#[cfg(test)]
impl Executor for InlineExecutor {
    fn execute(&self, task: Task) {
        task()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_worker_pool_runs_tasks() {
        let pool = WorkerPool::new(1, 4).unwrap();
        let (tx, rx) = mpsc::channel();
        for i in 0..8 {
            let tx = tx.clone();
            pool.execute(Box::new(move || {
                tx.send(i).unwrap();
            }));
        }

        let mut seen: Vec<i32> = (0..8)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        seen.sort();
        assert_eq!(seen, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn test_worker_threads_are_named() {
        let pool = WorkerPool::new(1, 1).unwrap();
        let (tx, rx) = mpsc::channel();
        pool.execute(Box::new(move || {
            let name = std::thread::current().name().map(str::to_owned);
            tx.send(name).unwrap();
        }));
        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(name.as_deref(), Some("relay-worker"));
    }
}
