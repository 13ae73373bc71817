//! Worker pool for load, mesh, object and pathfinding jobs
//!
//! Jobs run on a named rayon pool. Each spawned job hands back a [`JobHandle`],
//! a future over a oneshot channel: the main thread can poll it once per tick,
//! block on it from plain threads, or `.await` it inside a tokio runtime.

use std::any::Any;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::core::{Error, Result};

/// Bounded pool of background workers
pub struct WorkerPool {
    pool: rayon::ThreadPool,
    in_flight: Arc<AtomicUsize>,
    completed: Arc<AtomicUsize>,
}

/// Decrements the in-flight counter when a job finishes, even by panicking
struct InFlight {
    in_flight: Arc<AtomicUsize>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

impl WorkerPool {
    /// Build a pool with `threads` workers (0 = available parallelism)
    pub fn new(threads: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("strata-worker-{}", i))
            .panic_handler(|payload| {
                log::error!("Worker job panicked: {}", panic_message(payload.as_ref()));
            })
            .build()
            .map_err(|e| Error::WorkerPool(e.to_string()))?;

        log::debug!("Worker pool started with {} threads", pool.current_num_threads());

        Ok(Self {
            pool,
            in_flight: Arc::new(AtomicUsize::new(0)),
            completed: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Run `job` on a worker and return a handle to its result
    pub fn spawn<T, F>(&self, job: F) -> JobHandle<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let guard = self.enter();
        let completed = Arc::clone(&self.completed);

        self.pool.spawn(move || {
            let value = job();
            drop(guard);
            completed.fetch_add(1, Ordering::AcqRel);
            // Receiver may already be gone; the work is still done
            let _ = tx.send(value);
        });

        JobHandle { rx }
    }

    /// Run `job` on a worker with no handle. Results travel by other means.
    pub fn spawn_detached<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let guard = self.enter();
        let completed = Arc::clone(&self.completed);

        self.pool.spawn(move || {
            job();
            drop(guard);
            completed.fetch_add(1, Ordering::AcqRel);
        });
    }

    fn enter(&self) -> InFlight {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        InFlight {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    /// Jobs submitted and not yet finished
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Jobs that ran to completion without panicking
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::Acquire)
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("threads", &self.threads())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

/// Future result of a pool job
///
/// Resolves to `Err(Error::JobAborted)` if the job panicked.
#[derive(Debug)]
pub struct JobHandle<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> JobHandle<T> {
    /// Non-blocking check, suitable for once-per-tick polling.
    ///
    /// Returns `None` while the job runs. Once this yields `Some`, the handle
    /// is spent and should be dropped.
    pub fn poll_ready(&mut self) -> Option<Result<T>> {
        match self.rx.try_recv() {
            Ok(value) => Some(Ok(value)),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(Error::JobAborted)),
        }
    }

    /// Block the current thread until the job finishes.
    ///
    /// Must not be called from inside an async runtime; `.await` the handle there.
    pub fn wait(self) -> Result<T> {
        self.rx.blocking_recv().map_err(|_| Error::JobAborted)
    }
}

impl<T> Future for JobHandle<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.map_err(|_| Error::JobAborted))
    }
}
