//! Runs blocking calls off the async scheduler.
//!
//! An [`Executor`] either borrows the tokio blocking pool of a runtime or
//! owns a small pool of named std threads. Either way [`Executor::spawn`]
//! starts the call immediately and hands back a [`Completion`] the async
//! side can await; dropping the completion does not cancel the call.

use std::any::Any;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::{mpsc, Arc, Mutex};
use std::task::{Context, Poll};
use std::thread::{self, JoinHandle};

use tokio::runtime::Handle;
use tokio::sync::oneshot;

use crate::config::ExecutorKind;
use crate::{Error, Result};

/// Smallest dedicated pool. One thread can be parked by a bridge producer
/// waiting for buffer space, the other keeps serving facade calls.
pub const MIN_POOL_THREADS: usize = 2;

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Clone)]
pub enum Executor {
    /// The blocking pool of a tokio runtime.
    Runtime(Handle),
    /// A pool of threads owned by this executor.
    Pool(Arc<WorkerPool>),
}

impl Executor {
    /// Uses the blocking pool of the runtime we are currently inside.
    pub fn current() -> Result<Self> {
        Handle::try_current()
            .map(Executor::Runtime)
            .map_err(|_| Error::NoRuntime)
    }

    pub fn from_handle(handle: Handle) -> Self {
        Executor::Runtime(handle)
    }

    pub fn dedicated(threads: usize, name: &str) -> Result<Self> {
        Ok(Executor::Pool(Arc::new(WorkerPool::new(threads, name)?)))
    }

    pub fn from_kind(kind: &ExecutorKind) -> Result<Self> {
        match kind {
            ExecutorKind::Shared => Self::current(),
            ExecutorKind::Dedicated { threads } => Self::dedicated(*threads, "journal-worker"),
        }
    }

    pub fn spawn<F, T>(&self, f: F) -> Completion<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        match self {
            Executor::Runtime(handle) => Completion {
                inner: Inner::Task(handle.spawn_blocking(f)),
            },
            Executor::Pool(pool) => Completion {
                inner: Inner::Pool(pool.submit(f)),
            },
        }
    }

    pub async fn run<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.spawn(f).await
    }
}

/// Resolves to the result of a call started by [`Executor::spawn`].
pub struct Completion<T> {
    inner: Inner<T>,
}

enum Inner<T> {
    Task(tokio::task::JoinHandle<Result<T>>),
    Pool(oneshot::Receiver<Result<T>>),
}

impl<T> Future for Completion<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.inner {
            Inner::Task(handle) => match Pin::new(handle).poll(cx) {
                Poll::Ready(Ok(result)) => Poll::Ready(result),
                Poll::Ready(Err(err)) => {
                    let msg = if err.is_panic() {
                        panic_message(err.into_panic())
                    } else {
                        "blocking task cancelled".to_string()
                    };
                    Poll::Ready(Err(Error::Worker(msg)))
                }
                Poll::Pending => Poll::Pending,
            },
            Inner::Pool(rx) => match Pin::new(rx).poll(cx) {
                Poll::Ready(Ok(result)) => Poll::Ready(result),
                Poll::Ready(Err(_)) => {
                    Poll::Ready(Err(Error::Worker("worker pool shut down".to_string())))
                }
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

pub struct WorkerPool {
    name: String,
    jobs: Mutex<Option<mpsc::Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    fn new(threads: usize, name: &str) -> Result<Self> {
        let threads = threads.max(MIN_POOL_THREADS);
        let (tx, rx) = mpsc::channel::<Job>();
        let rx = Arc::new(Mutex::new(rx));
        let mut workers = Vec::with_capacity(threads);
        for worker_id in 0..threads {
            let rx = Arc::clone(&rx);
            let handle = thread::Builder::new()
                .name(format!("{name}-{worker_id}"))
                .spawn(move || loop {
                    let job = match rx.lock() {
                        Ok(guard) => guard.recv(),
                        Err(_) => break,
                    };
                    match job {
                        Ok(job) => job(),
                        Err(_) => break,
                    }
                })?;
            workers.push(handle);
        }
        log::debug!("started worker pool {name} with {threads} threads");
        Ok(Self {
            name: name.to_string(),
            jobs: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
        })
    }

    fn submit<F, T>(&self, f: F) -> oneshot::Receiver<Result<T>>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::new(move || {
            let result = catch_unwind(AssertUnwindSafe(f))
                .unwrap_or_else(|payload| Err(Error::Worker(panic_message(payload))));
            let _ = tx.send(result);
        });
        // A closed pool drops the job and with it the sender, which the
        // completion reports as a shutdown.
        if let Ok(guard) = self.jobs.lock() {
            if let Some(jobs) = guard.as_ref() {
                let _ = jobs.send(job);
            }
        }
        rx
    }

    pub fn threads(&self) -> usize {
        self.workers.lock().map(|w| w.len()).unwrap_or(0)
    }

    /// Stops accepting work and joins the threads once queued jobs finish.
    /// Blocks, so call it outside the async scheduler.
    pub fn shutdown(&self) {
        if let Ok(mut jobs) = self.jobs.lock() {
            jobs.take();
        }
        let workers = match self.workers.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(_) => return,
        };
        for handle in workers {
            let _ = handle.join();
        }
        log::debug!("worker pool {} shut down", self.name);
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Workers exit on their own once the queue is closed; joining here
        // could stall an async caller behind a long blocking call.
        if let Ok(mut jobs) = self.jobs.lock() {
            jobs.take();
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("panicked: {msg}")
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("panicked: {msg}")
    } else {
        "panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn runtime_executor_returns_call_result() {
        let executor = Executor::current().unwrap();
        let value = executor.run(|| Ok(21 * 2)).await.unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn pool_is_never_smaller_than_two_threads() {
        let executor = Executor::dedicated(1, "test-pool").unwrap();
        match &executor {
            Executor::Pool(pool) => assert_eq!(pool.threads(), MIN_POOL_THREADS),
            Executor::Runtime(_) => panic!("expected a dedicated pool"),
        }
    }

    #[tokio::test]
    async fn shut_down_pool_reports_worker_error() {
        let executor = Executor::dedicated(2, "test-pool").unwrap();
        if let Executor::Pool(pool) = &executor {
            pool.shutdown();
        }
        let err = executor.run(|| Ok(())).await.unwrap_err();
        assert!(matches!(err, Error::Worker(_)));
    }

    #[test]
    fn current_outside_runtime_fails() {
        assert!(matches!(Executor::current(), Err(Error::NoRuntime)));
    }
}
