//! Bounded bridge between a blocking producer thread and an async consumer.
//!
//! The producer runs on the [`Executor`] and repeatedly calls a pull
//! closure that may block natively. Pulled items go into a FIFO of fixed
//! capacity; when it is full the producer parks on a condvar, waking at
//! least once per poll interval to look for a close request. The consumer
//! awaits a [`Notify`] and always re-checks the buffer after waking.
//!
//! Memory is bounded by the capacity regardless of how fast the producer
//! runs. Shutdown latency is bounded by the poll interval plus the length
//! of whatever native call the producer is inside when `close` arrives.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;

use crate::executor::Executor;
use crate::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BridgeState {
    /// Producer alive, no close requested.
    Running,
    /// Close requested, producer has not exited yet.
    Closing,
    /// Producer exited.
    Closed,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BridgeStats {
    pub capacity: usize,
    pub buffered: usize,
    pub peak_buffered: usize,
    pub produced: u64,
    pub delivered: u64,
}

/// Set once when the bridge is closed. Pull closures receive it so they can
/// re-check it while holding whatever lock guards their source.
#[derive(Debug, Default)]
pub struct CloseSignal(AtomicBool);

impl CloseSignal {
    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn request(&self) -> bool {
        !self.0.swap(true, Ordering::AcqRel)
    }
}

struct State<T> {
    buffer: VecDeque<T>,
    phase: BridgeState,
    failure: Option<Error>,
    peak: usize,
    produced: u64,
    delivered: u64,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    space: Condvar,
    items: Notify,
    exited: Notify,
    close: CloseSignal,
    capacity: usize,
    poll_interval: Duration,
}

impl<T> Shared<T> {
    fn lock_state(&self) -> Result<MutexGuard<'_, State<T>>> {
        self.state.lock().map_err(|_| Error::Poisoned("bridge buffer"))
    }

    /// Blocks until there is room or the bridge is closed. Returns false if
    /// the item was dropped because of a close.
    fn push(&self, item: T) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        loop {
            if self.close.is_requested() {
                return false;
            }
            if state.buffer.len() < self.capacity {
                break;
            }
            state = match self.space.wait_timeout(state, self.poll_interval) {
                Ok((guard, _)) => guard,
                Err(_) => return false,
            };
        }
        state.buffer.push_back(item);
        state.produced += 1;
        state.peak = state.peak.max(state.buffer.len());
        drop(state);
        self.items.notify_one();
        true
    }

    fn finish(&self, outcome: Result<()>) {
        if let Ok(mut state) = self.state.lock() {
            state.phase = BridgeState::Closed;
            match outcome {
                Ok(()) => log::debug!("bridge producer finished after {} items", state.produced),
                Err(err) if self.close.is_requested() => {
                    log::debug!("bridge producer error after close ignored: {err}");
                }
                Err(err) => {
                    log::warn!("bridge producer failed: {err}");
                    state.failure = Some(err);
                }
            }
        }
        self.items.notify_one();
        self.exited.notify_waiters();
    }
}

/// Reports the producer's exit even if the pull closure panics or the
/// executor drops the job unrun, so a waiting consumer always wakes.
struct ExitGuard<T> {
    shared: Arc<Shared<T>>,
    started: bool,
    outcome: Option<Result<()>>,
}

impl<T> Drop for ExitGuard<T> {
    fn drop(&mut self) {
        let outcome = self.outcome.take().unwrap_or_else(|| {
            let msg = if self.started {
                "bridge producer panicked"
            } else {
                "bridge producer never started"
            };
            Err(Error::Worker(msg.to_string()))
        });
        self.shared.finish(outcome);
    }
}

pub struct BridgeQueue<T> {
    shared: Arc<Shared<T>>,
    consumer: tokio::sync::Mutex<()>,
}

impl<T: Send + 'static> BridgeQueue<T> {
    /// Creates the buffer and starts the producer on `executor` right away.
    pub fn start<F>(executor: &Executor, capacity: usize, poll_interval: Duration, pull: F) -> Self
    where
        F: FnMut(&CloseSignal) -> Result<Option<T>> + Send + 'static,
    {
        let capacity = capacity.max(1);
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                buffer: VecDeque::with_capacity(capacity),
                phase: BridgeState::Running,
                failure: None,
                peak: 0,
                produced: 0,
                delivered: 0,
            }),
            space: Condvar::new(),
            items: Notify::new(),
            exited: Notify::new(),
            close: CloseSignal::default(),
            capacity,
            poll_interval,
        });

        let guard = ExitGuard {
            shared: Arc::clone(&shared),
            started: false,
            outcome: None,
        };
        // The completion is detached: the producer reports through `Shared`,
        // and a job dropped without running drops the guard with it.
        let _ = executor.spawn(move || {
            produce(guard, pull);
            Ok(())
        });

        Self {
            shared,
            consumer: tokio::sync::Mutex::new(()),
        }
    }
}

fn produce<T, F>(mut guard: ExitGuard<T>, mut pull: F)
where
    F: FnMut(&CloseSignal) -> Result<Option<T>>,
{
    guard.started = true;
    let shared = Arc::clone(&guard.shared);
    let outcome = loop {
        if shared.close.is_requested() {
            break Ok(());
        }
        match pull(&shared.close) {
            Ok(Some(item)) => {
                if !shared.push(item) {
                    break Ok(());
                }
            }
            Ok(None) => break Ok(()),
            Err(err) => break Err(err),
        }
    };
    guard.outcome = Some(outcome);
}

impl<T> BridgeQueue<T> {
    /// Next item in production order, `Ok(None)` at end of stream.
    ///
    /// End of stream is reported only once the buffer is drained and the
    /// producer has exited, or immediately after `close`. A producer error
    /// is returned once, after every item buffered before it.
    pub async fn next(&self) -> Result<Option<T>> {
        self.next_with(|_| {}).await
    }

    /// Like [`next`](Self::next), with `on_pop` run on the item while the
    /// buffer is still locked. A `close` that returns before or after the
    /// pop therefore sees its effects in full.
    pub async fn next_with<F>(&self, mut on_pop: F) -> Result<Option<T>>
    where
        F: FnMut(&T),
    {
        let _consumer = self.consumer.lock().await;
        loop {
            let notified = self.shared.items.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.shared.lock_state()?;
                if let Some(item) = state.buffer.pop_front() {
                    on_pop(&item);
                    state.delivered += 1;
                    drop(state);
                    self.shared.space.notify_one();
                    return Ok(Some(item));
                }
                if self.shared.close.is_requested() {
                    return Ok(None);
                }
                if state.phase == BridgeState::Closed {
                    return match state.failure.take() {
                        Some(err) => Err(err),
                        None => Ok(None),
                    };
                }
            }
            notified.await;
        }
    }

    /// Requests shutdown. Safe to call repeatedly and from `Drop`.
    /// Undelivered items are discarded.
    pub fn close(&self) {
        if !self.shared.close.request() {
            return;
        }
        if let Ok(mut state) = self.shared.state.lock() {
            let dropped = state.buffer.len();
            state.buffer.clear();
            if state.phase == BridgeState::Running {
                state.phase = BridgeState::Closing;
            }
            log::debug!("bridge closed with {dropped} undelivered items");
        }
        self.shared.space.notify_all();
        self.shared.items.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.close.is_requested()
    }

    pub fn state(&self) -> BridgeState {
        self.shared
            .state
            .lock()
            .map(|state| state.phase)
            .unwrap_or(BridgeState::Closed)
    }

    /// Resolves once the producer has exited.
    pub async fn terminated(&self) {
        loop {
            let notified = self.shared.exited.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.state() == BridgeState::Closed {
                return;
            }
            notified.await;
        }
    }

    pub fn stats(&self) -> BridgeStats {
        match self.shared.state.lock() {
            Ok(state) => BridgeStats {
                capacity: self.shared.capacity,
                buffered: state.buffer.len(),
                peak_buffered: state.peak,
                produced: state.produced,
                delivered: state.delivered,
            },
            Err(_) => BridgeStats {
                capacity: self.shared.capacity,
                ..BridgeStats::default()
            },
        }
    }
}

impl<T> Drop for BridgeQueue<T> {
    fn drop(&mut self) {
        self.close();
    }
}
