//! Waiting for the reader's readiness descriptor on the tokio reactor.
//!
//! The descriptor is registered only while a wait is in progress. The
//! classification that follows a wake-up drains the descriptor, so it is
//! kept until a caller has seen its result, even if the wait that started
//! it was cancelled.

use std::os::unix::io::{AsRawFd, RawFd};

use tokio::io::unix::AsyncFd;
use tokio::io::Interest;

use crate::executor::{Completion, Executor};
use crate::reader::{BlockingReader, ReadinessEvent, SharedReader};
use crate::{Error, Result};

/// The reader's descriptor, borrowed. Dropping it does not close the fd.
struct ReadinessFd(RawFd);

impl AsRawFd for ReadinessFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

/// Waits for the reader's descriptor to become readable, one caller at a
/// time, then asks the reader what happened.
#[derive(Default)]
pub struct ReadinessWaiter {
    /// Classification started by a wait that may have been cancelled.
    pending: tokio::sync::Mutex<Option<Completion<ReadinessEvent>>>,
}

impl ReadinessWaiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// One wake-up, classified. May return `NoOp`.
    ///
    /// The descriptor is registered with the reactor only for the duration
    /// of the wait and is deregistered on every exit path, including when
    /// this future is dropped. A classification already under way when the
    /// future is dropped is handed to the next caller instead of being lost.
    pub async fn wait_once<R: BlockingReader>(
        &self,
        reader: &SharedReader<R>,
        executor: &Executor,
    ) -> Result<ReadinessEvent> {
        let mut pending = self.pending.lock().await;

        let classify = match pending.take() {
            Some(classify) => {
                log::debug!("resuming classification of an earlier wake");
                classify
            }
            None => {
                let fd_reader = reader.clone();
                let fd = executor
                    .run(move || fd_reader.with(|r| r.readiness_fd()))
                    .await?;

                {
                    let registration =
                        AsyncFd::with_interest(ReadinessFd(fd), Interest::READABLE)
                            .map_err(Error::Register)?;
                    let _ready = registration.readable().await.map_err(Error::Register)?;
                }
                log::trace!("journal fd {fd} readable");

                let events_reader = reader.clone();
                executor.spawn(move || events_reader.with(|r| r.process_events()))
            }
        };

        let classify = pending.insert(classify);
        let event = classify.await;
        *pending = None;
        let event = event?;
        log::trace!("journal wake classified: {event:?}");
        Ok(event)
    }

    /// Waits until something other than a spurious wake happens.
    pub async fn wait<R: BlockingReader>(
        &self,
        reader: &SharedReader<R>,
        executor: &Executor,
    ) -> Result<ReadinessEvent> {
        loop {
            match self.wait_once(reader, executor).await? {
                ReadinessEvent::NoOp => log::debug!("spurious journal wake, waiting again"),
                event => return Ok(event),
            }
        }
    }
}
