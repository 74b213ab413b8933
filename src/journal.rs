//! Async facade over a [`BlockingReader`].
//!
//! Every reader call is offloaded to the executor and serialized through
//! one lock. At most one bridge iteration is live per journal: starting a
//! new one closes the previous one first, and the new one picks up at the
//! first entry the previous one did not deliver.

use std::fmt;
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::stream::{self, Stream};

use crate::bridge::{BridgeQueue, BridgeState, BridgeStats, CloseSignal};
use crate::config::{InvalidationPolicy, JournalConfig};
use crate::entry::{BootId, Cursor, Entry, MessageId};
use crate::executor::Executor;
use crate::readiness::ReadinessWaiter;
use crate::reader::{
    BlockingReader, OpenMode, OpenTarget, ReaderStatus, ReadinessEvent, Rule, SharedReader,
};
use crate::{Error, Result};

pub struct AsyncJournal<R> {
    reader: SharedReader<R>,
    executor: Executor,
    config: JournalConfig,
    waiter: ReadinessWaiter,
    target: Mutex<Option<OpenTarget>>,
    current: Mutex<Option<Iteration>>,
}

/// The live bridge iteration and its read-ahead bookkeeping.
struct Iteration {
    bridge: Arc<BridgeQueue<Entry>>,
    progress: Arc<Mutex<Progress>>,
}

impl<R: BlockingReader> AsyncJournal<R> {
    /// Default configuration on the current runtime's blocking pool.
    pub fn new(reader: R) -> Result<Self> {
        Self::with_executor(reader, Executor::current()?, JournalConfig::default())
    }

    /// Builds the executor the configuration asks for.
    pub fn with_config(reader: R, config: JournalConfig) -> Result<Self> {
        config.validate()?;
        let executor = Executor::from_kind(&config.executor)?;
        Ok(Self::assemble(reader, executor, config))
    }

    pub fn with_executor(reader: R, executor: Executor, config: JournalConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::assemble(reader, executor, config))
    }

    fn assemble(reader: R, executor: Executor, config: JournalConfig) -> Self {
        Self {
            reader: SharedReader::new(reader),
            executor,
            config,
            waiter: ReadinessWaiter::new(),
            target: Mutex::new(None),
            current: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &JournalConfig {
        &self.config
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    async fn call<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut R) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let reader = self.reader.clone();
        self.executor.run(move || reader.with(f)).await
    }

    /// A call that moves the read position. Once it has run, the current
    /// iteration's read-ahead no longer decides where a successor starts.
    async fn reposition<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut R) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let progress = self.current_progress()?;
        self.call(move |r| {
            let out = f(r)?;
            if let Some(progress) = progress {
                lock_progress(&progress)?.repositioned = true;
            }
            Ok(out)
        })
        .await
    }

    fn current_progress(&self) -> Result<Option<Arc<Mutex<Progress>>>> {
        let current = self
            .current
            .lock()
            .map_err(|_| Error::Poisoned("current iteration"))?;
        Ok(current.as_ref().map(|it| Arc::clone(&it.progress)))
    }

    pub async fn open(&self, mode: OpenMode) -> Result<()> {
        self.open_with(OpenTarget::Mode(mode)).await
    }

    pub async fn open_directory(&self, path: impl Into<PathBuf>) -> Result<()> {
        self.open_with(OpenTarget::Directory(path.into())).await
    }

    pub async fn open_files<I, P>(&self, paths: I) -> Result<()>
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        let paths = paths.into_iter().map(Into::into).collect();
        self.open_with(OpenTarget::Files(paths)).await
    }

    async fn open_with(&self, target: OpenTarget) -> Result<()> {
        let call_target = target.clone();
        self.reposition(move |r| apply_open(r, &call_target)).await?;
        log::debug!("journal opened: {target:?}");
        *self
            .target
            .lock()
            .map_err(|_| Error::Poisoned("open target"))? = Some(target);
        Ok(())
    }

    /// Opens the last target again, e.g. after `ReadinessEvent::Invalidated`.
    /// The read position is not restored.
    pub async fn reopen(&self) -> Result<()> {
        let target = self.open_target().ok_or(Error::NotOpen)?;
        log::info!("reopening journal: {target:?}");
        self.reposition(move |r| apply_open(r, &target)).await
    }

    pub fn open_target(&self) -> Option<OpenTarget> {
        self.target.lock().ok().and_then(|target| target.clone())
    }

    pub async fn seek_head(&self) -> Result<bool> {
        self.reposition(|r| r.seek_head()).await
    }

    pub async fn seek_tail(&self) -> Result<bool> {
        self.reposition(|r| r.seek_tail()).await
    }

    pub async fn seek_cursor(&self, cursor: Cursor) -> Result<bool> {
        self.reposition(move |r| r.seek_cursor(&cursor)).await
    }

    pub async fn seek_monotonic_usec(&self, boot_id: BootId, usec: u64) -> Result<bool> {
        self.reposition(move |r| r.seek_monotonic_usec(boot_id, usec)).await
    }

    pub async fn seek_realtime_usec(&self, usec: u64) -> Result<bool> {
        self.reposition(move |r| r.seek_realtime_usec(usec)).await
    }

    /// Single-step read, outside any bridge iteration.
    pub async fn next(&self, skip: u64) -> Result<Option<Entry>> {
        self.reposition(move |r| r.next_entry(skip)).await
    }

    pub async fn previous(&self, skip: u64) -> Result<Option<Entry>> {
        self.reposition(move |r| r.previous_entry(skip)).await
    }

    pub async fn skip_next(&self, skip: u64) -> Result<u64> {
        self.reposition(move |r| r.skip_next(skip)).await
    }

    pub async fn skip_previous(&self, skip: u64) -> Result<u64> {
        self.reposition(move |r| r.skip_previous(skip)).await
    }

    pub async fn add_filter(&self, rule: Rule) -> Result<()> {
        self.call(move |r| r.add_filter(&rule)).await
    }

    pub async fn clear_filter(&self) -> Result<()> {
        self.call(|r| r.clear_filter()).await
    }

    pub async fn status(&self) -> Result<ReaderStatus> {
        self.call(|r| r.status()).await
    }

    /// Catalog text for the current entry.
    pub async fn catalog(&self) -> Result<String> {
        self.call(|r| r.catalog()).await
    }

    pub async fn catalog_for_message_id(&self, id: MessageId) -> Result<String> {
        self.call(move |r| r.catalog_for_message_id(id)).await
    }

    pub async fn data_threshold(&self) -> Result<usize> {
        self.call(|r| r.data_threshold()).await
    }

    pub async fn set_data_threshold(&self, bytes: usize) -> Result<()> {
        self.call(move |r| r.set_data_threshold(bytes)).await
    }

    pub async fn readiness_fd(&self) -> Result<RawFd> {
        self.call(|r| r.readiness_fd()).await
    }

    /// Waits for the next append or invalidation. Spurious wakes are
    /// absorbed. Unbounded; wrap in `tokio::time::timeout` to bound it.
    pub async fn wait(&self) -> Result<ReadinessEvent> {
        self.waiter.wait(&self.reader, &self.executor).await
    }

    /// A single classified wake-up, `NoOp` included.
    pub async fn wait_once(&self) -> Result<ReadinessEvent> {
        self.waiter.wait_once(&self.reader, &self.executor).await
    }

    /// Starts a bridge iteration, retiring the previous iteration if there
    /// is one.
    ///
    /// A fresh iteration starts at the current read position. One that
    /// replaces a retired iteration starts at the first entry the retired
    /// one pulled but never delivered, unless the position was moved
    /// through this facade in between.
    ///
    /// The stream ends when the reader runs out of entries; call `wait`
    /// and then `entries` again to pick up later appends.
    pub fn entries(&self) -> Result<Entries> {
        let mut current = self
            .current
            .lock()
            .map_err(|_| Error::Poisoned("current iteration"))?;
        let previous = current.take().map(|retired| {
            retired.bridge.close();
            log::debug!("retired previous journal iteration");
            retired.progress
        });

        let progress = Arc::new(Mutex::new(Progress {
            previous,
            ..Progress::default()
        }));
        let reader = self.reader.clone();
        let pulled = Arc::clone(&progress);
        let bridge = Arc::new(BridgeQueue::start(
            &self.executor,
            self.config.capacity,
            self.config.poll_interval(),
            move |close: &CloseSignal| {
                let mut guard = reader.lock()?;
                // Checked under the reader lock, so a retired producer cannot
                // interleave a pull with its successor's.
                if close.is_requested() {
                    return Ok(None);
                }
                let mut progress = lock_progress(&pulled)?;
                if !progress.started {
                    progress.started = true;
                    if let Some(resume) = progress.inherited_resume()? {
                        log::debug!("resuming after retired iteration: {resume:?}");
                        resume.apply(&mut *guard)?;
                    }
                }
                let entry = guard.next_entry(0)?;
                if let Some(entry) = &entry {
                    progress
                        .first_pulled
                        .get_or_insert_with(|| entry.cursor.clone());
                    progress.pulled += 1;
                }
                Ok(entry)
            },
        ));
        *current = Some(Iteration {
            bridge: Arc::clone(&bridge),
            progress: Arc::clone(&progress),
        });
        Ok(Entries { bridge, progress })
    }

    /// Follows the journal: drains what is there, waits for appends, drains
    /// again. Invalidation is handled per [`InvalidationPolicy`].
    pub fn follow(&self) -> impl Stream<Item = Result<Entry>> + '_ {
        let follow = Follow {
            journal: self,
            entries: None,
            last_cursor: None,
            done: false,
        };
        stream::unfold(follow, |mut follow| async move {
            let item = follow.advance().await?;
            Some((item, follow))
        })
    }

    pub fn iteration_state(&self) -> Option<BridgeState> {
        let current = self.current.lock().ok()?;
        current.as_ref().map(|it| it.bridge.state())
    }

    /// Closes the live iteration, if any.
    pub fn close(&self) {
        if let Ok(mut current) = self.current.lock() {
            if let Some(it) = current.take() {
                it.bridge.close();
            }
        }
    }
}

impl<R> Drop for AsyncJournal<R> {
    fn drop(&mut self) {
        let current = match self.current.get_mut() {
            Ok(current) => current.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(it) = current {
            it.bridge.close();
        }
    }
}

impl<R> fmt::Debug for AsyncJournal<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let target = self.target.lock().ok().and_then(|t| t.clone());
        let iteration = self
            .current
            .lock()
            .ok()
            .and_then(|c| c.as_ref().map(|it| it.bridge.state()));
        f.debug_struct("AsyncJournal")
            .field("target", &target)
            .field("iteration", &iteration)
            .finish()
    }
}

fn apply_open<R: BlockingReader>(reader: &mut R, target: &OpenTarget) -> Result<()> {
    match target {
        OpenTarget::Mode(mode) => reader.open(*mode),
        OpenTarget::Directory(path) => reader.open_directory(path),
        OpenTarget::Files(paths) => reader.open_files(paths),
    }
}

fn lock_progress(progress: &Mutex<Progress>) -> Result<MutexGuard<'_, Progress>> {
    progress
        .lock()
        .map_err(|_| Error::Poisoned("iteration progress"))
}

/// Where a successor iteration has to start.
#[derive(Clone, Debug)]
enum Resume {
    At(Cursor),
    After(Cursor),
}

impl Resume {
    fn apply<R: BlockingReader>(&self, reader: &mut R) -> Result<()> {
        let (cursor, skip) = match self {
            Resume::At(cursor) => (cursor, 0),
            Resume::After(cursor) => (cursor, 1),
        };
        if !reader.seek_cursor(cursor)? {
            log::warn!("cursor {cursor} gone, iteration continues from the reader position");
            return Ok(());
        }
        reader.skip_next(skip)?;
        Ok(())
    }
}

/// What one iteration pulled from the reader versus what it delivered.
#[derive(Default)]
struct Progress {
    /// Retired predecessor, consulted once at the first pull.
    previous: Option<Arc<Mutex<Progress>>>,
    started: bool,
    repositioned: bool,
    first_pulled: Option<Cursor>,
    last_delivered: Option<Cursor>,
    pulled: u64,
    delivered: u64,
}

impl Progress {
    fn inherited_resume(&mut self) -> Result<Option<Resume>> {
        let previous = self.previous.take();
        if self.repositioned {
            return Ok(None);
        }
        let Some(previous) = previous else {
            return Ok(None);
        };
        let mut previous = lock_progress(&previous)?;
        previous.resume_point()
    }

    /// Only meaningful once the iteration is closed and its producer can no
    /// longer pull.
    fn resume_point(&mut self) -> Result<Option<Resume>> {
        if self.repositioned {
            return Ok(None);
        }
        if !self.started {
            return self.inherited_resume();
        }
        if self.pulled == self.delivered {
            return Ok(None);
        }
        Ok(match &self.last_delivered {
            Some(cursor) => Some(Resume::After(cursor.clone())),
            None => self.first_pulled.clone().map(Resume::At),
        })
    }

    fn record_delivery(&mut self, entry: &Entry) {
        self.delivered += 1;
        self.last_delivered = Some(entry.cursor.clone());
    }
}

/// Consumer side of one bridge iteration. Dropping it closes the iteration.
pub struct Entries {
    bridge: Arc<BridgeQueue<Entry>>,
    progress: Arc<Mutex<Progress>>,
}

impl Entries {
    /// Next entry, `Ok(None)` at end of stream. Concurrent callers are
    /// served one at a time.
    pub async fn next(&self) -> Result<Option<Entry>> {
        let progress = &self.progress;
        self.bridge
            .next_with(|entry| {
                if let Ok(mut progress) = progress.lock() {
                    progress.record_delivery(entry);
                }
            })
            .await
    }

    pub fn close(&self) {
        self.bridge.close();
    }

    /// Resolves once the producer thread has stopped touching the reader.
    pub async fn terminated(&self) {
        self.bridge.terminated().await;
    }

    pub fn state(&self) -> BridgeState {
        self.bridge.state()
    }

    pub fn stats(&self) -> BridgeStats {
        self.bridge.stats()
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<Entry>> + Send + 'static {
        stream::unfold(self, |entries| async move {
            match entries.next().await {
                Ok(Some(entry)) => Some((Ok(entry), entries)),
                Ok(None) => None,
                Err(err) => Some((Err(err), entries)),
            }
        })
    }
}

impl Drop for Entries {
    fn drop(&mut self) {
        self.bridge.close();
    }
}

struct Follow<'a, R> {
    journal: &'a AsyncJournal<R>,
    entries: Option<Entries>,
    last_cursor: Option<Cursor>,
    done: bool,
}

impl<R: BlockingReader> Follow<'_, R> {
    async fn advance(&mut self) -> Option<Result<Entry>> {
        if self.done {
            return None;
        }
        loop {
            if self.entries.is_none() {
                match self.journal.entries() {
                    Ok(entries) => self.entries = Some(entries),
                    Err(err) => return self.fail(err),
                }
            }
            let next = match &self.entries {
                Some(entries) => entries.next().await,
                None => Ok(None),
            };
            match next {
                Ok(Some(entry)) => {
                    self.last_cursor = Some(entry.cursor.clone());
                    return Some(Ok(entry));
                }
                Ok(None) => self.entries = None,
                Err(err) => {
                    self.entries = None;
                    return self.fail(err);
                }
            }

            match self.journal.wait().await {
                Ok(ReadinessEvent::Append) | Ok(ReadinessEvent::NoOp) => {}
                Ok(ReadinessEvent::Invalidated) => match self.journal.config.invalidation {
                    InvalidationPolicy::Report => {
                        log::warn!("journal invalidated");
                        return self.fail(Error::Invalidated);
                    }
                    InvalidationPolicy::Reopen => {
                        if let Err(err) = self.reseek().await {
                            return self.fail(err);
                        }
                    }
                },
                Err(err) => return self.fail(err),
            }
        }
    }

    async fn reseek(&mut self) -> Result<()> {
        self.journal.reopen().await?;
        match self.last_cursor.clone() {
            Some(cursor) => {
                let resumed = self
                    .journal
                    .reposition(move |r| {
                        if !r.seek_cursor(&cursor)? {
                            return Ok(false);
                        }
                        // Step onto the cursor's entry, which was already
                        // delivered.
                        r.skip_next(1)?;
                        Ok(true)
                    })
                    .await?;
                if !resumed {
                    log::warn!("last cursor gone after invalidation, restarting from head");
                    self.journal.seek_head().await?;
                }
            }
            None => {
                self.journal.seek_head().await?;
            }
        }
        log::warn!("journal invalidated, reopened and resumed");
        Ok(())
    }

    fn fail(&mut self, err: Error) -> Option<Result<Entry>> {
        self.done = true;
        Some(Err(err))
    }
}
