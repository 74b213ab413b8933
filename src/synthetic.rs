//! Scriptable in-memory reader.
//!
//! Generates numbered entries on demand and exposes a real readiness
//! descriptor, so the bridge, the readiness waiter and the facade can be
//! driven without a journal on disk. [`SyntheticControl`] appends entries,
//! injects readiness events and failures, and counts calls. Every reader
//! call goes through a re-entrancy check that records overlapping calls.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::entry::{BootId, Cursor, Entry, MessageId};
use crate::reader::{BlockingReader, OpenMode, OpenTarget, ReaderStatus, ReadinessEvent, Rule};
use crate::{Error, Result};

const CURSOR_PREFIX: &str = "s=synthetic;i=";
const REALTIME_BASE_USEC: u64 = 1_700_000_000_000_000;
const STEP_USEC: u64 = 1_000;
pub const SYNTHETIC_BOOT_ID: BootId = BootId([0x5a; 16]);
/// `MESSAGE_ID` carried by every synthetic entry.
pub const SYNTHETIC_MESSAGE_ID: MessageId = MessageId([0xc7; 16]);

pub struct SyntheticReader {
    control: SyntheticControl,
    position: u64,
    opened: Option<OpenTarget>,
    data_threshold: usize,
}

impl SyntheticReader {
    /// An empty reader and the handle that scripts it.
    pub fn new() -> Result<(Self, SyntheticControl)> {
        let control = SyntheticControl {
            inner: Arc::new(ControlInner {
                script: Mutex::new(Script::default()),
                signal: Signal::new()?,
                in_call: AtomicBool::new(false),
                overlaps: AtomicU64::new(0),
                pulls: AtomicU64::new(0),
                opens: AtomicU64::new(0),
            }),
        };
        let reader = Self {
            control: control.clone(),
            position: 0,
            opened: None,
            data_threshold: 64 * 1024,
        };
        Ok((reader, control))
    }

    fn require_open(&self) -> Result<()> {
        if self.opened.is_none() {
            return Err(Error::NotOpen);
        }
        Ok(())
    }

    fn opened(&mut self, target: OpenTarget) -> Result<()> {
        let _call = self.control.enter();
        self.control.inner.opens.fetch_add(1, Ordering::SeqCst);
        self.opened = Some(target);
        Ok(())
    }
}

impl BlockingReader for SyntheticReader {
    fn open(&mut self, mode: OpenMode) -> Result<()> {
        self.opened(OpenTarget::Mode(mode))
    }

    fn open_directory(&mut self, path: &Path) -> Result<()> {
        self.opened(OpenTarget::Directory(path.to_path_buf()))
    }

    fn open_files(&mut self, paths: &[PathBuf]) -> Result<()> {
        self.opened(OpenTarget::Files(paths.to_vec()))
    }

    fn seek_head(&mut self) -> Result<bool> {
        let _call = self.control.enter();
        self.require_open()?;
        self.position = 0;
        Ok(true)
    }

    fn seek_tail(&mut self) -> Result<bool> {
        let _call = self.control.enter();
        self.require_open()?;
        let script = self.control.script()?;
        if script.unbounded {
            return Ok(false);
        }
        self.position = script.available;
        Ok(true)
    }

    fn seek_cursor(&mut self, cursor: &Cursor) -> Result<bool> {
        let _call = self.control.enter();
        self.require_open()?;
        let Some(index) = parse_cursor(cursor) else {
            return Ok(false);
        };
        if !self.control.script()?.has(index) {
            return Ok(false);
        }
        self.position = index;
        Ok(true)
    }

    fn seek_monotonic_usec(&mut self, boot_id: BootId, usec: u64) -> Result<bool> {
        let _call = self.control.enter();
        self.require_open()?;
        if boot_id != SYNTHETIC_BOOT_ID {
            return Ok(false);
        }
        self.position = usec.div_ceil(STEP_USEC);
        Ok(true)
    }

    fn seek_realtime_usec(&mut self, usec: u64) -> Result<bool> {
        let _call = self.control.enter();
        self.require_open()?;
        self.position = usec.saturating_sub(REALTIME_BASE_USEC).div_ceil(STEP_USEC);
        Ok(true)
    }

    fn readiness_fd(&self) -> Result<RawFd> {
        Ok(self.control.inner.signal.read.as_raw_fd())
    }

    fn process_events(&mut self) -> Result<ReadinessEvent> {
        let _call = self.control.enter();
        let delay = self.control.script()?.classify_delay;
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        let inner = &self.control.inner;
        inner.signal.drain();
        let mut script = self.control.script()?;
        let event = script.pending.pop_front().unwrap_or(ReadinessEvent::NoOp);
        if !script.pending.is_empty() {
            inner.signal.raise();
        }
        Ok(event)
    }

    fn next_entry(&mut self, skip: u64) -> Result<Option<Entry>> {
        let _call = self.control.enter();
        self.require_open()?;
        self.control.inner.pulls.fetch_add(1, Ordering::SeqCst);
        let delay = self.control.script()?.pull_delay;
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }

        let script = self.control.script()?;
        let index = self.position.saturating_add(skip);
        if script.fail_at == Some(index) {
            return Err(Error::Reader(format!("synthetic failure at entry {index}")));
        }
        if !script.has(index) {
            self.position = index.min(script.available);
            return Ok(None);
        }
        let entry = script.entry(index);
        self.position = index + 1;
        Ok(Some(entry))
    }

    fn previous_entry(&mut self, skip: u64) -> Result<Option<Entry>> {
        let _call = self.control.enter();
        self.require_open()?;
        let script = self.control.script()?;
        let Some(index) = self.position.checked_sub(skip.saturating_add(2)) else {
            return Ok(None);
        };
        self.position = index + 1;
        Ok(Some(script.entry(index)))
    }

    fn skip_previous(&mut self, skip: u64) -> Result<u64> {
        let _call = self.control.enter();
        self.require_open()?;
        let moved = skip.min(self.position);
        self.position -= moved;
        Ok(moved)
    }

    fn add_filter(&mut self, rule: &Rule) -> Result<()> {
        let _call = self.control.enter();
        self.control.script()?.filters.push(rule.clone());
        Ok(())
    }

    fn clear_filter(&mut self) -> Result<()> {
        let _call = self.control.enter();
        self.control.script()?.filters.clear();
        Ok(())
    }

    fn status(&self) -> Result<ReaderStatus> {
        let script = self.control.script()?;
        Ok(ReaderStatus {
            closed: self.opened.is_none(),
            locked: false,
            idle: script.pending.is_empty(),
            events: libc::POLLIN,
            timeout_usec: None,
        })
    }

    fn catalog(&mut self) -> Result<String> {
        let _call = self.control.enter();
        self.require_open()?;
        let Some(index) = self.position.checked_sub(1) else {
            return Err(Error::Reader("no current entry".into()));
        };
        let template = self.control.script()?.catalog_text(SYNTHETIC_MESSAGE_ID)?;
        Ok(template.replace("@SYNTHETIC_INDEX@", &index.to_string()))
    }

    fn catalog_for_message_id(&mut self, id: MessageId) -> Result<String> {
        let _call = self.control.enter();
        self.control.script()?.catalog_text(id)
    }

    fn data_threshold(&self) -> Result<usize> {
        Ok(self.data_threshold)
    }

    fn set_data_threshold(&mut self, bytes: usize) -> Result<()> {
        let _call = self.control.enter();
        self.data_threshold = bytes;
        Ok(())
    }
}

#[derive(Default)]
struct Script {
    available: u64,
    unbounded: bool,
    messages: BTreeMap<u64, String>,
    pending: VecDeque<ReadinessEvent>,
    fail_at: Option<u64>,
    pull_delay: Duration,
    classify_delay: Duration,
    filters: Vec<Rule>,
    catalogs: HashMap<MessageId, String>,
}

impl Script {
    fn catalog_text(&self, id: MessageId) -> Result<String> {
        self.catalogs
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::Reader(format!("no catalog entry for {id}")))
    }

    fn has(&self, index: u64) -> bool {
        self.unbounded || index < self.available
    }

    fn entry(&self, index: u64) -> Entry {
        let message = self
            .messages
            .get(&index)
            .cloned()
            .unwrap_or_else(|| format!("entry {index}"));
        let mut fields = BTreeMap::new();
        fields.insert("MESSAGE".to_string(), message.into_bytes());
        fields.insert(
            "SYNTHETIC_INDEX".to_string(),
            index.to_string().into_bytes(),
        );
        fields.insert(
            "MESSAGE_ID".to_string(),
            SYNTHETIC_MESSAGE_ID.to_string().into_bytes(),
        );
        Entry {
            cursor: Cursor::new(format!("{CURSOR_PREFIX}{index}")),
            realtime_usec: REALTIME_BASE_USEC + index * STEP_USEC,
            monotonic_usec: index * STEP_USEC,
            boot_id: SYNTHETIC_BOOT_ID,
            fields,
        }
    }
}

fn parse_cursor(cursor: &Cursor) -> Option<u64> {
    cursor.as_str().strip_prefix(CURSOR_PREFIX)?.parse().ok()
}

/// Index of a synthetic entry, from its cursor.
pub fn entry_index(entry: &Entry) -> Option<u64> {
    parse_cursor(&entry.cursor)
}

struct ControlInner {
    script: Mutex<Script>,
    signal: Signal,
    in_call: AtomicBool,
    overlaps: AtomicU64,
    pulls: AtomicU64,
    opens: AtomicU64,
}

#[derive(Clone)]
pub struct SyntheticControl {
    inner: Arc<ControlInner>,
}

impl SyntheticControl {
    fn script(&self) -> Result<MutexGuard<'_, Script>> {
        self.inner
            .script
            .lock()
            .map_err(|_| Error::Poisoned("synthetic script"))
    }

    fn enter(&self) -> CallGuard<'_> {
        if self.inner.in_call.swap(true, Ordering::AcqRel) {
            self.inner.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        CallGuard { inner: &self.inner }
    }

    fn push_event(&self, event: ReadinessEvent) -> Result<()> {
        self.script()?.pending.push_back(event);
        self.inner.signal.raise();
        Ok(())
    }

    /// Makes `count` more entries available and signals an append.
    pub fn append(&self, count: u64) -> Result<()> {
        self.script()?.available += count;
        self.push_event(ReadinessEvent::Append)
    }

    pub fn append_messages<I, S>(&self, messages: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        {
            let mut script = self.script()?;
            for message in messages {
                let index = script.available;
                script.messages.insert(index, message.into());
                script.available += 1;
            }
        }
        self.push_event(ReadinessEvent::Append)
    }

    /// Entries available without signalling readiness.
    pub fn preload(&self, count: u64) -> Result<()> {
        self.script()?.available += count;
        Ok(())
    }

    /// Every pull returns a fresh entry from now on.
    pub fn set_unbounded(&self) -> Result<()> {
        self.script()?.unbounded = true;
        Ok(())
    }

    pub fn invalidate(&self) -> Result<()> {
        self.push_event(ReadinessEvent::Invalidated)
    }

    /// Makes the descriptor readable with nothing to report.
    pub fn wake_spuriously(&self) {
        self.inner.signal.raise();
    }

    /// The pull reaching `index` fails.
    pub fn fail_at(&self, index: u64) -> Result<()> {
        self.script()?.fail_at = Some(index);
        Ok(())
    }

    /// Each pull blocks this long, like a slow native read.
    pub fn set_pull_delay(&self, delay: Duration) -> Result<()> {
        self.script()?.pull_delay = delay;
        Ok(())
    }

    /// Each `process_events` call blocks this long before classifying.
    pub fn set_classify_delay(&self, delay: Duration) -> Result<()> {
        self.script()?.classify_delay = delay;
        Ok(())
    }

    /// Registers catalog text for `id`. `@SYNTHETIC_INDEX@` is replaced by
    /// the current entry's index when read through `catalog`.
    pub fn add_catalog(&self, id: MessageId, text: impl Into<String>) -> Result<()> {
        self.script()?.catalogs.insert(id, text.into());
        Ok(())
    }

    /// Filters currently installed on the reader.
    pub fn filters(&self) -> Vec<Rule> {
        self.script().map(|s| s.filters.clone()).unwrap_or_default()
    }

    pub fn pulls(&self) -> u64 {
        self.inner.pulls.load(Ordering::SeqCst)
    }

    pub fn opens(&self) -> u64 {
        self.inner.opens.load(Ordering::SeqCst)
    }

    /// Reader calls that started while another was still running.
    pub fn overlaps(&self) -> u64 {
        self.inner.overlaps.load(Ordering::SeqCst)
    }
}

struct CallGuard<'a> {
    inner: &'a ControlInner,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        self.inner.in_call.store(false, Ordering::Release);
    }
}

struct Signal {
    read: OwnedFd,
    write: OwnedFd,
}

impl Signal {
    #[cfg(target_os = "linux")]
    fn new() -> Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        let read = unsafe { OwnedFd::from_raw_fd(fd) };
        let write = read.try_clone()?;
        Ok(Self { read, write })
    }

    #[cfg(not(target_os = "linux"))]
    fn new() -> Result<Self> {
        let mut fds = [0 as libc::c_int; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        let read = unsafe { OwnedFd::from_raw_fd(fds[0]) };
        let write = unsafe { OwnedFd::from_raw_fd(fds[1]) };
        for fd in [&read, &write] {
            let flags = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFL) };
            if flags < 0
                || unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0
            {
                return Err(Error::Io(std::io::Error::last_os_error()));
            }
        }
        Ok(Self { read, write })
    }

    fn raise(&self) {
        let value: u64 = 1;
        // EAGAIN means the descriptor is already readable.
        let _ = unsafe {
            libc::write(
                self.write.as_raw_fd(),
                &value as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
    }

    fn drain(&self) {
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe {
                libc::read(
                    self.read.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n <= 0 {
                break;
            }
        }
    }
}
