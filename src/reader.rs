//! The blocking reader interface consumed by the async facade.
//!
//! Implementations wrap a stateful native journal handle. Every method may
//! block on I/O and none of them are safe to call concurrently, so the
//! facade only ever reaches the reader through [`SharedReader`].

use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::entry::{BootId, Cursor, Entry, MessageId};
use crate::{Error, Result};

/// Which journal files to open.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OpenMode {
    LocalOnly,
    RuntimeOnly,
    System,
    #[default]
    CurrentUser,
}

/// What the facade last opened, kept so the store can be reopened.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OpenTarget {
    Mode(OpenMode),
    Directory(PathBuf),
    Files(Vec<PathBuf>),
}

/// Classification of a readiness wake-up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadinessEvent {
    /// New entries were appended.
    Append,
    /// Spurious wake, nothing changed.
    NoOp,
    /// Files were rotated, truncated or replaced.
    Invalidated,
}

/// Filter expression passed through to the reader untouched.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Rule {
    Match { field: String, value: Vec<u8> },
    And(Vec<Rule>),
    Or(Vec<Rule>),
}

impl Rule {
    pub fn matches(field: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Rule::Match {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn and(self, other: Rule) -> Self {
        match self {
            Rule::And(mut rules) => {
                rules.push(other);
                Rule::And(rules)
            }
            rule => Rule::And(vec![rule, other]),
        }
    }

    pub fn or(self, other: Rule) -> Self {
        match self {
            Rule::Or(mut rules) => {
                rules.push(other);
                Rule::Or(rules)
            }
            rule => Rule::Or(vec![rule, other]),
        }
    }
}

/// Snapshot of the reader handle's state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReaderStatus {
    pub closed: bool,
    pub locked: bool,
    /// Nothing pending on the readiness descriptor.
    pub idle: bool,
    /// `poll(2)` events to wait for on the readiness descriptor.
    pub events: i16,
    /// Longest wait before the reader wants `process_events` called, `None`
    /// when it has no deadline.
    pub timeout_usec: Option<u64>,
}

pub trait BlockingReader: Send + 'static {
    fn open(&mut self, mode: OpenMode) -> Result<()>;
    fn open_directory(&mut self, path: &Path) -> Result<()>;
    fn open_files(&mut self, paths: &[PathBuf]) -> Result<()>;

    fn seek_head(&mut self) -> Result<bool>;
    fn seek_tail(&mut self) -> Result<bool>;
    fn seek_cursor(&mut self, cursor: &Cursor) -> Result<bool>;
    fn seek_monotonic_usec(&mut self, boot_id: BootId, usec: u64) -> Result<bool>;
    fn seek_realtime_usec(&mut self, usec: u64) -> Result<bool>;

    /// Descriptor that becomes readable when the journal changes.
    fn readiness_fd(&self) -> Result<RawFd>;

    /// Drains pending notifications on the readiness descriptor.
    fn process_events(&mut self) -> Result<ReadinessEvent>;

    /// Skips `skip` entries, then returns the next one. `None` at the end
    /// of the currently available data.
    fn next_entry(&mut self, skip: u64) -> Result<Option<Entry>>;

    fn previous_entry(&mut self, _skip: u64) -> Result<Option<Entry>> {
        Err(Error::Unsupported("previous_entry"))
    }

    fn skip_next(&mut self, skip: u64) -> Result<u64> {
        let mut moved = 0;
        while moved < skip {
            if self.next_entry(0)?.is_none() {
                break;
            }
            moved += 1;
        }
        Ok(moved)
    }

    fn skip_previous(&mut self, _skip: u64) -> Result<u64> {
        Err(Error::Unsupported("skip_previous"))
    }

    fn add_filter(&mut self, rule: &Rule) -> Result<()>;
    fn clear_filter(&mut self) -> Result<()>;

    fn status(&self) -> Result<ReaderStatus> {
        Err(Error::Unsupported("status"))
    }

    /// Catalog text for the current entry, with its fields substituted.
    fn catalog(&mut self) -> Result<String> {
        Err(Error::Unsupported("catalog"))
    }

    fn catalog_for_message_id(&mut self, _id: MessageId) -> Result<String> {
        Err(Error::Unsupported("catalog_for_message_id"))
    }

    fn data_threshold(&self) -> Result<usize> {
        Err(Error::Unsupported("data_threshold"))
    }

    fn set_data_threshold(&mut self, _bytes: usize) -> Result<()> {
        Err(Error::Unsupported("set_data_threshold"))
    }
}

/// The reader plus the lock that serializes every call into it.
pub struct SharedReader<R> {
    inner: Arc<Mutex<R>>,
}

impl<R> Clone for SharedReader<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: BlockingReader> SharedReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            inner: Arc::new(Mutex::new(reader)),
        }
    }

    pub fn lock(&self) -> Result<MutexGuard<'_, R>> {
        self.inner
            .lock()
            .map_err(|_| Error::Poisoned("journal reader"))
    }

    pub fn with<T>(&self, f: impl FnOnce(&mut R) -> Result<T>) -> Result<T> {
        let mut guard = self.lock()?;
        f(&mut guard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rules_flatten_when_chained() {
        let rule = Rule::matches("_SYSTEMD_UNIT", "a.service")
            .or(Rule::matches("_SYSTEMD_UNIT", "b.service"))
            .or(Rule::matches("PRIORITY", "3"));
        match rule {
            Rule::Or(rules) => assert_eq!(rules.len(), 3),
            other => panic!("unexpected rule {other:?}"),
        }
    }
}
