//! Async facade over a blocking, append-only journal reader.
//!
//! Blocking reader calls run on an [`Executor`]; "iterate everything" runs
//! a producer thread feeding a bounded [`BridgeQueue`]; "wait for changes"
//! registers the reader's descriptor with the tokio reactor.

pub mod bridge;
pub mod config;
pub mod daemon;
pub mod entry;
pub mod error;
pub mod executor;
pub mod journal;
pub mod readiness;
pub mod reader;
pub mod synthetic;

pub use bridge::{BridgeQueue, BridgeState, BridgeStats, CloseSignal};
pub use config::{ExecutorKind, InvalidationPolicy, JournalConfig};
pub use daemon::{Notification, Notifier, NotifyErrors, Supervisor};
pub use entry::{BootId, Cursor, Entry, MessageId};
pub use error::{Error, Result};
pub use executor::{Completion, Executor};
pub use journal::{AsyncJournal, Entries};
pub use readiness::ReadinessWaiter;
pub use reader::{
    BlockingReader, OpenMode, OpenTarget, ReaderStatus, ReadinessEvent, Rule, SharedReader,
};
pub use synthetic::{SyntheticControl, SyntheticReader};
