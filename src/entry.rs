//! Records handed out by the reader and the identifiers attached to them.

use std::collections::BTreeMap;
use std::fmt;

/// Opaque position token handed out by the reader for every entry.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Cursor(String);

impl Cursor {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 128-bit boot identifier used by monotonic seeks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct BootId(pub [u8; 16]);

impl fmt::Display for BootId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_id128(f, &self.0)
    }
}

/// 128-bit id of a message type, the key for catalog lookups.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct MessageId(pub [u8; 16]);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_id128(f, &self.0)
    }
}

fn write_id128(f: &mut fmt::Formatter<'_>, raw: &[u8; 16]) -> fmt::Result {
    for byte in raw {
        write!(f, "{byte:02x}")?;
    }
    Ok(())
}

/// One record read from the journal. Field payloads are kept as raw bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    pub cursor: Cursor,
    pub realtime_usec: u64,
    pub monotonic_usec: u64,
    pub boot_id: BootId,
    pub fields: BTreeMap<String, Vec<u8>>,
}

impl Entry {
    pub fn field(&self, name: &str) -> Option<&[u8]> {
        self.fields.get(name).map(Vec::as_slice)
    }

    /// The `MESSAGE` field, lossily decoded.
    pub fn message(&self) -> Option<String> {
        self.field("MESSAGE")
            .map(|raw| String::from_utf8_lossy(raw).into_owned())
    }
}
