use std::fmt;

#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    /// The reader reported a failure of its own (not an OS error).
    Reader(String),
    /// Registering the readiness descriptor with the reactor failed.
    Register(std::io::Error),
    /// The store was rotated, truncated or replaced; cursors are stale.
    Invalidated,
    /// The blocking call panicked or its worker went away.
    Worker(String),
    Poisoned(&'static str),
    Unsupported(&'static str),
    NotOpen,
    NoRuntime,
    InvalidConfig(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(err) => write!(f, "io error: {err}"),
            Error::Reader(msg) => write!(f, "reader error: {msg}"),
            Error::Register(err) => write!(f, "readiness registration failed: {err}"),
            Error::Invalidated => write!(f, "journal invalidated"),
            Error::Worker(msg) => write!(f, "worker failed: {msg}"),
            Error::Poisoned(what) => write!(f, "lock poisoned: {what}"),
            Error::Unsupported(msg) => write!(f, "unsupported: {msg}"),
            Error::NotOpen => write!(f, "journal not opened"),
            Error::NoRuntime => write!(f, "no tokio runtime available"),
            Error::InvalidConfig(msg) => write!(f, "invalid config: {msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) | Error::Register(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Error::Io(value)
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::InvalidConfig(value.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn io_errors_keep_their_source() {
        let err = Error::Register(std::io::Error::from_raw_os_error(libc::EPERM));
        assert!(err.source().is_some());
        assert!(err.to_string().starts_with("readiness registration failed"));
        assert!(Error::Invalidated.source().is_none());
    }
}
