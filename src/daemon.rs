//! Lifecycle notifications for a host supervisor.
//!
//! Only the message shape lives here. The transport is whatever
//! [`Supervisor`] implementation the host provides.

use std::fmt;
use std::sync::Arc;

use crate::executor::Executor;
use crate::Result;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Notification {
    Ready,
    Reloading,
    Stopping,
    Status(String),
    Errno(i32),
    BusError(String),
    MainPid(u32),
    Watchdog,
    FdStore,
    FdName(String),
    WatchdogUsec(u64),
}

impl Notification {
    pub fn name(&self) -> &'static str {
        match self {
            Notification::Ready => "READY",
            Notification::Reloading => "RELOADING",
            Notification::Stopping => "STOPPING",
            Notification::Status(_) => "STATUS",
            Notification::Errno(_) => "ERRNO",
            Notification::BusError(_) => "BUSERROR",
            Notification::MainPid(_) => "MAINPID",
            Notification::Watchdog => "WATCHDOG",
            Notification::FdStore => "FDSTORE",
            Notification::FdName(_) => "FDNAME",
            Notification::WatchdogUsec(_) => "WATCHDOG_USEC",
        }
    }
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.name();
        match self {
            Notification::Ready
            | Notification::Reloading
            | Notification::Stopping
            | Notification::Watchdog
            | Notification::FdStore => write!(f, "{name}=1"),
            Notification::Status(value)
            | Notification::BusError(value)
            | Notification::FdName(value) => write!(f, "{name}={value}"),
            Notification::Errno(value) => write!(f, "{name}={value}"),
            Notification::MainPid(value) => write!(f, "{name}={value}"),
            Notification::WatchdogUsec(value) => write!(f, "{name}={value}"),
        }
    }
}

/// Delivers a `NAME=value` line to the supervisor. Returns whether a
/// supervisor was listening.
pub trait Supervisor: Send + Sync + 'static {
    fn send(&self, line: &str, unset_environment: bool) -> Result<bool>;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum NotifyErrors {
    /// Log the failure and report `Ok(false)`.
    #[default]
    Log,
    Propagate,
}

pub struct Notifier<S> {
    supervisor: Arc<S>,
    executor: Executor,
    errors: NotifyErrors,
    unset_environment: bool,
}

impl<S: Supervisor> Notifier<S> {
    pub fn new(supervisor: S, executor: Executor) -> Self {
        Self {
            supervisor: Arc::new(supervisor),
            executor,
            errors: NotifyErrors::default(),
            unset_environment: false,
        }
    }

    pub fn errors(mut self, errors: NotifyErrors) -> Self {
        self.errors = errors;
        self
    }

    /// Ask the transport to drop its environment after each send so child
    /// processes do not inherit it.
    pub fn unset_environment(mut self, unset: bool) -> Self {
        self.unset_environment = unset;
        self
    }

    pub async fn notify(&self, notification: Notification) -> Result<bool> {
        let line = notification.to_string();
        log::debug!("sending {line:?} to supervisor");
        let supervisor = Arc::clone(&self.supervisor);
        let unset = self.unset_environment;
        let result = self
            .executor
            .run(move || supervisor.send(&line, unset))
            .await;
        match (result, self.errors) {
            (Ok(sent), _) => Ok(sent),
            (Err(err), NotifyErrors::Log) => {
                log::error!("supervisor notification {} failed: {err}", notification.name());
                Ok(false)
            }
            (Err(err), NotifyErrors::Propagate) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_states_render_as_one() {
        assert_eq!(Notification::Ready.to_string(), "READY=1");
        assert_eq!(Notification::Watchdog.to_string(), "WATCHDOG=1");
    }

    #[test]
    fn valued_states_render_their_value() {
        assert_eq!(
            Notification::Status("draining".into()).to_string(),
            "STATUS=draining"
        );
        assert_eq!(Notification::MainPid(42).to_string(), "MAINPID=42");
        assert_eq!(
            Notification::WatchdogUsec(5_000_000).to_string(),
            "WATCHDOG_USEC=5000000"
        );
    }
}
