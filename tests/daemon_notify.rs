use std::io;
use std::sync::{Arc, Mutex};

use journal_bridge::{Error, Executor, Notification, Notifier, NotifyErrors, Supervisor};

#[derive(Clone, Default)]
struct Recording {
    lines: Arc<Mutex<Vec<(String, bool)>>>,
}

impl Recording {
    fn lines(&self) -> Vec<(String, bool)> {
        self.lines.lock().expect("lines").clone()
    }
}

impl Supervisor for Recording {
    fn send(&self, line: &str, unset_environment: bool) -> journal_bridge::Result<bool> {
        self.lines
            .lock()
            .map_err(|_| Error::Poisoned("recorded lines"))?
            .push((line.to_string(), unset_environment));
        Ok(true)
    }
}

struct Unreachable;

impl Supervisor for Unreachable {
    fn send(&self, _line: &str, _unset_environment: bool) -> journal_bridge::Result<bool> {
        Err(Error::Io(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            "notify socket refused",
        )))
    }
}

#[tokio::test]
async fn lines_reach_the_supervisor_in_order() -> journal_bridge::Result<()> {
    let supervisor = Recording::default();
    let notifier = Notifier::new(supervisor.clone(), Executor::current()?);

    assert!(notifier.notify(Notification::Ready).await?);
    assert!(notifier.notify(Notification::Status("following".into())).await?);
    assert!(notifier.notify(Notification::Stopping).await?);

    let lines: Vec<String> = supervisor.lines().into_iter().map(|(l, _)| l).collect();
    assert_eq!(lines, vec!["READY=1", "STATUS=following", "STOPPING=1"]);
    Ok(())
}

#[tokio::test]
async fn unset_environment_is_passed_through() -> journal_bridge::Result<()> {
    let supervisor = Recording::default();
    let notifier =
        Notifier::new(supervisor.clone(), Executor::current()?).unset_environment(true);

    notifier.notify(Notification::Watchdog).await?;
    assert_eq!(supervisor.lines(), vec![("WATCHDOG=1".to_string(), true)]);
    Ok(())
}

#[tokio::test]
async fn failures_are_logged_by_default() -> journal_bridge::Result<()> {
    let notifier = Notifier::new(Unreachable, Executor::current()?);
    assert!(!notifier.notify(Notification::Ready).await?);
    Ok(())
}

#[tokio::test]
async fn failures_can_be_propagated() -> journal_bridge::Result<()> {
    let notifier =
        Notifier::new(Unreachable, Executor::current()?).errors(NotifyErrors::Propagate);
    let res = notifier.notify(Notification::Errno(5)).await;
    assert!(matches!(res, Err(Error::Io(_))), "got {res:?}");
    Ok(())
}

#[tokio::test]
async fn dedicated_pool_delivers_notifications() -> journal_bridge::Result<()> {
    let supervisor = Recording::default();
    let notifier = Notifier::new(supervisor.clone(), Executor::dedicated(2, "notify-test")?);

    notifier.notify(Notification::MainPid(4242)).await?;
    assert_eq!(supervisor.lines()[0].0, "MAINPID=4242");
    Ok(())
}
