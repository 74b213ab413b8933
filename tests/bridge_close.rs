use std::time::{Duration, Instant};

use journal_bridge::{
    AsyncJournal, BridgeState, Error, Executor, JournalConfig, OpenMode, SyntheticControl,
    SyntheticReader,
};

const POLL: Duration = Duration::from_millis(20);

async fn open_unbounded(
    capacity: usize,
    pull_delay: Duration,
) -> journal_bridge::Result<(AsyncJournal<SyntheticReader>, SyntheticControl)> {
    let (reader, control) = SyntheticReader::new()?;
    control.set_unbounded()?;
    control.set_pull_delay(pull_delay)?;
    let config = JournalConfig::default()
        .with_capacity(capacity)
        .with_poll_interval(POLL);
    let journal = AsyncJournal::with_config(reader, config)?;
    journal.open(OpenMode::System).await?;
    Ok((journal, control))
}

#[tokio::test]
async fn close_twice_then_next_reports_end_of_stream() -> journal_bridge::Result<()> {
    let (journal, control) = open_unbounded(8, Duration::from_millis(2)).await?;

    let entries = journal.entries()?;
    assert!(entries.next().await?.is_some());

    entries.close();
    entries.close();

    let next = tokio::time::timeout(Duration::from_millis(200), entries.next())
        .await
        .expect("next returns promptly after close");
    assert!(next?.is_none());

    tokio::time::timeout(Duration::from_secs(1), entries.terminated())
        .await
        .expect("producer stops");
    assert_eq!(entries.state(), BridgeState::Closed);

    let pulls = control.pulls();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(control.pulls(), pulls);
    Ok(())
}

#[tokio::test]
async fn close_wakes_consumer_while_producer_is_stuck_in_a_read() -> journal_bridge::Result<()> {
    let (journal, _control) = open_unbounded(8, Duration::from_millis(600)).await?;

    let entries = journal.entries()?;
    let start = Instant::now();
    let (next, ()) = tokio::join!(entries.next(), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        entries.close();
    });
    assert!(next?.is_none());
    assert!(
        start.elapsed() < Duration::from_millis(400),
        "consumer waited {:?}",
        start.elapsed()
    );
    assert_eq!(entries.state(), BridgeState::Closing);

    // The producer leaves once its native read returns.
    tokio::time::timeout(Duration::from_secs(2), entries.terminated())
        .await
        .expect("producer stops after the read returns");
    assert_eq!(entries.state(), BridgeState::Closed);
    Ok(())
}

#[tokio::test]
async fn dropped_sequence_stops_pulling() -> journal_bridge::Result<()> {
    let (journal, control) = open_unbounded(2, Duration::from_millis(2)).await?;

    {
        let entries = journal.entries()?;
        assert!(entries.next().await?.is_some());
    }

    tokio::time::sleep(POLL * 5).await;
    let pulls = control.pulls();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(control.pulls(), pulls, "producer kept pulling after drop");
    assert_eq!(journal.iteration_state(), Some(BridgeState::Closed));
    Ok(())
}

#[tokio::test]
async fn closing_the_journal_retires_its_iteration() -> journal_bridge::Result<()> {
    let (journal, control) = open_unbounded(4, Duration::ZERO).await?;

    let entries = journal.entries()?;
    assert!(entries.next().await?.is_some());
    journal.close();
    assert!(entries.next().await?.is_none());
    tokio::time::timeout(Duration::from_secs(1), entries.terminated())
        .await
        .expect("producer stops");
    assert_eq!(journal.iteration_state(), None);
    assert_eq!(control.overlaps(), 0);
    Ok(())
}

#[tokio::test]
async fn dropping_the_journal_stops_the_producer() -> journal_bridge::Result<()> {
    let (journal, control) = open_unbounded(4, Duration::from_millis(1)).await?;

    let entries = journal.entries()?;
    assert!(entries.next().await?.is_some());
    drop(journal);

    assert!(entries.next().await?.is_none());
    tokio::time::timeout(Duration::from_secs(1), entries.terminated())
        .await
        .expect("producer stops");
    let pulls = control.pulls();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(control.pulls(), pulls);
    Ok(())
}

#[tokio::test]
async fn shut_down_pool_fails_the_iteration_instead_of_hanging() -> journal_bridge::Result<()> {
    let (reader, control) = SyntheticReader::new()?;
    control.preload(10)?;
    let executor = Executor::dedicated(2, "journal-close")?;
    let journal = AsyncJournal::with_executor(reader, executor, JournalConfig::default())?;
    journal.open(OpenMode::System).await?;

    if let Executor::Pool(pool) = journal.executor() {
        pool.shutdown();
    }

    let entries = journal.entries()?;
    let next = tokio::time::timeout(Duration::from_secs(2), entries.next())
        .await
        .expect("next returns");
    assert!(matches!(next, Err(Error::Worker(_))), "got {next:?}");
    assert_eq!(entries.state(), BridgeState::Closed);
    assert_eq!(control.pulls(), 0);
    Ok(())
}
