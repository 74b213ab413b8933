use std::time::Duration;

use journal_bridge::synthetic::entry_index;
use journal_bridge::{
    AsyncJournal, BridgeState, Error, JournalConfig, OpenMode, SyntheticControl, SyntheticReader,
};

async fn open_journal(capacity: usize) -> journal_bridge::Result<(AsyncJournal<SyntheticReader>, SyntheticControl)> {
    let (reader, control) = SyntheticReader::new()?;
    let config = JournalConfig::default()
        .with_capacity(capacity)
        .with_poll_interval(Duration::from_millis(20));
    let journal = AsyncJournal::with_config(reader, config)?;
    journal.open(OpenMode::System).await?;
    journal.seek_head().await?;
    Ok((journal, control))
}

#[tokio::test]
async fn yields_a_b_c_then_end_of_stream() -> journal_bridge::Result<()> {
    let (journal, control) = open_journal(16).await?;
    control.append_messages(["A", "B", "C"])?;

    let entries = journal.entries()?;
    let mut messages = Vec::new();
    while let Some(entry) = entries.next().await? {
        messages.push(entry.message().expect("message"));
    }
    assert_eq!(messages, vec!["A", "B", "C"]);
    assert!(entries.next().await?.is_none());

    entries.terminated().await;
    assert_eq!(entries.state(), BridgeState::Closed);
    Ok(())
}

#[tokio::test]
async fn full_drain_preserves_order_without_gaps() -> journal_bridge::Result<()> {
    let (journal, control) = open_journal(8).await?;
    control.preload(5_000)?;

    let entries = journal.entries()?;
    let mut expected = 0u64;
    while let Some(entry) = entries.next().await? {
        assert_eq!(entry_index(&entry), Some(expected));
        expected += 1;
    }
    assert_eq!(expected, 5_000);

    let stats = entries.stats();
    assert_eq!(stats.produced, 5_000);
    assert_eq!(stats.delivered, 5_000);
    assert_eq!(control.overlaps(), 0);
    Ok(())
}

#[tokio::test]
async fn peak_buffer_never_exceeds_capacity() -> journal_bridge::Result<()> {
    let (journal, control) = open_journal(4).await?;
    control.preload(10_000)?;

    let entries = journal.entries()?;
    let mut consumed = 0u64;
    while entries.next().await?.is_some() {
        consumed += 1;
        assert!(entries.stats().buffered <= 4);
        if consumed % 1_000 == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
    assert_eq!(consumed, 10_000);
    let stats = entries.stats();
    assert!(stats.peak_buffered <= 4, "peak {}", stats.peak_buffered);
    assert_eq!(stats.capacity, 4);
    Ok(())
}

#[tokio::test]
async fn stalled_consumer_stalls_producer_until_it_resumes() -> journal_bridge::Result<()> {
    let capacity = 8;
    let (journal, control) = open_journal(capacity).await?;
    control.set_unbounded()?;

    let entries = journal.entries()?;
    tokio::time::sleep(Duration::from_millis(150)).await;
    let stalled = control.pulls();
    // One pull may be in hand while the producer waits for space.
    assert!(stalled <= capacity as u64 + 1, "pulled {stalled}");

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(control.pulls(), stalled);

    for expected in 0..200u64 {
        let entry = entries.next().await?.expect("entry");
        assert_eq!(entry_index(&entry), Some(expected));
    }
    assert!(control.pulls() > stalled);
    assert!(entries.stats().peak_buffered <= capacity);

    entries.close();
    Ok(())
}

#[tokio::test]
async fn strict_handoff_with_capacity_one() -> journal_bridge::Result<()> {
    let (journal, control) = open_journal(1).await?;
    control.preload(300)?;

    let entries = journal.entries()?;
    let mut count = 0;
    while entries.next().await?.is_some() {
        count += 1;
    }
    assert_eq!(count, 300);
    assert_eq!(entries.stats().peak_buffered, 1);
    Ok(())
}

#[tokio::test]
async fn read_failure_is_reported_after_buffered_entries() -> journal_bridge::Result<()> {
    let (journal, control) = open_journal(16).await?;
    control.preload(5)?;
    control.fail_at(3)?;

    let entries = journal.entries()?;
    for expected in 0..3u64 {
        let entry = entries.next().await?.expect("entry before failure");
        assert_eq!(entry_index(&entry), Some(expected));
    }
    match entries.next().await {
        Err(Error::Reader(msg)) => assert!(msg.contains("entry 3")),
        other => panic!("expected reader error, got {other:?}"),
    }
    assert!(entries.next().await?.is_none());
    Ok(())
}

#[tokio::test]
async fn empty_journal_ends_immediately() -> journal_bridge::Result<()> {
    let (journal, control) = open_journal(16).await?;

    let entries = journal.entries()?;
    let next = tokio::time::timeout(Duration::from_secs(1), entries.next())
        .await
        .expect("end of stream");
    assert!(next?.is_none());
    assert_eq!(control.pulls(), 1);
    Ok(())
}
