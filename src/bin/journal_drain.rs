use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use journal_bridge::{AsyncJournal, JournalConfig, OpenMode, SyntheticReader};

#[derive(Parser, Debug)]
#[command(name = "journal-drain")]
#[command(about = "Drain a synthetic journal through the bridge and report throughput")]
struct Args {
    /// Number of entries to generate
    #[arg(long, default_value_t = 1_000_000)]
    entries: u64,

    /// JSON config file (capacity, poll_interval_ms, executor, ...)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the bridge capacity from the config
    #[arg(long)]
    capacity: Option<usize>,

    /// Sleep this many microseconds after every consumed entry
    #[arg(long, default_value_t = 0)]
    consumer_delay_us: u64,

    /// Close the iteration after this many entries
    #[arg(long)]
    stop_after: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => JournalConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => JournalConfig::default(),
    };
    if let Some(capacity) = args.capacity {
        config = config.with_capacity(capacity);
    }

    let (reader, control) = SyntheticReader::new().context("failed to create reader")?;
    control.preload(args.entries)?;

    let journal = AsyncJournal::with_config(reader, config).context("failed to build journal")?;
    journal.open(OpenMode::System).await?;
    journal.seek_head().await?;

    info!(
        "draining {} entries (capacity {}, poll {} ms)",
        args.entries,
        journal.config().capacity,
        journal.config().poll_interval_ms
    );

    let entries = journal.entries()?;
    let delay = Duration::from_micros(args.consumer_delay_us);
    let start = Instant::now();
    let mut consumed = 0u64;
    while let Some(_entry) = entries.next().await? {
        consumed += 1;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if args.stop_after == Some(consumed) {
            info!("stopping after {consumed} entries");
            entries.close();
        }
    }
    entries.terminated().await;
    let elapsed = start.elapsed();

    let stats = entries.stats();
    let throughput = if elapsed.as_secs_f64() > 0.0 {
        consumed as f64 / elapsed.as_secs_f64()
    } else {
        0.0
    };
    println!("consumed:      {consumed}");
    println!("produced:      {}", stats.produced);
    println!("peak buffered: {} / {}", stats.peak_buffered, stats.capacity);
    println!("reader pulls:  {}", control.pulls());
    println!("elapsed:       {:.3}s ({throughput:.0} entries/sec)", elapsed.as_secs_f64());
    Ok(())
}
