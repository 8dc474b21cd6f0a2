//! Ping frequency tool: counts `Ping()` events on the configured contract per
//! hour (last 24h), per day (last 7 days) and per week (last 4 weeks), and
//! appends the results to `PingEvents.log`.
//!
//! Usage:
//!   cargo run --bin ping_stats
//!
//! Reads HTTP_PROVIDER_URL and CONTRACT_ADDRESS from the environment / `.env`.

use alloy::primitives::Address;
use alloy::providers::{Provider, RootProvider};
use alloy::rpc::types::Filter;
use anyhow::Context;
use chrono::Utc;
use pongbot::config::Config;
use pongbot::onchain::abi::PING_TOPIC;
use std::io::Write;

// ─── Constants ───────────────────────────────────────────────────────────────

const LOG_FILE: &str = "PingEvents.log";

/// Post-merge slot time.
const SECONDS_PER_BLOCK: u64 = 12;
const BLOCKS_PER_HOUR: u64 = 3_600 / SECONDS_PER_BLOCK;
const BLOCKS_PER_DAY: u64 = BLOCKS_PER_HOUR * 24;
const BLOCKS_PER_WEEK: u64 = BLOCKS_PER_DAY * 7;

struct Period {
    label: &'static str,
    adjective: &'static str,
    count: usize,
    blocks: u64,
}

const PERIODS: [Period; 3] = [
    Period {
        label: "Hour",
        adjective: "Hourly",
        count: 24,
        blocks: BLOCKS_PER_HOUR,
    },
    Period {
        label: "Day",
        adjective: "Daily",
        count: 7,
        blocks: BLOCKS_PER_DAY,
    },
    Period {
        label: "Week",
        adjective: "Weekly",
        count: 4,
        blocks: BLOCKS_PER_WEEK,
    },
];

// ─── Main ────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let config = Config::from_env()?;
    if config.chain.http_url.is_empty() {
        anyhow::bail!("HTTP_PROVIDER_URL is not set");
    }
    let contract = config.contract_address()?;
    let chunk = config.ingest.max_block_range.max(1);

    let provider = RootProvider::new_http(config.chain.http_url.parse()?);
    let latest = provider
        .get_block_number()
        .await
        .context("failed to reach RPC")?;
    println!("[+] Connected, latest block {latest}");

    let mut log = LogFile::open(LOG_FILE)?;
    let mut totals = Vec::with_capacity(PERIODS.len());

    for period in &PERIODS {
        log.write(&format!(
            "Fetching {} Ping events for the last {} {}s...",
            period.adjective.to_lowercase(),
            period.count,
            period.label.to_lowercase()
        ))?;

        let mut total = 0usize;
        let ranges = period_ranges(latest, period.count, period.blocks);
        for (i, (from, to)) in ranges.iter().enumerate() {
            let events = count_pings(&provider, contract, *from, *to, chunk).await?;
            // Oldest window gets the lowest number.
            log.write(&format!(
                "{} {}: {} events",
                period.label,
                period.count - 1 - i,
                events
            ))?;
            total += events;
        }
        totals.push((period, total));
    }

    log.write("Summary:")?;
    for (period, total) in totals {
        log.write(&format!(
            "{} Ping Events (last {} {}s): {}",
            period.adjective,
            period.count,
            period.label.to_lowercase(),
            total
        ))?;
    }
    println!("[+] Results appended to {LOG_FILE}");
    Ok(())
}

/// `count` consecutive windows of `blocks` each, newest first, ending at
/// `latest`. Windows are half-open on the old side so no block is counted
/// twice.
fn period_ranges(latest: u64, count: usize, blocks: u64) -> Vec<(u64, u64)> {
    (0..count as u64)
        .filter_map(|i| {
            let to = latest.checked_sub(blocks * i)?;
            let from = latest.saturating_sub(blocks * (i + 1)) + 1;
            (from <= to).then_some((from, to))
        })
        .collect()
}

/// Count `Ping()` logs in `[from, to]`, querying at most `chunk` blocks at a
/// time.
async fn count_pings(
    provider: &RootProvider,
    contract: Address,
    from: u64,
    to: u64,
    chunk: u64,
) -> anyhow::Result<usize> {
    let base = Filter::new().address(contract).event_signature(PING_TOPIC);
    let mut count = 0;
    let mut start = from;
    while start <= to {
        let end = (start + chunk - 1).min(to);
        let filter = base.clone().from_block(start).to_block(end);
        count += provider
            .get_logs(&filter)
            .await
            .with_context(|| format!("get_logs {start}..{end}"))?
            .len();
        start = end + 1;
    }
    Ok(count)
}

struct LogFile {
    file: std::fs::File,
}

impl LogFile {
    fn open(path: &str) -> anyhow::Result<Self> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open {path}"))?;
        Ok(Self { file })
    }

    fn write(&mut self, message: &str) -> anyhow::Result<()> {
        println!("{message}");
        writeln!(self.file, "{}: {}", Utc::now().to_rfc3339(), message)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_period_ranges_are_adjacent_and_newest_first() {
        let ranges = period_ranges(1_000, 3, 100);
        assert_eq!(ranges, vec![(901, 1_000), (801, 900), (701, 800)]);
    }

    #[test]
    fn test_period_ranges_stop_at_genesis() {
        let ranges = period_ranges(150, 4, 100);
        assert_eq!(ranges, vec![(51, 150), (1, 50)]);
    }

    #[test]
    fn test_blocks_per_period() {
        assert_eq!(BLOCKS_PER_HOUR, 300);
        assert_eq!(BLOCKS_PER_DAY, 7_200);
        assert_eq!(BLOCKS_PER_WEEK, 50_400);
    }
}
