use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use chrono::Utc;
use log::info;

use livescore_sync::config::SyncConfig;
use livescore_sync::fake_feed::{
    FakeLookup, FakeTransport, demo_rows, demo_teams, spawn_demo_driver,
};
use livescore_sync::feed::{FeedHealth, FeedKind};
use livescore_sync::lifecycle::{FeedConsumer, SyncHub};
use livescore_sync::rest::RestClient;
use livescore_sync::state::{FeedPhase, MatchRecord};
use livescore_sync::transport::{ChangeFeedTransport, TeamLookup};

const DEMO_TICK: Duration = Duration::from_millis(700);

fn main() -> Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    let _ = dotenvy::from_filename(".env");
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let feed = match parse_string_arg("--feed") {
        Some(raw) => FeedKind::parse(&raw).ok_or_else(|| anyhow!("unknown feed: {raw}"))?,
        None => FeedKind::Livescores,
    };
    let view = parse_string_arg("--view");
    let ticks = parse_u64_arg("--ticks");
    let config = SyncConfig::from_env();

    let (transport, lookup) = if has_flag("--fake") {
        let table = config.source(feed).table;
        let fake = FakeTransport::with_rows(&table, demo_rows(Utc::now()));
        spawn_demo_driver(fake.clone(), table, DEMO_TICK, ticks);
        info!("running against the in-process demo feed");
        let transport: Arc<dyn ChangeFeedTransport> = Arc::new(fake);
        let lookup: Arc<dyn TeamLookup> = Arc::new(FakeLookup::new(demo_teams()));
        (transport, lookup)
    } else {
        let client = Arc::new(RestClient::from_config(&config)?);
        let transport: Arc<dyn ChangeFeedTransport> = client.clone();
        let lookup: Arc<dyn TeamLookup> = client;
        (transport, lookup)
    };

    let hub = SyncHub::new(config, transport, lookup);
    let consumer = hub.attach(feed);
    if let Some(name) = view.as_deref()
        && !consumer.view_names().iter().any(|n| n == name)
    {
        return Err(anyhow!(
            "unknown view {name} for {feed}; available: {}",
            consumer.view_names().join(", ")
        ));
    }

    let mut printed = 0u64;
    while ticks.is_none_or(|limit| printed < limit) {
        if consumer.wait_for_change(Duration::from_secs(1)).is_none() {
            continue;
        }
        print_snapshot(&consumer, view.as_deref());
        printed += 1;
    }

    consumer.detach();
    hub.shutdown();
    Ok(())
}

fn print_snapshot(consumer: &FeedConsumer, only: Option<&str>) {
    let health = consumer.health();
    println!(
        "== {} rev {} [{}] ==",
        consumer.kind(),
        consumer.revision(),
        health_label(&health)
    );
    let names = match only {
        Some(name) => vec![name.to_string()],
        None => consumer.view_names(),
    };
    for name in names {
        let rows = consumer.view(&name).unwrap_or_default();
        println!("{name} ({})", rows.len());
        for record in rows.iter() {
            println!("  {}", format_row(record));
        }
    }
    if let Some(line) = health.logs.back() {
        println!("log: {line}");
    }
}

fn health_label(health: &FeedHealth) -> String {
    let phase = match health.phase {
        FeedPhase::Disconnected => "disconnected",
        FeedPhase::Connecting => "connecting",
        FeedPhase::Subscribed => "subscribed",
    };
    if health.is_degraded() {
        format!("{phase}, degraded")
    } else {
        phase.to_string()
    }
}

fn format_row(record: &MatchRecord) -> String {
    let clock = match record.minute {
        Some(minute) if record.status.is_in_play() => format!("{minute}'"),
        _ => record.start_time.format("%d %b %H:%M").to_string(),
    };
    format!(
        "{:>6} {:<12} {} {}-{} {}  ({})",
        record.id,
        clock,
        record.home_name(),
        record.home_score,
        record.away_score,
        record.away_name(),
        record.status.label()
    )
}

fn parse_string_arg(name: &str) -> Option<String> {
    let args = std::env::args().skip(1).collect::<Vec<_>>();
    for (idx, arg) in args.iter().enumerate() {
        if let Some(raw) = arg.strip_prefix(&format!("{name}="))
            && !raw.trim().is_empty()
        {
            return Some(raw.trim().to_string());
        }
        if arg == name
            && let Some(next) = args.get(idx + 1)
            && !next.trim().is_empty()
        {
            return Some(next.trim().to_string());
        }
    }
    None
}

fn parse_u64_arg(name: &str) -> Option<u64> {
    parse_string_arg(name).and_then(|raw| raw.parse::<u64>().ok())
}

fn has_flag(name: &str) -> bool {
    std::env::args().skip(1).any(|arg| arg == name)
}
