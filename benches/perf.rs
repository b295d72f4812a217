use std::sync::Arc;
use std::sync::mpsc;

use chrono::{Duration, FixedOffset, TimeZone, Utc};
use criterion::{BatchSize, Criterion, criterion_group, criterion_main};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use std::hint::black_box;

use livescore_sync::config::SyncConfig;
use livescore_sync::enrich::EnrichmentResolver;
use livescore_sync::fake_feed::{FakeLookup, FakeTransport};
use livescore_sync::feed::{FeedKind, FeedShared};
use livescore_sync::ingest::ChangeIngestor;
use livescore_sync::state::{Delta, MatchPatch, MatchStatus};
use livescore_sync::store::EntityStore;
use livescore_sync::view::{Reference, ViewSpec, project};
use livescore_sync::wire::{RawChange, parse_rows_json};

const STATUSES: [MatchStatus; 4] = [
    MatchStatus::Scheduled,
    MatchStatus::Live,
    MatchStatus::HalfTime,
    MatchStatus::Finished,
];

fn sample_store(size: i64) -> EntityStore {
    let mut rng = StdRng::seed_from_u64(11);
    let base = Utc.with_ymd_and_hms(2025, 8, 16, 12, 0, 0).unwrap();
    let mut store = EntityStore::new();
    for id in 1..=size {
        let status = STATUSES[rng.gen_range(0..STATUSES.len())].clone();
        let patch = MatchPatch {
            start_time: Some(base + Duration::minutes(rng.gen_range(-2880..2880))),
            finished_at: (status == MatchStatus::Finished)
                .then(|| base + Duration::minutes(rng.gen_range(0..600))),
            status: Some(status),
            home_team_id: Some(rng.gen_range(1..40)),
            away_team_id: Some(rng.gen_range(1..40)),
            ..MatchPatch::new(id)
        };
        let _ = store.upsert(patch);
    }
    store
}

fn bench_views_project(c: &mut Criterion) {
    let store = sample_store(800);
    let reference = Reference::new(
        Utc.with_ymd_and_hms(2025, 8, 16, 15, 0, 0).unwrap(),
        FixedOffset::east_opt(3600).unwrap(),
    );
    let specs = [
        ViewSpec::today(),
        ViewSpec::upcoming(),
        ViewSpec::live(),
        ViewSpec::finished(20),
    ];
    c.bench_function("views_project", |b| {
        b.iter(|| {
            for spec in &specs {
                let rows = project(store.all(), black_box(spec), &reference);
                black_box(rows.len());
            }
        })
    });
}

fn burst(size: i64) -> Vec<Delta> {
    let start = Utc.with_ymd_and_hms(2025, 8, 16, 14, 0, 0).unwrap();
    (1..=size)
        .flat_map(|id| {
            [
                Delta::Change(RawChange::insert(
                    "livescores",
                    json!({"id": id, "home_team": "Home", "away_team": "Away",
                           "start_time": start.to_rfc3339(), "status": "NS"}),
                )),
                Delta::Change(RawChange::update(
                    "livescores",
                    json!({"id": id, "status": "LIVE", "minute": 3, "home_score": 1}),
                )),
            ]
        })
        .collect()
}

fn bench_ingest_burst(c: &mut Criterion) {
    let config = SyncConfig::default();
    c.bench_function("ingest_burst", |b| {
        b.iter_batched(
            || {
                let (tx, _rx) = mpsc::channel();
                let shared = Arc::new(FeedShared::with_default_views(
                    FeedKind::Livescores,
                    config.utc_offset,
                    config.finished_limit,
                ));
                let resolver = EnrichmentResolver::new(Arc::new(FakeLookup::default()), 1, tx);
                let ingestor = ChangeIngestor::new(
                    shared,
                    config.source(FeedKind::Livescores),
                    Arc::new(FakeTransport::new()),
                    resolver,
                );
                (ingestor, burst(300))
            },
            |(mut ingestor, deltas)| {
                black_box(ingestor.apply_batch(deltas));
            },
            BatchSize::SmallInput,
        )
    });
}

fn bench_rows_parse(c: &mut Criterion) {
    c.bench_function("rows_parse", |b| {
        b.iter(|| {
            let rows = parse_rows_json(black_box(LIVESCORES_JSON)).unwrap();
            black_box(rows.len());
        })
    });
}

criterion_group!(perf, bench_views_project, bench_ingest_burst, bench_rows_parse);
criterion_main!(perf);

static LIVESCORES_JSON: &str = include_str!("../tests/fixtures/livescores_rows.json");
