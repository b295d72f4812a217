use chrono::{DateTime, Duration, FixedOffset, NaiveDate, TimeZone, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use livescore_sync::state::{MatchId, MatchPatch, MatchStatus};
use livescore_sync::store::EntityStore;
use livescore_sync::view::{DayRef, Reference, ViewEngine, ViewFilter, ViewSort, ViewSpec, project};

fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
}

fn put(store: &mut EntityStore, id: MatchId, start: DateTime<Utc>, status: MatchStatus) {
    store
        .upsert(MatchPatch {
            start_time: Some(start),
            status: Some(status),
            ..MatchPatch::new(id)
        })
        .expect("upsert");
}

fn reference_at(now: DateTime<Utc>, offset_hours: i32) -> Reference {
    Reference::new(now, FixedOffset::east_opt(offset_hours * 3600).unwrap())
}

fn ids(rows: &[livescore_sync::state::MatchRecord]) -> Vec<MatchId> {
    rows.iter().map(|r| r.id).collect()
}

#[test]
fn today_view_is_ordered_by_start_then_id() {
    let mut rng = StdRng::seed_from_u64(42);
    let mut store = EntityStore::new();
    for id in 1..=60 {
        // Few distinct kickoff slots so ties are common.
        let slot = rng.gen_range(0..6) * 30;
        let day = rng.gen_range(0..2);
        let start = utc(2025, 8, 16 + day, 12, 0) + Duration::minutes(slot);
        put(&mut store, id, start, MatchStatus::Scheduled);
    }
    let reference = reference_at(utc(2025, 8, 16, 9, 0), 0);
    let rows = project(store.all(), &ViewSpec::today(), &reference);

    assert!(!rows.is_empty());
    assert!(rows.iter().all(|r| r.start_time.date_naive() == reference.today()));
    assert!(rows.windows(2).all(|pair| {
        (pair[0].start_time, pair[0].id) < (pair[1].start_time, pair[1].id)
    }));
}

#[test]
fn finished_view_keeps_the_twenty_latest() {
    let mut store = EntityStore::new();
    let base = utc(2025, 8, 16, 12, 0);
    for id in 1..=25 {
        store
            .upsert(MatchPatch {
                start_time: Some(base),
                status: Some(MatchStatus::Finished),
                finished_at: Some(base + Duration::minutes(id)),
                ..MatchPatch::new(id)
            })
            .expect("upsert");
    }
    let reference = reference_at(base, 0);
    let rows = project(store.all(), &ViewSpec::finished(20), &reference);
    assert_eq!(rows.len(), 20);
    assert_eq!(ids(&rows), (6..=25).rev().collect::<Vec<_>>());
}

#[test]
fn day_filters_follow_the_reference_offset() {
    let mut store = EntityStore::new();
    // 23:30 UTC on the 15th is already the 16th at UTC+2.
    put(&mut store, 1, utc(2025, 8, 15, 23, 30), MatchStatus::Scheduled);
    put(&mut store, 2, utc(2025, 8, 16, 18, 0), MatchStatus::Scheduled);
    put(&mut store, 3, utc(2025, 8, 17, 12, 0), MatchStatus::Scheduled);

    let utc_ref = reference_at(utc(2025, 8, 16, 8, 0), 0);
    let cest_ref = reference_at(utc(2025, 8, 16, 8, 0), 2);

    assert_eq!(ids(&project(store.all(), &ViewSpec::today(), &utc_ref)), vec![2]);
    assert_eq!(ids(&project(store.all(), &ViewSpec::today(), &cest_ref)), vec![1, 2]);
    assert_eq!(ids(&project(store.all(), &ViewSpec::tomorrow(), &utc_ref)), vec![3]);

    let fixed = ViewSpec::new(
        ViewFilter::OnDay(DayRef::Date(NaiveDate::from_ymd_opt(2025, 8, 15).unwrap())),
        ViewSort::StartTimeAsc,
    );
    assert_eq!(ids(&project(store.all(), &fixed, &utc_ref)), vec![1]);
}

#[test]
fn upcoming_is_strictly_after_the_reference_instant() {
    let mut store = EntityStore::new();
    let now = utc(2025, 8, 16, 14, 0);
    put(&mut store, 1, now - Duration::minutes(1), MatchStatus::Live);
    put(&mut store, 2, now, MatchStatus::Scheduled);
    put(&mut store, 3, now + Duration::hours(2), MatchStatus::Scheduled);
    put(&mut store, 4, now + Duration::minutes(1), MatchStatus::Scheduled);

    let rows = project(store.all(), &ViewSpec::upcoming(), &reference_at(now, 0));
    assert_eq!(ids(&rows), vec![4, 3]);
}

#[test]
fn combined_filters_and_descending_sorts() {
    let mut store = EntityStore::new();
    let now = utc(2025, 8, 16, 14, 0);
    put(&mut store, 1, now, MatchStatus::Live);
    put(&mut store, 2, now + Duration::hours(1), MatchStatus::HalfTime);
    put(&mut store, 3, now + Duration::hours(1), MatchStatus::Live);
    put(&mut store, 4, now + Duration::hours(2), MatchStatus::Postponed);

    let spec = ViewSpec::new(
        ViewFilter::AllOf(vec![
            ViewFilter::StatusIn(vec![MatchStatus::Live, MatchStatus::HalfTime]),
            ViewFilter::StartsAfter(now),
        ]),
        ViewSort::StartTimeDesc,
    );
    let rows = project(store.all(), &spec, &reference_at(now, 0));
    assert_eq!(ids(&rows), vec![2, 3]);

    let limited = project(store.all(), &ViewSpec::live().with_limit(1), &reference_at(now, 0));
    assert_eq!(ids(&limited), vec![1]);
}

#[test]
fn engine_serves_cached_views_until_refresh() {
    let engine = ViewEngine::new();
    let mut store = EntityStore::new();
    let now = utc(2025, 8, 16, 14, 0);
    put(&mut store, 1, now, MatchStatus::Live);

    let reference = reference_at(now, 0);
    engine.register_and_compute("live", ViewSpec::live(), &store, &reference);
    assert_eq!(ids(&engine.get("live").unwrap()), vec![1]);

    put(&mut store, 2, now - Duration::hours(1), MatchStatus::Live);
    assert_eq!(engine.get("live").unwrap().len(), 1);

    engine.refresh(&store, &reference);
    assert_eq!(ids(&engine.get("live").unwrap()), vec![2, 1]);
    assert_eq!(engine.recompute_count(), 1);
    assert_eq!(engine.names(), vec!["live".to_string()]);
    assert!(engine.get("finished").is_none());
}

#[test]
fn register_and_refresh_can_race() {
    let engine = ViewEngine::new();
    let mut store = EntityStore::new();
    let now = utc(2025, 8, 16, 14, 0);
    put(&mut store, 1, now, MatchStatus::Live);
    let reference = reference_at(now, 0);

    std::thread::scope(|scope| {
        scope.spawn(|| {
            for idx in 0..2_000 {
                engine.register(format!("view-{}", idx % 8), ViewSpec::live());
            }
        });
        for _ in 0..500 {
            engine.refresh(&store, &reference);
        }
    });

    engine.refresh(&store, &reference);
    assert_eq!(engine.names().len(), 8);
    assert_eq!(ids(&engine.get("view-3").unwrap()), vec![1]);
}
