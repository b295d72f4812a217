use std::fs;
use std::path::PathBuf;

use chrono::{TimeZone, Utc};

use livescore_sync::error::SyncError;
use livescore_sync::state::{ChangeEvent, MatchStatus};
use livescore_sync::wire::{RawChange, parse_match_row, parse_rows_json, parse_team_rows_json};

fn read_fixture(name: &str) -> String {
    let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    path.push("tests");
    path.push("fixtures");
    path.push(name);
    fs::read_to_string(path).expect("fixture file should be readable")
}

#[test]
fn parses_fixtures_rows_with_joined_teams() {
    let raw = read_fixture("fixtures_rows.json");
    let rows = parse_rows_json(&raw).expect("fixture should parse");
    assert_eq!(rows.len(), 3);

    let first = parse_match_row(&rows[0]).expect("row should parse");
    assert_eq!(first.patch.id, 19135001);
    assert_eq!(first.patch.home_team_name.as_deref(), Some("Arsenal"));
    assert_eq!(
        first.patch.away_logo.as_deref(),
        Some("https://cdn.example/teams/8.png")
    );
    assert_eq!(
        first.patch.start_time,
        Some(Utc.with_ymd_and_hms(2025, 8, 16, 14, 0, 0).unwrap())
    );
    assert_eq!(first.patch.season_name, None);
    assert_eq!(first.patch.venue_city.as_deref(), Some("London"));
    assert_eq!(first.teams.len(), 2);

    let second = parse_match_row(&rows[1]).expect("row should parse");
    assert_eq!(second.patch.home_logo, None);
    assert_eq!(second.patch.away_team_name, None);
    assert_eq!(second.teams.len(), 1);
    assert_eq!(second.patch.season_name.as_deref(), Some("2025/2026"));
}

#[test]
fn accepts_string_ids_and_starting_at_alias() {
    let raw = read_fixture("fixtures_rows.json");
    let rows = parse_rows_json(&raw).expect("fixture should parse");
    let third = parse_match_row(&rows[2]).expect("row should parse");
    assert_eq!(third.patch.id, 19135003);
    assert_eq!(third.patch.home_team_id, Some(11));
    assert_eq!(third.patch.status, Some(MatchStatus::Scheduled));
    assert_eq!(
        third.patch.start_time,
        Some(Utc.with_ymd_and_hms(2025, 8, 17, 13, 0, 0).unwrap())
    );
    assert!(third.teams.is_empty());
}

#[test]
fn parses_livescores_rows() {
    let raw = read_fixture("livescores_rows.json");
    let rows = parse_rows_json(&raw).expect("fixture should parse");
    let live = parse_match_row(&rows[0]).expect("row should parse");
    assert_eq!(live.patch.status, Some(MatchStatus::Live));
    assert_eq!(live.patch.minute, Some(37));
    assert_eq!(live.patch.home_team_name.as_deref(), Some("Arsenal"));
    assert!(live.teams.is_empty());

    let finished = parse_match_row(&rows[1]).expect("row should parse");
    assert_eq!(finished.patch.status, Some(MatchStatus::Finished));
    assert_eq!(finished.patch.home_team_name, None);
    assert_eq!(
        finished.patch.finished_at,
        Some(Utc.with_ymd_and_hms(2025, 8, 16, 13, 20, 41).unwrap())
    );
}

#[test]
fn parses_change_envelopes() {
    let raw = read_fixture("change_events.json");
    let values: Vec<serde_json::Value> = serde_json::from_str(&raw).expect("fixture json");
    let events: Vec<_> = values
        .iter()
        .map(|value| {
            serde_json::from_value::<RawChange>(value.clone()).expect("envelope should parse")
        })
        .collect();
    assert_eq!(events.len(), 4);

    match events[0].clone().into_event().expect("insert") {
        ChangeEvent::Insert(row) => {
            assert_eq!(row.patch.id, 601);
            assert_eq!(
                row.patch.updated_at,
                Some(Utc.with_ymd_and_hms(2025, 8, 16, 14, 0, 1).unwrap())
            );
        }
        other => panic!("expected insert, got {other:?}"),
    }
    match events[1].clone().into_event().expect("update") {
        ChangeEvent::Update(row) => {
            assert_eq!(row.patch.status, Some(MatchStatus::Live));
            assert_eq!(row.patch.minute, Some(12));
            assert_eq!(row.patch.home_logo, None);
            assert_eq!(row.patch.start_time, None);
        }
        other => panic!("expected update, got {other:?}"),
    }
    assert_eq!(
        events[2].clone().into_event().expect("delete"),
        ChangeEvent::Delete(601)
    );
    assert!(matches!(
        events[3].clone().into_event(),
        Err(SyncError::MalformedEvent(_))
    ));
}

#[test]
fn team_rows_drop_blank_fields() {
    let raw = read_fixture("teams.json");
    let teams = parse_team_rows_json(&raw).expect("fixture should parse");
    assert_eq!(teams.len(), 3);
    assert_eq!(teams[1].0, 8);
    assert_eq!(teams[1].1.name.as_deref(), Some("Liverpool"));
    assert_eq!(teams[1].1.logo, None);
    assert_eq!(teams[2].1.logo, None);
}

#[test]
fn team_rows_without_id_are_skipped() {
    let teams = parse_team_rows_json(r#"[{"name": "Nobody"}, {"id": 3, "name": "Liverpool"}]"#)
        .expect("rows should parse");
    assert_eq!(teams.len(), 1);
    assert_eq!(teams[0].0, 3);
}

#[test]
fn null_bodies_are_empty() {
    assert!(parse_rows_json("null").expect("null should parse").is_empty());
    assert!(parse_rows_json("  ").expect("blank should parse").is_empty());
    assert!(parse_team_rows_json("null").expect("null should parse").is_empty());
    assert!(parse_rows_json("{not json").is_err());
}
