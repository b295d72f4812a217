use std::env;
use std::time::Duration;

use chrono::{FixedOffset, Offset, Utc};

use crate::feed::{FeedKind, FeedSource};

const DEFAULT_FIXTURES_TABLE: &str = "fixtures";
const DEFAULT_LIVESCORES_TABLE: &str = "livescores";
const DEFAULT_TEAMS_TABLE: &str = "teams";
const DEFAULT_SEASON_NAME: &str = "25/26";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub supabase_url: Option<String>,
    pub supabase_key: Option<String>,
    pub fixtures_table: String,
    pub livescores_table: String,
    pub teams_table: String,
    pub poll_interval: Duration,
    pub enrich_parallelism: usize,
    pub finished_limit: usize,
    pub backoff_min: Duration,
    pub backoff_max: Duration,
    pub utc_offset: FixedOffset,
    pub default_season_name: Option<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds a config from any key lookup; `from_env` passes the process
    /// environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| {
            lookup(key)
                .map(|val| val.trim().to_string())
                .filter(|val| !val.is_empty())
        };
        let parse_u64 = |key: &str| get(key).and_then(|val| val.parse::<u64>().ok());

        let backoff_min = parse_u64("RECONNECT_BACKOFF_MIN_MS")
            .unwrap_or(500)
            .clamp(10, 60_000);
        let backoff_max = parse_u64("RECONNECT_BACKOFF_MAX_MS")
            .unwrap_or(30_000)
            .clamp(backoff_min, 600_000);
        let offset_minutes = get("SYNC_UTC_OFFSET_MINUTES")
            .and_then(|val| val.parse::<i32>().ok())
            .unwrap_or(0)
            .clamp(-14 * 60, 14 * 60);

        Self {
            supabase_url: get("SUPABASE_URL").map(|url| url.trim_end_matches('/').to_string()),
            supabase_key: get("SUPABASE_ANON_KEY"),
            fixtures_table: get("FIXTURES_TABLE").unwrap_or_else(|| DEFAULT_FIXTURES_TABLE.into()),
            livescores_table: get("LIVESCORES_TABLE")
                .unwrap_or_else(|| DEFAULT_LIVESCORES_TABLE.into()),
            teams_table: get("TEAMS_TABLE").unwrap_or_else(|| DEFAULT_TEAMS_TABLE.into()),
            poll_interval: Duration::from_secs(parse_u64("SYNC_POLL_SECS").unwrap_or(15).max(2)),
            enrich_parallelism: parse_u64("ENRICH_PARALLELISM")
                .map(|val| val as usize)
                .unwrap_or(4)
                .clamp(1, 16),
            finished_limit: parse_u64("FINISHED_VIEW_LIMIT")
                .map(|val| val as usize)
                .unwrap_or(20)
                .clamp(1, 200),
            backoff_min: Duration::from_millis(backoff_min),
            backoff_max: Duration::from_millis(backoff_max),
            utc_offset: FixedOffset::east_opt(offset_minutes * 60)
                .unwrap_or_else(|| Utc.fix()),
            default_season_name: Some(
                get("DEFAULT_SEASON_NAME").unwrap_or_else(|| DEFAULT_SEASON_NAME.into()),
            ),
        }
    }

    pub fn source(&self, kind: FeedKind) -> FeedSource {
        match kind {
            FeedKind::Fixtures => FeedSource {
                kind,
                table: self.fixtures_table.clone(),
                select: "*,home_team:home_team_id(id,name,logo),away_team:away_team_id(id,name,logo)"
                    .to_string(),
                default_season_name: self.default_season_name.clone(),
            },
            FeedKind::Livescores => FeedSource {
                kind,
                table: self.livescores_table.clone(),
                select: "*".to_string(),
                default_season_name: None,
            },
        }
    }
}
