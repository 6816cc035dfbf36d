//! Records exchanged between the engines and the store.
//!
//! Entities reference each other by id only; the service layer fetches and
//! composes them explicitly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{
    ActivityFlags, ActivityId, ActivityType, CohortKey, MapId, NotificationId, RunFlags, RunId,
    SessionId, TrackId, UserId,
};

/// Registered user, as far as the run pipeline cares.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: UserId,
    pub alias: String,
    pub steam_id: String,
}

/// A track of a map. Track 0 is the main track, higher numbers are bonuses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackInfo {
    pub id: TrackId,
    pub track_num: u8,
    pub num_zones: u8,
    /// Difficulty tier, 1 (easiest) upwards.
    pub difficulty: u8,
    /// Linear tracks have no stages; staged tracks have one zone per stage.
    pub is_linear: bool,
}

impl TrackInfo {
    pub fn has_zone(&self, zone_num: u8) -> bool {
        zone_num >= 1 && zone_num <= self.num_zones
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapInfo {
    pub id: MapId,
    pub name: String,
    /// Hash of the map file the replay must have been recorded on.
    pub hash: Option<String>,
    pub tracks: Vec<TrackInfo>,
}

impl MapInfo {
    pub fn track(&self, track_num: u8) -> Option<&TrackInfo> {
        self.tracks.iter().find(|t| t.track_num == track_num)
    }
}

/// Catalog entry used by seeding helpers.
#[derive(Debug, Clone)]
pub struct NewMap {
    pub name: String,
    pub hash: Option<String>,
    pub tracks: Vec<NewTrack>,
}

#[derive(Debug, Clone, Copy)]
pub struct NewTrack {
    pub track_num: u8,
    pub num_zones: u8,
    pub difficulty: u8,
    pub is_linear: bool,
}

/// One in-flight attempt. At most one exists per user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSession {
    pub id: SessionId,
    pub user_id: UserId,
    pub map_id: MapId,
    pub track_id: TrackId,
    pub track_num: u8,
    pub zone_num: u8,
    pub created_at: DateTime<Utc>,
}

impl RunSession {
    /// Individual-zone attempts take no checkpoints.
    pub const fn is_individual_zone(&self) -> bool {
        self.zone_num > 0
    }
}

#[derive(Debug, Clone)]
pub struct NewSession {
    pub user_id: UserId,
    pub map_id: MapId,
    pub track_id: TrackId,
    pub track_num: u8,
    pub zone_num: u8,
}

/// Write-once timestamp for reaching a zone during a full-track session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub session_id: SessionId,
    pub zone: u8,
    pub tick: u32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewRun {
    pub user_id: UserId,
    pub cohort: CohortKey,
    pub ticks: u32,
    pub tick_rate: f64,
    pub hash: String,
    pub file_ref: Option<String>,
}

impl NewRun {
    pub fn time(&self) -> f64 {
        run_time(self.ticks, self.tick_rate)
    }
}

/// A stored attempt. Never modified after insertion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: RunId,
    pub user_id: UserId,
    pub cohort: CohortKey,
    pub ticks: u32,
    pub tick_rate: f64,
    pub time: f64,
    pub hash: String,
    pub file_ref: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl RunRecord {
    pub fn flags(&self) -> RunFlags {
        self.cohort.flags
    }
}

pub fn run_time(ticks: u32, tick_rate: f64) -> f64 {
    ticks as f64 * tick_rate
}

/// A user's standing in one cohort, pointing at their best run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserMapRank {
    pub cohort: CohortKey,
    pub user_id: UserId,
    pub run_id: RunId,
    pub rank: u32,
    pub rank_xp: f64,
}

/// A rank row joined with the ordering fields of the run it points at.
#[derive(Debug, Clone, PartialEq)]
pub struct RankEntry {
    pub rank: UserMapRank,
    pub time: f64,
    pub run_created_at: DateTime<Utc>,
}

/// Rank and reward assignment produced by a recompute.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RankUpdate {
    pub user_id: UserId,
    pub rank: u32,
    pub rank_xp: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackStats {
    pub completions: u64,
    pub unique_completions: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserStats {
    pub runs_submitted: u64,
    pub maps_completed: u64,
    pub cos_xp: u64,
    pub level: u32,
}

impl Default for UserStats {
    fn default() -> Self {
        Self {
            runs_submitted: 0,
            maps_completed: 0,
            cos_xp: 0,
            level: 1,
        }
    }
}

/// Entry in the append-only activity log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Activity {
    pub id: ActivityId,
    pub kind: ActivityType,
    pub user_id: UserId,
    /// Run id for PB/WR activities, map id for map activities.
    pub data: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: NotificationId,
    pub user_id: UserId,
    pub activity_id: ActivityId,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

/// `follower_id` is notified about activities of `followed_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Follow {
    pub follower_id: UserId,
    pub followed_id: UserId,
    pub notify_on: ActivityFlags,
}

/// Per-map subscription, independent of follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapNotify {
    pub user_id: UserId,
    pub map_id: MapId,
    pub notify_on: ActivityFlags,
}

/// Subscriber row returned for fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscriber {
    pub user_id: UserId,
    pub notify_on: ActivityFlags,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_time_is_ticks_times_rate() {
        assert_eq!(run_time(200, 0.5), 100.0);
        assert_eq!(run_time(0, 0.015), 0.0);
    }

    #[test]
    fn track_zone_lookup() {
        let track = TrackInfo {
            id: TrackId(1),
            track_num: 0,
            num_zones: 3,
            difficulty: 2,
            is_linear: false,
        };
        assert!(!track.has_zone(0));
        assert!(track.has_zone(1));
        assert!(track.has_zone(3));
        assert!(!track.has_zone(4));
    }

    #[test]
    fn map_track_lookup_by_number() {
        let map = MapInfo {
            id: MapId(1),
            name: "surf_utopia".into(),
            hash: None,
            tracks: vec![
                TrackInfo {
                    id: TrackId(10),
                    track_num: 0,
                    num_zones: 1,
                    difficulty: 1,
                    is_linear: true,
                },
                TrackInfo {
                    id: TrackId(11),
                    track_num: 1,
                    num_zones: 1,
                    difficulty: 3,
                    is_linear: true,
                },
            ],
        };
        assert_eq!(map.track(1).map(|t| t.id), Some(TrackId(11)));
        assert!(map.track(2).is_none());
    }
}
