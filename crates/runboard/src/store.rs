//! Persistence seam for every engine.
//!
//! Engines never hold a connection; they borrow a [`StoreTransaction`] for the
//! duration of one unit of work and either commit it or drop it. Dropping an
//! uncommitted transaction discards its writes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::RunboardError;
use crate::model::{
    Activity, Checkpoint, Follow, MapInfo, MapNotify, NewMap, NewRun, NewSession, Notification,
    RankEntry, RankUpdate, RunRecord, RunSession, Subscriber, TrackStats, UserMapRank,
    UserRecord, UserStats,
};
use crate::types::{
    ActivityId, ActivityType, CohortKey, MapId, NotificationId, RunId, SessionId, TrackId, UserId,
};
use crate::xp::XpSystemsConfig;

/// Persisted XP systems document with its version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredXpConfig {
    pub version: u64,
    pub config: XpSystemsConfig,
}

/// Opens transactions against a backing store.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, RunboardError>;
}

/// One unit of work. All reads observe the transaction's own writes.
#[async_trait]
pub trait StoreTransaction: Send {
    // catalog

    async fn insert_user(&mut self, alias: &str, steam_id: &str)
        -> Result<UserRecord, RunboardError>;

    async fn user(&mut self, id: UserId) -> Result<Option<UserRecord>, RunboardError>;

    async fn insert_map(&mut self, map: &NewMap) -> Result<MapInfo, RunboardError>;

    async fn map(&mut self, id: MapId) -> Result<Option<MapInfo>, RunboardError>;

    /// Create or replace the follow edge `follower_id -> followed_id`.
    async fn follow(&mut self, follow: Follow) -> Result<(), RunboardError>;

    /// Create or replace a user's subscription to a map.
    async fn subscribe_map(&mut self, sub: MapNotify) -> Result<(), RunboardError>;

    // sessions

    /// Delete every session owned by `user`, returning how many were removed.
    async fn delete_user_sessions(&mut self, user: UserId) -> Result<u64, RunboardError>;

    async fn insert_session(&mut self, session: &NewSession) -> Result<RunSession, RunboardError>;

    /// The session `id` if it is owned by `user`.
    async fn session(
        &mut self,
        id: SessionId,
        user: UserId,
    ) -> Result<Option<RunSession>, RunboardError>;

    async fn user_session(&mut self, user: UserId) -> Result<Option<RunSession>, RunboardError>;

    /// Delete a session and its checkpoints.
    async fn delete_session(&mut self, id: SessionId) -> Result<(), RunboardError>;

    /// Append a checkpoint. Returns `false` if the zone already has one.
    async fn insert_checkpoint(
        &mut self,
        session: SessionId,
        zone: u8,
        tick: u32,
    ) -> Result<bool, RunboardError>;

    /// Checkpoints of a session ordered by zone.
    async fn checkpoints(&mut self, session: SessionId) -> Result<Vec<Checkpoint>, RunboardError>;

    // runs and ranks

    /// Serialise this transaction against every other transaction touching
    /// `cohort` until commit or rollback.
    async fn lock_cohort(&mut self, cohort: &CohortKey) -> Result<(), RunboardError>;

    /// Fastest time in the cohort, optionally restricted to one user's runs.
    async fn best_time(
        &mut self,
        cohort: &CohortKey,
        user: Option<UserId>,
    ) -> Result<Option<f64>, RunboardError>;

    async fn run_hash_exists(&mut self, user: UserId, hash: &str) -> Result<bool, RunboardError>;

    /// Whether `user` has any run on this map/track/zone, whatever its flags.
    async fn has_completed(
        &mut self,
        user: UserId,
        map: MapId,
        track_num: u8,
        zone_num: u8,
    ) -> Result<bool, RunboardError>;

    async fn insert_run(&mut self, run: &NewRun) -> Result<RunRecord, RunboardError>;

    async fn run(&mut self, id: RunId) -> Result<Option<RunRecord>, RunboardError>;

    /// Point the user's rank row for `cohort` at `run`, creating it with a
    /// provisional rank if absent.
    async fn upsert_rank(
        &mut self,
        cohort: &CohortKey,
        user: UserId,
        run: RunId,
    ) -> Result<(), RunboardError>;

    /// Every rank row in the cohort with its run's ordering fields. Unordered.
    async fn rank_entries(&mut self, cohort: &CohortKey) -> Result<Vec<RankEntry>, RunboardError>;

    async fn update_ranks(
        &mut self,
        cohort: &CohortKey,
        updates: &[RankUpdate],
    ) -> Result<(), RunboardError>;

    async fn rank(
        &mut self,
        cohort: &CohortKey,
        user: UserId,
    ) -> Result<Option<UserMapRank>, RunboardError>;

    // statistics

    /// Count a completion of a track (or one of its zones).
    async fn record_completion(
        &mut self,
        track: TrackId,
        zone_num: u8,
        unique: bool,
    ) -> Result<TrackStats, RunboardError>;

    async fn track_stats(
        &mut self,
        track: TrackId,
        zone_num: u8,
    ) -> Result<TrackStats, RunboardError>;

    async fn user_stats(&mut self, user: UserId) -> Result<UserStats, RunboardError>;

    async fn put_user_stats(
        &mut self,
        user: UserId,
        stats: &UserStats,
    ) -> Result<(), RunboardError>;

    // activities and notifications

    async fn insert_activity(
        &mut self,
        kind: ActivityType,
        user: UserId,
        data: i64,
    ) -> Result<Activity, RunboardError>;

    /// Users following `followed`, with their filters.
    async fn follower_subscribers(
        &mut self,
        followed: UserId,
    ) -> Result<Vec<Subscriber>, RunboardError>;

    /// Users subscribed to `map`, with their filters.
    async fn map_subscribers(&mut self, map: MapId) -> Result<Vec<Subscriber>, RunboardError>;

    /// Insert one notification per recipient. Pairs that already exist are
    /// skipped; returns the number of rows written.
    async fn insert_notifications(
        &mut self,
        activity: ActivityId,
        recipients: &[UserId],
    ) -> Result<u64, RunboardError>;

    /// A user's notifications, newest first.
    async fn notifications(&mut self, user: UserId) -> Result<Vec<Notification>, RunboardError>;

    async fn notification(
        &mut self,
        id: NotificationId,
    ) -> Result<Option<Notification>, RunboardError>;

    async fn set_notification_read(&mut self, id: NotificationId) -> Result<(), RunboardError>;

    // xp systems

    async fn xp_config(&mut self) -> Result<Option<StoredXpConfig>, RunboardError>;

    async fn put_xp_config(&mut self, stored: &StoredXpConfig) -> Result<(), RunboardError>;

    // lifecycle

    async fn commit(self: Box<Self>) -> Result<(), RunboardError>;

    async fn rollback(self: Box<Self>) -> Result<(), RunboardError>;
}
