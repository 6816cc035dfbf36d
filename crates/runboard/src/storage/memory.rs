use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::RunboardError;
use crate::model::{
    Activity, Checkpoint, Follow, MapInfo, MapNotify, NewMap, NewRun, NewSession, Notification,
    RankEntry, RankUpdate, RunRecord, RunSession, Subscriber, TrackInfo, TrackStats, UserMapRank,
    UserRecord, UserStats,
};
use crate::store::{Store, StoreTransaction, StoredXpConfig};
use crate::types::{
    ActivityId, ActivityType, CohortKey, MapId, NotificationId, RunId, SessionId, TrackId, UserId,
};

/// In-memory store for tests and single-process deployments.
///
/// Transactions are fully serialised: `begin` waits for the previous
/// transaction to finish, works on a copy-on-write view of the tables and
/// swaps the view in on commit.
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
}

/// Each table sits behind its own `Arc`: starting a transaction copies the
/// pointers only, and a write copies just the table it touches.
#[derive(Clone, Default)]
struct Tables {
    next_id: i64,
    users: Arc<HashMap<UserId, UserRecord>>,
    maps: Arc<BTreeMap<MapId, MapInfo>>,
    follows: Arc<HashMap<(UserId, UserId), Follow>>,
    map_notifies: Arc<HashMap<(UserId, MapId), MapNotify>>,
    sessions: Arc<BTreeMap<SessionId, RunSession>>,
    checkpoints: Arc<BTreeMap<(SessionId, u8), Checkpoint>>,
    runs: Arc<BTreeMap<RunId, RunRecord>>,
    ranks: Arc<HashMap<(CohortKey, UserId), UserMapRank>>,
    track_stats: Arc<HashMap<(TrackId, u8), TrackStats>>,
    user_stats: Arc<HashMap<UserId, UserStats>>,
    activities: Arc<BTreeMap<ActivityId, Activity>>,
    notifications: Arc<BTreeMap<NotificationId, Notification>>,
    xp_config: Option<StoredXpConfig>,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, RunboardError> {
        let guard = Arc::clone(&self.tables).lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(MemoryTransaction { guard, working }))
    }
}

struct MemoryTransaction {
    guard: OwnedMutexGuard<Tables>,
    working: Tables,
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn insert_user(
        &mut self,
        alias: &str,
        steam_id: &str,
    ) -> Result<UserRecord, RunboardError> {
        if self.working.users.values().any(|u| u.steam_id == steam_id) {
            return Err(RunboardError::conflict(format!(
                "steam id {steam_id} already registered"
            )));
        }
        let user = UserRecord {
            id: UserId(self.working.next_id()),
            alias: alias.to_string(),
            steam_id: steam_id.to_string(),
        };
        Arc::make_mut(&mut self.working.users).insert(user.id, user.clone());
        Ok(user)
    }

    async fn user(&mut self, id: UserId) -> Result<Option<UserRecord>, RunboardError> {
        Ok(self.working.users.get(&id).cloned())
    }

    async fn insert_map(&mut self, map: &NewMap) -> Result<MapInfo, RunboardError> {
        let id = MapId(self.working.next_id());
        let tracks = map
            .tracks
            .iter()
            .map(|t| TrackInfo {
                id: TrackId(self.working.next_id()),
                track_num: t.track_num,
                num_zones: t.num_zones,
                difficulty: t.difficulty,
                is_linear: t.is_linear,
            })
            .collect();
        let info = MapInfo {
            id,
            name: map.name.clone(),
            hash: map.hash.clone(),
            tracks,
        };
        Arc::make_mut(&mut self.working.maps).insert(id, info.clone());
        Ok(info)
    }

    async fn map(&mut self, id: MapId) -> Result<Option<MapInfo>, RunboardError> {
        Ok(self.working.maps.get(&id).cloned())
    }

    async fn follow(&mut self, follow: Follow) -> Result<(), RunboardError> {
        Arc::make_mut(&mut self.working.follows)
            .insert((follow.follower_id, follow.followed_id), follow);
        Ok(())
    }

    async fn subscribe_map(&mut self, sub: MapNotify) -> Result<(), RunboardError> {
        Arc::make_mut(&mut self.working.map_notifies)
            .insert((sub.user_id, sub.map_id), sub);
        Ok(())
    }

    async fn delete_user_sessions(&mut self, user: UserId) -> Result<u64, RunboardError> {
        let ids: Vec<SessionId> = self
            .working
            .sessions
            .values()
            .filter(|s| s.user_id == user)
            .map(|s| s.id)
            .collect();
        for id in &ids {
            self.delete_session(*id).await?;
        }
        Ok(ids.len() as u64)
    }

    async fn insert_session(&mut self, session: &NewSession) -> Result<RunSession, RunboardError> {
        let record = RunSession {
            id: SessionId(self.working.next_id()),
            user_id: session.user_id,
            map_id: session.map_id,
            track_id: session.track_id,
            track_num: session.track_num,
            zone_num: session.zone_num,
            created_at: Utc::now(),
        };
        Arc::make_mut(&mut self.working.sessions).insert(record.id, record.clone());
        Ok(record)
    }

    async fn session(
        &mut self,
        id: SessionId,
        user: UserId,
    ) -> Result<Option<RunSession>, RunboardError> {
        Ok(self
            .working
            .sessions
            .get(&id)
            .filter(|s| s.user_id == user)
            .cloned())
    }

    async fn user_session(&mut self, user: UserId) -> Result<Option<RunSession>, RunboardError> {
        Ok(self
            .working
            .sessions
            .values()
            .find(|s| s.user_id == user)
            .cloned())
    }

    async fn delete_session(&mut self, id: SessionId) -> Result<(), RunboardError> {
        Arc::make_mut(&mut self.working.sessions).remove(&id);
        Arc::make_mut(&mut self.working.checkpoints).retain(|(sid, _), _| *sid != id);
        Ok(())
    }

    async fn insert_checkpoint(
        &mut self,
        session: SessionId,
        zone: u8,
        tick: u32,
    ) -> Result<bool, RunboardError> {
        let key = (session, zone);
        if self.working.checkpoints.contains_key(&key) {
            return Ok(false);
        }
        Arc::make_mut(&mut self.working.checkpoints).insert(
            key,
            Checkpoint {
                session_id: session,
                zone,
                tick,
                created_at: Utc::now(),
            },
        );
        Ok(true)
    }

    async fn checkpoints(&mut self, session: SessionId) -> Result<Vec<Checkpoint>, RunboardError> {
        Ok(self
            .working
            .checkpoints
            .range((session, 0)..=(session, u8::MAX))
            .map(|(_, c)| *c)
            .collect())
    }

    async fn lock_cohort(&mut self, _cohort: &CohortKey) -> Result<(), RunboardError> {
        // every memory transaction already holds the store-wide lock
        Ok(())
    }

    async fn best_time(
        &mut self,
        cohort: &CohortKey,
        user: Option<UserId>,
    ) -> Result<Option<f64>, RunboardError> {
        Ok(self
            .working
            .runs
            .values()
            .filter(|r| r.cohort == *cohort && user.map_or(true, |u| r.user_id == u))
            .map(|r| r.time)
            .min_by(f64::total_cmp))
    }

    async fn run_hash_exists(&mut self, user: UserId, hash: &str) -> Result<bool, RunboardError> {
        Ok(self
            .working
            .runs
            .values()
            .any(|r| r.user_id == user && r.hash == hash))
    }

    async fn has_completed(
        &mut self,
        user: UserId,
        map: MapId,
        track_num: u8,
        zone_num: u8,
    ) -> Result<bool, RunboardError> {
        Ok(self.working.runs.values().any(|r| {
            r.user_id == user
                && r.cohort.map_id == map
                && r.cohort.track_num == track_num
                && r.cohort.zone_num == zone_num
        }))
    }

    async fn insert_run(&mut self, run: &NewRun) -> Result<RunRecord, RunboardError> {
        let record = RunRecord {
            id: RunId(self.working.next_id()),
            user_id: run.user_id,
            cohort: run.cohort,
            ticks: run.ticks,
            tick_rate: run.tick_rate,
            time: run.time(),
            hash: run.hash.clone(),
            file_ref: run.file_ref.clone(),
            created_at: Utc::now(),
        };
        Arc::make_mut(&mut self.working.runs).insert(record.id, record.clone());
        Ok(record)
    }

    async fn run(&mut self, id: RunId) -> Result<Option<RunRecord>, RunboardError> {
        Ok(self.working.runs.get(&id).cloned())
    }

    async fn upsert_rank(
        &mut self,
        cohort: &CohortKey,
        user: UserId,
        run: RunId,
    ) -> Result<(), RunboardError> {
        Arc::make_mut(&mut self.working.ranks)
            .entry((*cohort, user))
            .and_modify(|r| r.run_id = run)
            .or_insert(UserMapRank {
                cohort: *cohort,
                user_id: user,
                run_id: run,
                rank: 0,
                rank_xp: 0.0,
            });
        Ok(())
    }

    async fn rank_entries(&mut self, cohort: &CohortKey) -> Result<Vec<RankEntry>, RunboardError> {
        self.working
            .ranks
            .values()
            .filter(|r| r.cohort == *cohort)
            .map(|r| {
                let run = self.working.runs.get(&r.run_id).ok_or_else(|| {
                    RunboardError::invalid_state(format!(
                        "rank of user {} points at missing run {}",
                        r.user_id, r.run_id
                    ))
                })?;
                Ok(RankEntry {
                    rank: r.clone(),
                    time: run.time,
                    run_created_at: run.created_at,
                })
            })
            .collect()
    }

    async fn update_ranks(
        &mut self,
        cohort: &CohortKey,
        updates: &[RankUpdate],
    ) -> Result<(), RunboardError> {
        for update in updates {
            let row = Arc::make_mut(&mut self.working.ranks)
                .get_mut(&(*cohort, update.user_id))
                .ok_or_else(|| {
                    RunboardError::not_found(format!("rank of user {} in {cohort}", update.user_id))
                })?;
            row.rank = update.rank;
            row.rank_xp = update.rank_xp;
        }
        Ok(())
    }

    async fn rank(
        &mut self,
        cohort: &CohortKey,
        user: UserId,
    ) -> Result<Option<UserMapRank>, RunboardError> {
        Ok(self.working.ranks.get(&(*cohort, user)).cloned())
    }

    async fn record_completion(
        &mut self,
        track: TrackId,
        zone_num: u8,
        unique: bool,
    ) -> Result<TrackStats, RunboardError> {
        let stats = Arc::make_mut(&mut self.working.track_stats)
            .entry((track, zone_num))
            .or_default();
        stats.completions += 1;
        if unique {
            stats.unique_completions += 1;
        }
        Ok(*stats)
    }

    async fn track_stats(
        &mut self,
        track: TrackId,
        zone_num: u8,
    ) -> Result<TrackStats, RunboardError> {
        Ok(self
            .working
            .track_stats
            .get(&(track, zone_num))
            .copied()
            .unwrap_or_default())
    }

    async fn user_stats(&mut self, user: UserId) -> Result<UserStats, RunboardError> {
        Ok(self
            .working
            .user_stats
            .get(&user)
            .copied()
            .unwrap_or_default())
    }

    async fn put_user_stats(
        &mut self,
        user: UserId,
        stats: &UserStats,
    ) -> Result<(), RunboardError> {
        Arc::make_mut(&mut self.working.user_stats).insert(user, *stats);
        Ok(())
    }

    async fn insert_activity(
        &mut self,
        kind: ActivityType,
        user: UserId,
        data: i64,
    ) -> Result<Activity, RunboardError> {
        let activity = Activity {
            id: ActivityId(self.working.next_id()),
            kind,
            user_id: user,
            data,
            created_at: Utc::now(),
        };
        Arc::make_mut(&mut self.working.activities).insert(activity.id, activity.clone());
        Ok(activity)
    }

    async fn follower_subscribers(
        &mut self,
        followed: UserId,
    ) -> Result<Vec<Subscriber>, RunboardError> {
        Ok(self
            .working
            .follows
            .values()
            .filter(|f| f.followed_id == followed)
            .map(|f| Subscriber {
                user_id: f.follower_id,
                notify_on: f.notify_on,
            })
            .collect())
    }

    async fn map_subscribers(&mut self, map: MapId) -> Result<Vec<Subscriber>, RunboardError> {
        Ok(self
            .working
            .map_notifies
            .values()
            .filter(|n| n.map_id == map)
            .map(|n| Subscriber {
                user_id: n.user_id,
                notify_on: n.notify_on,
            })
            .collect())
    }

    async fn insert_notifications(
        &mut self,
        activity: ActivityId,
        recipients: &[UserId],
    ) -> Result<u64, RunboardError> {
        let existing: HashSet<UserId> = self
            .working
            .notifications
            .values()
            .filter(|n| n.activity_id == activity)
            .map(|n| n.user_id)
            .collect();
        let mut seen = HashSet::new();
        let mut written = 0;
        for user in recipients {
            if existing.contains(user) || !seen.insert(*user) {
                continue;
            }
            let notification = Notification {
                id: NotificationId(self.working.next_id()),
                user_id: *user,
                activity_id: activity,
                read: false,
                created_at: Utc::now(),
            };
            Arc::make_mut(&mut self.working.notifications).insert(notification.id, notification);
            written += 1;
        }
        Ok(written)
    }

    async fn notifications(&mut self, user: UserId) -> Result<Vec<Notification>, RunboardError> {
        Ok(self
            .working
            .notifications
            .values()
            .rev()
            .filter(|n| n.user_id == user)
            .cloned()
            .collect())
    }

    async fn notification(
        &mut self,
        id: NotificationId,
    ) -> Result<Option<Notification>, RunboardError> {
        Ok(self.working.notifications.get(&id).cloned())
    }

    async fn set_notification_read(&mut self, id: NotificationId) -> Result<(), RunboardError> {
        if let Some(n) = Arc::make_mut(&mut self.working.notifications).get_mut(&id) {
            n.read = true;
        }
        Ok(())
    }

    async fn xp_config(&mut self) -> Result<Option<StoredXpConfig>, RunboardError> {
        Ok(self.working.xp_config.clone())
    }

    async fn put_xp_config(&mut self, stored: &StoredXpConfig) -> Result<(), RunboardError> {
        self.working.xp_config = Some(stored.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), RunboardError> {
        let Self { mut guard, working } = *self;
        *guard = working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), RunboardError> {
        Ok(())
    }
}
