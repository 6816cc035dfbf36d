//! Ranked leaderboard per cohort.
//!
//! A submission runs as one transaction holding the cohort lock: personal-best
//! and world-record detection, run insertion, rank upsert, dense re-ranking and
//! the XP and statistics bookkeeping all commit or roll back together.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};

use crate::error::RunboardError;
use crate::metrics::RunboardMetrics;
use crate::model::{
    MapInfo, NewRun, RankEntry, RankUpdate, RunRecord, TrackInfo, UserMapRank, UserStats,
};
use crate::store::{Store, StoreTransaction};
use crate::types::{CohortKey, UserId};
use crate::xp::{CompletionEvent, CosXpGain, XpGain, XpSnapshot, XpSystems};

/// Result of one submission.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitOutcome {
    pub run: RunRecord,
    pub is_new_personal_best: bool,
    /// Always implies `is_new_personal_best`.
    pub is_new_world_record: bool,
    /// The submitter's rank row after the submission.
    pub rank: Option<UserMapRank>,
    pub xp: XpGain,
    pub stats: UserStats,
}

pub struct LeaderboardEngine {
    store: Arc<dyn Store>,
    xp: Arc<XpSystems>,
    metrics: Arc<RunboardMetrics>,
}

/// Dense ranking order: fastest first, then earliest run, then lowest run id.
pub fn sort_for_ranking(entries: &mut [RankEntry]) {
    entries.sort_by(|a, b| {
        a.time
            .total_cmp(&b.time)
            .then(a.run_created_at.cmp(&b.run_created_at))
            .then(a.rank.run_id.cmp(&b.rank.run_id))
    });
}

impl LeaderboardEngine {
    pub fn new(store: Arc<dyn Store>, xp: Arc<XpSystems>, metrics: Arc<RunboardMetrics>) -> Self {
        Self { store, xp, metrics }
    }

    /// Submit a run in its own transaction.
    pub async fn submit(&self, run: NewRun) -> Result<SubmitOutcome, RunboardError> {
        let mut tx = self.store.begin().await?;
        let map = tx.map(run.cohort.map_id).await?.ok_or_else(|| {
            RunboardError::validation(format!("map {} does not exist", run.cohort.map_id))
        })?;
        let track = map
            .track(run.cohort.track_num)
            .cloned()
            .ok_or_else(|| {
                RunboardError::validation(format!(
                    "map {} has no track {}",
                    map.id, run.cohort.track_num
                ))
            })?;

        let outcome = self.submit_in(tx.as_mut(), &map, &track, run).await?;
        tx.commit().await?;
        self.record_committed(&outcome);
        Ok(outcome)
    }

    /// Submit a run inside a caller-owned transaction.
    ///
    /// Call [`LeaderboardEngine::record_committed`] once the transaction has
    /// committed.
    pub async fn submit_in(
        &self,
        tx: &mut dyn StoreTransaction,
        map: &MapInfo,
        track: &TrackInfo,
        run: NewRun,
    ) -> Result<SubmitOutcome, RunboardError> {
        let cohort = run.cohort;
        if cohort.map_id != map.id || cohort.track_num != track.track_num {
            return Err(RunboardError::validation(format!(
                "{cohort} does not belong to map {} track {}",
                map.id, track.track_num
            )));
        }
        if cohort.zone_num > 0 && !track.has_zone(cohort.zone_num) {
            return Err(RunboardError::validation(format!(
                "track {} of map {} has no zone {}",
                track.track_num, map.id, cohort.zone_num
            )));
        }
        let time = run.time();
        if !(time.is_finite() && time > 0.0) {
            return Err(RunboardError::validation(format!(
                "run time must be positive, got {time}"
            )));
        }

        // one in-flight submission per cohort past this point
        tx.lock_cohort(&cohort).await?;
        let snapshot = self.xp.snapshot();

        if tx.run_hash_exists(run.user_id, &run.hash).await? {
            return Err(RunboardError::conflict(format!(
                "run {} was already submitted by user {}",
                run.hash, run.user_id
            )));
        }

        let cohort_best = tx.best_time(&cohort, None).await?;
        let user_best = tx.best_time(&cohort, Some(run.user_id)).await?;
        let is_new_personal_best = user_best.map_or(true, |best| time < best);
        let is_new_world_record =
            is_new_personal_best && cohort_best.map_or(true, |best| time < best);

        let unique = !tx
            .has_completed(run.user_id, map.id, cohort.track_num, cohort.zone_num)
            .await?;

        let record = tx.insert_run(&run).await?;
        tx.record_completion(track.id, cohort.zone_num, unique)
            .await?;

        if is_new_personal_best {
            tx.upsert_rank(&cohort, record.user_id, record.id).await?;
            self.recompute_in(tx, &cohort, track.difficulty, &snapshot)
                .await?;
        }
        let rank = tx.rank(&cohort, record.user_id).await?;

        let event = CompletionEvent {
            tier: track.difficulty,
            is_linear: track.is_linear,
            is_bonus: cohort.track_num > 0,
            is_unique: unique,
            is_stage: cohort.zone_num > 0,
        };
        let cos_gain = snapshot.completion_xp(&event);
        let old = tx.user_stats(record.user_id).await?;
        let gain_lvl = snapshot.levels.levels_gained(old.cos_xp, cos_gain, old.level);
        let stats = UserStats {
            runs_submitted: old.runs_submitted + 1,
            maps_completed: old.maps_completed
                + u64::from(unique && cohort.track_num == 0 && cohort.zone_num == 0),
            cos_xp: old.cos_xp.saturating_add(cos_gain),
            level: old.level + gain_lvl,
        };
        tx.put_user_stats(record.user_id, &stats).await?;

        let rank_xp = match (&rank, is_new_personal_best) {
            (Some(rank), true) => rank.rank_xp,
            _ => 0.0,
        };

        debug!(
            run_id = %record.id,
            user_id = %record.user_id,
            cohort = %cohort,
            time,
            is_new_personal_best,
            is_new_world_record,
            "run stored"
        );

        Ok(SubmitOutcome {
            run: record,
            is_new_personal_best,
            is_new_world_record,
            rank,
            xp: XpGain {
                rank_xp,
                cos_xp: CosXpGain {
                    gain_lvl,
                    old_xp: old.cos_xp,
                    gain_xp: cos_gain,
                },
            },
            stats,
        })
    }

    /// Post-commit bookkeeping for a submission.
    pub fn record_committed(&self, outcome: &SubmitOutcome) {
        self.metrics.runs_submitted.inc();
        if outcome.is_new_personal_best {
            self.metrics.personal_bests.inc();
            self.xp.rank_cache().invalidate(&outcome.run.cohort);
        }
        if outcome.is_new_world_record {
            self.metrics.world_records.inc();
            info!(
                run_id = %outcome.run.id,
                user_id = %outcome.run.user_id,
                cohort = %outcome.run.cohort,
                time = outcome.run.time,
                "new world record"
            );
        } else if outcome.is_new_personal_best {
            info!(
                run_id = %outcome.run.id,
                user_id = %outcome.run.user_id,
                cohort = %outcome.run.cohort,
                "new personal best"
            );
        }
    }

    /// Rewrite dense ranks and rank XP for every row in the cohort.
    async fn recompute_in(
        &self,
        tx: &mut dyn StoreTransaction,
        cohort: &CohortKey,
        tier: u8,
        snapshot: &XpSnapshot,
    ) -> Result<(), RunboardError> {
        let mut entries = tx.rank_entries(cohort).await?;
        sort_for_ranking(&mut entries);

        let ranking: Vec<UserId> = entries.iter().map(|e| e.rank.user_id).collect();
        let awards = snapshot.rank_xp(tier, &ranking);

        let updates: Vec<RankUpdate> = entries
            .iter()
            .enumerate()
            .filter_map(|(i, entry)| {
                let rank = i as u32 + 1;
                let rank_xp = awards.get(&entry.rank.user_id).copied().unwrap_or(0.0);
                let changed = entry.rank.rank != rank || entry.rank.rank_xp != rank_xp;
                changed.then_some(RankUpdate {
                    user_id: entry.rank.user_id,
                    rank,
                    rank_xp,
                })
            })
            .collect();

        debug!(
            cohort = %cohort,
            ranked = entries.len(),
            changed = updates.len(),
            "re-ranked cohort"
        );
        tx.update_ranks(cohort, &updates).await
    }

    /// Cohort rows ordered by rank.
    async fn ranked(&self, cohort: &CohortKey) -> Result<Vec<UserMapRank>, RunboardError> {
        let mut tx = self.store.begin().await?;
        let mut entries = tx.rank_entries(cohort).await?;
        tx.rollback().await?;
        sort_for_ranking(&mut entries);
        Ok(entries.into_iter().map(|e| e.rank).collect())
    }

    /// The best `limit` entries of a cohort.
    pub async fn top(
        &self,
        cohort: &CohortKey,
        limit: usize,
    ) -> Result<Vec<UserMapRank>, RunboardError> {
        let mut ranks = self.ranked(cohort).await?;
        ranks.truncate(limit);
        Ok(ranks)
    }

    /// Up to `window` entries either side of `user`'s rank.
    pub async fn around(
        &self,
        cohort: &CohortKey,
        user: UserId,
        window: usize,
    ) -> Result<Vec<UserMapRank>, RunboardError> {
        let ranks = self.ranked(cohort).await?;
        let pos = ranks
            .iter()
            .position(|r| r.user_id == user)
            .ok_or_else(|| RunboardError::not_found(format!("rank of user {user} in {cohort}")))?;
        let start = pos.saturating_sub(window);
        let end = (pos + window + 1).min(ranks.len());
        Ok(ranks[start..end].to_vec())
    }

    pub async fn rank_for(
        &self,
        cohort: &CohortKey,
        user: UserId,
    ) -> Result<Option<UserMapRank>, RunboardError> {
        let mut tx = self.store.begin().await?;
        let rank = tx.rank(cohort, user).await?;
        tx.rollback().await?;
        Ok(rank)
    }

    /// Rank XP for the cohort under the active config, cached until the
    /// cohort is re-ranked or the config changes.
    pub async fn rank_xp(
        &self,
        cohort: &CohortKey,
    ) -> Result<Arc<HashMap<UserId, f64>>, RunboardError> {
        let snapshot = self.xp.snapshot();
        let cache = self.xp.rank_cache();
        if let Some(hit) = cache.get(cohort, snapshot.version) {
            return Ok(hit);
        }
        let generation = cache.generation(cohort);

        let mut tx = self.store.begin().await?;
        let map = tx
            .map(cohort.map_id)
            .await?
            .ok_or_else(|| RunboardError::not_found(format!("map {}", cohort.map_id)))?;
        let mut entries = tx.rank_entries(cohort).await?;
        tx.rollback().await?;

        let tier = map
            .track(cohort.track_num)
            .map(|t| t.difficulty)
            .ok_or_else(|| {
                RunboardError::not_found(format!("track {} of map {}", cohort.track_num, map.id))
            })?;
        sort_for_ranking(&mut entries);
        let ranking: Vec<UserId> = entries.iter().map(|e| e.rank.user_id).collect();
        let awards = Arc::new(snapshot.rank_xp(tier, &ranking));
        if !cache.insert(*cohort, snapshot.version, generation, Arc::clone(&awards)) {
            debug!(cohort = %cohort, "cohort re-ranked during rank xp read, not caching");
        }
        Ok(awards)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NewMap, NewTrack};
    use crate::storage::MemoryStore;
    use crate::types::{MapId, RunFlags};

    struct Fixture {
        store: Arc<MemoryStore>,
        engine: LeaderboardEngine,
        map: MapInfo,
        users: Vec<UserId>,
    }

    async fn fixture(users: usize) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let mut tx = store.begin().await.unwrap();
        let map = tx
            .insert_map(&NewMap {
                name: "kz_summit".into(),
                hash: None,
                tracks: vec![
                    NewTrack {
                        track_num: 0,
                        num_zones: 4,
                        difficulty: 3,
                        is_linear: false,
                    },
                    NewTrack {
                        track_num: 1,
                        num_zones: 1,
                        difficulty: 2,
                        is_linear: true,
                    },
                ],
            })
            .await
            .unwrap();
        let mut ids = Vec::new();
        for i in 0..users {
            let user = tx
                .insert_user(&format!("user{i}"), &format!("STEAM_{i}"))
                .await
                .unwrap();
            ids.push(user.id);
        }
        tx.commit().await.unwrap();

        let engine = LeaderboardEngine::new(
            store.clone(),
            Arc::new(XpSystems::with_defaults().unwrap()),
            Arc::new(RunboardMetrics::unregistered()),
        );
        Fixture {
            store,
            engine,
            map,
            users: ids,
        }
    }

    fn run(user: UserId, cohort: CohortKey, ticks: u32) -> NewRun {
        NewRun {
            user_id: user,
            cohort,
            ticks,
            tick_rate: 1.0,
            hash: format!("{user}-{cohort}-{ticks}"),
            file_ref: None,
        }
    }

    #[tokio::test]
    async fn first_run_is_world_record() {
        let f = fixture(1).await;
        let cohort = CohortKey::track(f.map.id, 0);
        let outcome = f.engine.submit(run(f.users[0], cohort, 200)).await.unwrap();
        assert!(outcome.is_new_personal_best);
        assert!(outcome.is_new_world_record);
        assert_eq!(outcome.rank.as_ref().map(|r| r.rank), Some(1));
        assert!(outcome.xp.rank_xp > 0.0);
        assert!(outcome.xp.cos_xp.gain_xp > 0);
        assert_eq!(outcome.stats.runs_submitted, 1);
        assert_eq!(outcome.stats.maps_completed, 1);
    }

    #[tokio::test]
    async fn slower_run_is_neither_pb_nor_wr() {
        let f = fixture(1).await;
        let cohort = CohortKey::track(f.map.id, 0);
        let first = f.engine.submit(run(f.users[0], cohort, 200)).await.unwrap();
        let second = f.engine.submit(run(f.users[0], cohort, 250)).await.unwrap();
        assert!(!second.is_new_personal_best);
        assert!(!second.is_new_world_record);
        assert_eq!(second.xp.rank_xp, 0.0);
        assert_eq!(second.rank.unwrap().run_id, first.run.id);
        assert_eq!(second.stats.maps_completed, 1);
        assert!(second.xp.cos_xp.gain_xp < first.xp.cos_xp.gain_xp);
    }

    #[tokio::test]
    async fn pb_behind_leader_is_not_wr() {
        let f = fixture(2).await;
        let cohort = CohortKey::track(f.map.id, 0);
        f.engine.submit(run(f.users[0], cohort, 100)).await.unwrap();
        let outcome = f.engine.submit(run(f.users[1], cohort, 150)).await.unwrap();
        assert!(outcome.is_new_personal_best);
        assert!(!outcome.is_new_world_record);
        assert_eq!(outcome.rank.unwrap().rank, 2);
    }

    #[tokio::test]
    async fn equal_time_does_not_take_record() {
        let f = fixture(2).await;
        let cohort = CohortKey::track(f.map.id, 0);
        f.engine.submit(run(f.users[0], cohort, 100)).await.unwrap();
        let outcome = f.engine.submit(run(f.users[1], cohort, 100)).await.unwrap();
        assert!(outcome.is_new_personal_best);
        assert!(!outcome.is_new_world_record);
    }

    #[tokio::test]
    async fn cohorts_are_isolated_by_flags() {
        let f = fixture(2).await;
        let normal = CohortKey::track(f.map.id, 0);
        let backwards = CohortKey::new(f.map.id, 0, 0, RunFlags::BACKWARDS);
        f.engine.submit(run(f.users[0], normal, 100)).await.unwrap();
        let outcome = f
            .engine
            .submit(run(f.users[1], backwards, 500))
            .await
            .unwrap();
        assert!(outcome.is_new_world_record);
        assert_eq!(f.engine.top(&backwards, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_hash_conflicts_and_rolls_back() {
        let f = fixture(1).await;
        let cohort = CohortKey::track(f.map.id, 0);
        f.engine.submit(run(f.users[0], cohort, 100)).await.unwrap();
        let err = f
            .engine
            .submit(run(f.users[0], cohort, 100))
            .await
            .unwrap_err();
        assert!(matches!(err, RunboardError::Conflict { .. }));

        let mut tx = f.store.begin().await.unwrap();
        let stats = tx.user_stats(f.users[0]).await.unwrap();
        assert_eq!(stats.runs_submitted, 1);
    }

    #[tokio::test]
    async fn unknown_map_or_track_is_validation_error() {
        let f = fixture(1).await;
        let err = f
            .engine
            .submit(run(f.users[0], CohortKey::track(MapId(999), 0), 100))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 400);

        let err = f
            .engine
            .submit(run(f.users[0], CohortKey::track(f.map.id, 7), 100))
            .await
            .unwrap_err();
        assert!(matches!(err, RunboardError::Validation { .. }));

        let err = f
            .engine
            .submit(run(f.users[0], CohortKey::new(f.map.id, 0, 9, RunFlags::empty()), 100))
            .await
            .unwrap_err();
        assert!(matches!(err, RunboardError::Validation { .. }));
    }

    #[tokio::test]
    async fn zero_time_is_rejected() {
        let f = fixture(1).await;
        let err = f
            .engine
            .submit(run(f.users[0], CohortKey::track(f.map.id, 0), 0))
            .await
            .unwrap_err();
        assert!(matches!(err, RunboardError::Validation { .. }));
    }

    #[tokio::test]
    async fn around_returns_neighbourhood() {
        let f = fixture(7).await;
        let cohort = CohortKey::track(f.map.id, 1);
        for (i, user) in f.users.iter().enumerate() {
            f.engine
                .submit(run(*user, cohort, 100 + i as u32 * 10))
                .await
                .unwrap();
        }

        let around = f.engine.around(&cohort, f.users[3], 2).await.unwrap();
        let ranks: Vec<u32> = around.iter().map(|r| r.rank).collect();
        assert_eq!(ranks, vec![2, 3, 4, 5, 6]);

        let edge = f.engine.around(&cohort, f.users[0], 2).await.unwrap();
        assert_eq!(edge.len(), 3);

        let err = f
            .engine
            .around(&CohortKey::track(f.map.id, 0), f.users[0], 2)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 404);
    }

    #[tokio::test]
    async fn rank_xp_is_cached_until_rerank() {
        let f = fixture(2).await;
        let cohort = CohortKey::track(f.map.id, 0);
        let first = f.engine.submit(run(f.users[0], cohort, 100)).await.unwrap();

        let awards = f.engine.rank_xp(&cohort).await.unwrap();
        assert_eq!(awards[&f.users[0]], first.rank.unwrap().rank_xp);
        let again = f.engine.rank_xp(&cohort).await.unwrap();
        assert!(Arc::ptr_eq(&awards, &again));

        f.engine.submit(run(f.users[1], cohort, 90)).await.unwrap();
        let fresh = f.engine.rank_xp(&cohort).await.unwrap();
        assert!(!Arc::ptr_eq(&awards, &fresh));
        assert!(fresh[&f.users[1]] > fresh[&f.users[0]]);
    }

    #[tokio::test]
    async fn rank_for_reports_missing_user() {
        let f = fixture(1).await;
        let cohort = CohortKey::track(f.map.id, 0);
        assert!(f.engine.rank_for(&cohort, f.users[0]).await.unwrap().is_none());
    }
}
