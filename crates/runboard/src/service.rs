//! Wiring of the run pipeline behind one handle.
//!
//! [`RunboardService`] owns the store, the blob store, the XP systems and the
//! engines, and exposes the operations the (external) transport layer calls.

use std::collections::HashMap;
use std::sync::Arc;

use prometheus::Registry;
use tracing::info;

use crate::activity::{ActivityEvent, ActivityNotifier, RecordOutcome};
use crate::blob::{BlobStore, FsBlobStore, MemoryBlobStore};
use crate::config::ServiceConfig;
use crate::error::RunboardError;
use crate::leaderboard::{LeaderboardEngine, SubmitOutcome};
use crate::metrics::RunboardMetrics;
use crate::model::{
    Follow, MapInfo, MapNotify, NewMap, NewRun, Notification, RunRecord, RunSession, TrackStats,
    UserMapRank, UserRecord, UserStats,
};
use crate::session::{CompletedRun, RunSessionTracker};
use crate::storage::MemoryStore;
use crate::store::{Store, StoredXpConfig};
use crate::types::{CohortKey, MapId, NotificationId, RunId, SessionId, TrackId, UserId};
use crate::validator::{ReplayValidator, RunValidator};
use crate::xp::{CompletionEvent, XpSnapshot, XpSystems, XpSystemsConfig};

pub struct RunboardService {
    config: Arc<ServiceConfig>,
    store: Arc<dyn Store>,
    blobs: Arc<dyn BlobStore>,
    xp: Arc<XpSystems>,
    metrics: Arc<RunboardMetrics>,
    leaderboard: Arc<LeaderboardEngine>,
    notifier: Arc<ActivityNotifier>,
    sessions: RunSessionTracker,
}

impl RunboardService {
    /// Wire the engines over existing backends with the default
    /// [`ReplayValidator`].
    pub fn new(
        config: ServiceConfig,
        store: Arc<dyn Store>,
        blobs: Arc<dyn BlobStore>,
        xp: Arc<XpSystems>,
        metrics: Arc<RunboardMetrics>,
    ) -> Result<Self, RunboardError> {
        let validator = Arc::new(ReplayValidator::new(
            config.default_tick_rate,
            config.session_submit_grace,
        ));
        Self::with_validator(config, store, blobs, xp, metrics, validator)
    }

    pub fn with_validator(
        config: ServiceConfig,
        store: Arc<dyn Store>,
        blobs: Arc<dyn BlobStore>,
        xp: Arc<XpSystems>,
        metrics: Arc<RunboardMetrics>,
        validator: Arc<dyn RunValidator>,
    ) -> Result<Self, RunboardError> {
        config.validate()?;
        let config = Arc::new(config);

        let leaderboard = Arc::new(LeaderboardEngine::new(
            Arc::clone(&store),
            Arc::clone(&xp),
            Arc::clone(&metrics),
        ));
        let notifier = Arc::new(ActivityNotifier::new(
            Arc::clone(&store),
            Arc::clone(&metrics),
        ));
        let sessions = RunSessionTracker::new(
            Arc::clone(&store),
            Arc::clone(&blobs),
            validator,
            Arc::clone(&leaderboard),
            Arc::clone(&notifier),
            Arc::clone(&metrics),
            config.max_replay_bytes,
        );
        metrics.xp_config_version.set(xp.version() as i64);

        Ok(Self {
            config,
            store,
            blobs,
            xp,
            metrics,
            leaderboard,
            notifier,
            sessions,
        })
    }

    /// Select backends from `config`, load (or seed) the XP systems and
    /// register metrics with `registry`.
    pub async fn bootstrap(
        config: ServiceConfig,
        registry: &Registry,
    ) -> Result<Self, RunboardError> {
        config.validate()?;
        let store = open_store(&config).await?;
        let blobs: Arc<dyn BlobStore> = match &config.replay_dir {
            Some(dir) => {
                info!(replay_dir = %dir.display(), "using file replay store");
                Arc::new(FsBlobStore::new(dir))
            }
            None => Arc::new(MemoryBlobStore::new()),
        };
        let xp = Arc::new(XpSystems::load_or_seed(store.as_ref()).await?);
        let metrics = RunboardMetrics::new(registry)
            .map_err(|e| RunboardError::config(format!("metrics registration failed: {e}")))?;
        Self::new(config, store, blobs, xp, Arc::new(metrics))
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn blobs(&self) -> &Arc<dyn BlobStore> {
        &self.blobs
    }

    pub fn metrics(&self) -> &RunboardMetrics {
        &self.metrics
    }

    pub fn xp(&self) -> &Arc<XpSystems> {
        &self.xp
    }

    pub fn leaderboard(&self) -> &LeaderboardEngine {
        &self.leaderboard
    }

    pub fn notifier(&self) -> &ActivityNotifier {
        &self.notifier
    }

    pub fn sessions(&self) -> &RunSessionTracker {
        &self.sessions
    }

    // sessions

    pub async fn create_session(
        &self,
        user: UserId,
        map_id: MapId,
        track_num: u8,
        zone_num: u8,
    ) -> Result<RunSession, RunboardError> {
        self.sessions
            .create_session(user, map_id, track_num, zone_num)
            .await
    }

    pub async fn update_session(
        &self,
        session_id: SessionId,
        user: UserId,
        zone_num: u8,
        tick: u32,
    ) -> Result<(), RunboardError> {
        self.sessions
            .update_session(session_id, user, zone_num, tick)
            .await
    }

    pub async fn complete_session(
        &self,
        session_id: SessionId,
        user: UserId,
        replay: &[u8],
    ) -> Result<CompletedRun, RunboardError> {
        self.sessions
            .complete_session(session_id, user, replay)
            .await
    }

    pub async fn invalidate_session(&self, user: UserId) -> Result<(), RunboardError> {
        self.sessions.invalidate_session(user).await
    }

    // leaderboard

    /// Submit an already validated run directly, bypassing sessions.
    ///
    /// PB and WR activities are recorded in the same transaction, as for
    /// session completions.
    pub async fn submit(&self, run: NewRun) -> Result<SubmitOutcome, RunboardError> {
        let mut tx = self.store.begin().await?;
        let map = tx.map(run.cohort.map_id).await?.ok_or_else(|| {
            RunboardError::validation(format!("map {} does not exist", run.cohort.map_id))
        })?;
        let track = map.track(run.cohort.track_num).cloned().ok_or_else(|| {
            RunboardError::validation(format!(
                "map {} has no track {}",
                map.id, run.cohort.track_num
            ))
        })?;

        let outcome = self
            .leaderboard
            .submit_in(tx.as_mut(), &map, &track, run)
            .await?;
        let activity = match ActivityEvent::for_submission(
            &outcome.run,
            outcome.is_new_personal_best,
            outcome.is_new_world_record,
        ) {
            Some(event) => Some(self.notifier.record_in(tx.as_mut(), event).await?),
            None => None,
        };
        tx.commit().await?;

        self.leaderboard.record_committed(&outcome);
        if let Some(activity) = &activity {
            self.notifier.record_committed(activity);
        }
        Ok(outcome)
    }

    pub async fn top(
        &self,
        cohort: &CohortKey,
        limit: usize,
    ) -> Result<Vec<UserMapRank>, RunboardError> {
        self.leaderboard.top(cohort, limit).await
    }

    /// The user's neighbourhood using the configured window.
    pub async fn around(
        &self,
        cohort: &CohortKey,
        user: UserId,
    ) -> Result<Vec<UserMapRank>, RunboardError> {
        let window = self.config.leaderboard_around_window as usize;
        self.leaderboard.around(cohort, user, window).await
    }

    pub async fn rank_for(
        &self,
        cohort: &CohortKey,
        user: UserId,
    ) -> Result<Option<UserMapRank>, RunboardError> {
        self.leaderboard.rank_for(cohort, user).await
    }

    pub async fn rank_xp(
        &self,
        cohort: &CohortKey,
    ) -> Result<Arc<HashMap<UserId, f64>>, RunboardError> {
        self.leaderboard.rank_xp(cohort).await
    }

    pub async fn run(&self, id: RunId) -> Result<RunRecord, RunboardError> {
        let mut tx = self.store.begin().await?;
        let run = tx.run(id).await?;
        tx.rollback().await?;
        run.ok_or_else(|| RunboardError::run_not_found(id))
    }

    /// Replay bytes of a stored run.
    pub async fn replay(&self, id: RunId) -> Result<Vec<u8>, RunboardError> {
        let run = self.run(id).await?;
        let file_ref = run
            .file_ref
            .ok_or_else(|| RunboardError::not_found(format!("replay of run {id}")))?;
        self.blobs.get(&file_ref).await
    }

    // xp

    /// Rank XP awards for an explicit ranking under the active config.
    pub fn compute_rank_xp(&self, tier: u8, ranking: &[UserId]) -> HashMap<UserId, f64> {
        self.xp.snapshot().rank_xp(tier, ranking)
    }

    pub fn compute_cos_xp(&self, event: &CompletionEvent) -> u64 {
        self.xp.snapshot().completion_xp(event)
    }

    pub fn xp_config(&self) -> StoredXpConfig {
        let snapshot = self.xp.snapshot();
        StoredXpConfig {
            version: snapshot.version,
            config: snapshot.config.clone(),
        }
    }

    /// Validate and activate a new XP systems document.
    pub async fn put_xp_config(
        &self,
        config: XpSystemsConfig,
    ) -> Result<Arc<XpSnapshot>, RunboardError> {
        let snapshot = self.xp.replace(self.store.as_ref(), config).await?;
        self.metrics.xp_config_version.set(snapshot.version as i64);
        Ok(snapshot)
    }

    // activity

    pub async fn record_activity(
        &self,
        event: ActivityEvent,
    ) -> Result<RecordOutcome, RunboardError> {
        self.notifier.record(event).await
    }

    pub async fn notifications_for(
        &self,
        user: UserId,
    ) -> Result<Vec<Notification>, RunboardError> {
        self.notifier.notifications_for(user).await
    }

    pub async fn mark_read(&self, user: UserId, id: NotificationId) -> Result<(), RunboardError> {
        self.notifier.mark_read(user, id).await
    }

    // catalog and statistics

    pub async fn insert_user(
        &self,
        alias: &str,
        steam_id: &str,
    ) -> Result<UserRecord, RunboardError> {
        let mut tx = self.store.begin().await?;
        let user = tx.insert_user(alias, steam_id).await?;
        tx.commit().await?;
        Ok(user)
    }

    pub async fn insert_map(&self, map: &NewMap) -> Result<MapInfo, RunboardError> {
        let mut tx = self.store.begin().await?;
        let map = tx.insert_map(map).await?;
        tx.commit().await?;
        Ok(map)
    }

    pub async fn follow(&self, follow: Follow) -> Result<(), RunboardError> {
        if follow.follower_id == follow.followed_id {
            return Err(RunboardError::validation("users cannot follow themselves"));
        }
        let mut tx = self.store.begin().await?;
        tx.follow(follow).await?;
        tx.commit().await
    }

    pub async fn subscribe_map(&self, sub: MapNotify) -> Result<(), RunboardError> {
        let mut tx = self.store.begin().await?;
        tx.subscribe_map(sub).await?;
        tx.commit().await
    }

    pub async fn user_stats(&self, user: UserId) -> Result<UserStats, RunboardError> {
        let mut tx = self.store.begin().await?;
        let stats = tx.user_stats(user).await?;
        tx.rollback().await?;
        Ok(stats)
    }

    pub async fn track_stats(
        &self,
        track: TrackId,
        zone_num: u8,
    ) -> Result<TrackStats, RunboardError> {
        let mut tx = self.store.begin().await?;
        let stats = tx.track_stats(track, zone_num).await?;
        tx.rollback().await?;
        Ok(stats)
    }
}

#[cfg(feature = "sql")]
async fn open_store(config: &ServiceConfig) -> Result<Arc<dyn Store>, RunboardError> {
    match &config.database_url {
        Some(url) => {
            let store =
                crate::storage::SqlStore::connect(url, config.database_max_connections).await?;
            store.migrate().await?;
            info!("using postgres store");
            Ok(Arc::new(store))
        }
        None => {
            info!("using in-memory store");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

#[cfg(not(feature = "sql"))]
async fn open_store(config: &ServiceConfig) -> Result<Arc<dyn Store>, RunboardError> {
    if config.database_url.is_some() {
        return Err(RunboardError::config(
            "database_url is set but runboard was built without the `sql` feature",
        ));
    }
    info!("using in-memory store");
    Ok(Arc::new(MemoryStore::new()))
}
