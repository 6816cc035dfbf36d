//! In-memory harness for unit and integration testing.
//!
//! Wires a [`RunboardService`] over a fresh [`MemoryStore`] and
//! [`MemoryBlobStore`], with helpers to seed users and maps and to drive a
//! full session through to a submitted run.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::blob::MemoryBlobStore;
use crate::config::ServiceConfig;
use crate::error::RunboardError;
use crate::metrics::RunboardMetrics;
use crate::model::{MapInfo, NewMap, NewTrack, RunSession, UserRecord};
use crate::replay::{ReplayHeader, REPLAY_MAGIC};
use crate::service::RunboardService;
use crate::session::CompletedRun;
use crate::storage::MemoryStore;
use crate::types::RunFlags;
use crate::xp::XpSystems;

/// A run service backed entirely by memory.
///
/// # Example
///
/// ```ignore
/// let h = TestHarness::new().await;
/// let alice = h.user("alice").await;
/// let map = h.linear_map("bhop_mist", 2).await;
/// let completed = h.complete_run(&alice, &map, 0, 0, 1_000).await.unwrap();
/// assert!(completed.outcome.is_new_world_record);
/// ```
pub struct TestHarness {
    service: RunboardService,
    store: Arc<MemoryStore>,
    blobs: Arc<MemoryBlobStore>,
    nonce: AtomicU64,
}

impl TestHarness {
    /// Harness with [`TestHarness::default_config`].
    pub async fn new() -> Self {
        Self::with_config(Self::default_config()).await
    }

    /// Default service config with a submit grace wide enough that replays
    /// built by [`TestHarness::replay_for`] are never longer than their
    /// session.
    pub fn default_config() -> ServiceConfig {
        ServiceConfig {
            session_submit_grace: Duration::from_secs(24 * 60 * 60),
            ..ServiceConfig::default()
        }
    }

    pub async fn with_config(config: ServiceConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let blobs = Arc::new(MemoryBlobStore::new());
        let xp = XpSystems::load_or_seed(store.as_ref())
            .await
            .expect("default xp config should be valid");
        let service = RunboardService::new(
            config,
            store.clone(),
            blobs.clone(),
            Arc::new(xp),
            Arc::new(RunboardMetrics::unregistered()),
        )
        .expect("TestHarness config should be valid");

        Self {
            service,
            store,
            blobs,
            nonce: AtomicU64::new(0),
        }
    }

    pub fn service(&self) -> &RunboardService {
        &self.service
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    pub fn blobs(&self) -> &MemoryBlobStore {
        &self.blobs
    }

    pub async fn user(&self, alias: &str) -> UserRecord {
        self.service
            .insert_user(alias, &format!("STEAM_0:1:{alias}"))
            .await
            .expect("insert user")
    }

    pub async fn map(&self, name: &str, tracks: Vec<NewTrack>) -> MapInfo {
        self.service
            .insert_map(&NewMap {
                name: name.to_string(),
                hash: Some(format!("{name}-hash")),
                tracks,
            })
            .await
            .expect("insert map")
    }

    /// Single-zone main track plus one linear bonus.
    pub async fn linear_map(&self, name: &str, tier: u8) -> MapInfo {
        self.map(
            name,
            vec![
                NewTrack {
                    track_num: 0,
                    num_zones: 1,
                    difficulty: tier,
                    is_linear: true,
                },
                NewTrack {
                    track_num: 1,
                    num_zones: 1,
                    difficulty: tier,
                    is_linear: true,
                },
            ],
        )
        .await
    }

    /// Main track with `stages` zones.
    pub async fn staged_map(&self, name: &str, tier: u8, stages: u8) -> MapInfo {
        self.map(
            name,
            vec![NewTrack {
                track_num: 0,
                num_zones: stages,
                difficulty: tier,
                is_linear: false,
            }],
        )
        .await
    }

    /// Replay bytes that pass validation for `session`.
    ///
    /// Every call appends a distinct trailer so two replays never share a
    /// hash.
    pub fn replay_for(
        &self,
        user: &UserRecord,
        map: &MapInfo,
        session: &RunSession,
        ticks: u32,
    ) -> Vec<u8> {
        self.replay_with_flags(user, map, session, ticks, RunFlags::empty())
    }

    pub fn replay_with_flags(
        &self,
        user: &UserRecord,
        map: &MapInfo,
        session: &RunSession,
        ticks: u32,
        flags: RunFlags,
    ) -> Vec<u8> {
        let header = ReplayHeader {
            magic: REPLAY_MAGIC,
            version: 1,
            map_name: map.name.clone(),
            map_hash: map.hash.clone().unwrap_or_default(),
            player_name: user.alias.clone(),
            steam_id: user.steam_id.clone(),
            tick_rate: self.service.config().default_tick_rate as f32,
            run_flags: flags.bits(),
            run_date: Utc::now().timestamp().to_string(),
            start_tick: 64,
            stop_tick: 64 + ticks,
            track_num: session.track_num,
            zone_num: session.zone_num,
        };
        let mut bytes = header.encode();
        let nonce = self.nonce.fetch_add(1, Ordering::Relaxed);
        bytes.extend_from_slice(&nonce.to_le_bytes());
        bytes
    }

    /// Open a session, record evenly spaced checkpoints for staged full-track
    /// runs and complete it with a `ticks`-long replay.
    pub async fn complete_run(
        &self,
        user: &UserRecord,
        map: &MapInfo,
        track_num: u8,
        zone_num: u8,
        ticks: u32,
    ) -> Result<CompletedRun, RunboardError> {
        self.complete_run_with_flags(user, map, track_num, zone_num, ticks, RunFlags::empty())
            .await
    }

    pub async fn complete_run_with_flags(
        &self,
        user: &UserRecord,
        map: &MapInfo,
        track_num: u8,
        zone_num: u8,
        ticks: u32,
        flags: RunFlags,
    ) -> Result<CompletedRun, RunboardError> {
        let session = self
            .service
            .create_session(user.id, map.id, track_num, zone_num)
            .await?;

        let num_zones = map.track(track_num).map_or(1, |t| t.num_zones);
        if zone_num == 0 && num_zones > 1 {
            let step = (ticks / u32::from(num_zones)).max(1);
            for zone in 2..=num_zones {
                self.service
                    .update_session(session.id, user.id, zone, step * u32::from(zone - 1))
                    .await?;
            }
        }

        let replay = self.replay_with_flags(user, map, &session, ticks, flags);
        self.service
            .complete_session(session.id, user.id, &replay)
            .await
    }
}
