use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::Mutex;
use tracing::info;

use super::config::XpSystemsConfig;
use super::cosmetic::{completion_xp, CompletionEvent, LevelTable};
use super::rank::{compute_rank_xp, RankXpCache};
use crate::error::RunboardError;
use crate::store::{Store, StoredXpConfig};
use crate::types::UserId;

/// One immutable version of the XP configuration with its derived tables.
#[derive(Debug)]
pub struct XpSnapshot {
    pub version: u64,
    pub config: XpSystemsConfig,
    pub levels: LevelTable,
}

impl XpSnapshot {
    pub fn new(version: u64, config: XpSystemsConfig) -> Result<Self, RunboardError> {
        config.validate()?;
        let levels = LevelTable::build(&config.cos_xp.levels);
        Ok(Self {
            version,
            config,
            levels,
        })
    }

    pub fn rank_xp(&self, tier: u8, ranking: &[UserId]) -> HashMap<UserId, f64> {
        compute_rank_xp(&self.config.rank_xp, tier, ranking)
    }

    pub fn completion_xp(&self, event: &CompletionEvent) -> u64 {
        completion_xp(&self.config.cos_xp.completions, event)
    }
}

/// Process-wide holder of the active XP snapshot.
///
/// Readers take an `Arc` at the start of a computation and keep using it even
/// if an update lands meanwhile.
pub struct XpSystems {
    current: ArcSwap<XpSnapshot>,
    rank_cache: RankXpCache,
    update_lock: Mutex<()>,
}

impl XpSystems {
    pub fn new(snapshot: XpSnapshot) -> Self {
        Self {
            current: ArcSwap::from_pointee(snapshot),
            rank_cache: RankXpCache::new(),
            update_lock: Mutex::new(()),
        }
    }

    /// Defaults at version 1, without touching a store.
    pub fn with_defaults() -> Result<Self, RunboardError> {
        Ok(Self::new(XpSnapshot::new(1, XpSystemsConfig::default())?))
    }

    /// Load the persisted document, seeding the defaults if there is none.
    pub async fn load_or_seed(store: &dyn Store) -> Result<Self, RunboardError> {
        let mut tx = store.begin().await?;
        let stored = match tx.xp_config().await? {
            Some(stored) => {
                tx.rollback().await?;
                stored
            }
            None => {
                let stored = StoredXpConfig {
                    version: 1,
                    config: XpSystemsConfig::default(),
                };
                tx.put_xp_config(&stored).await?;
                tx.commit().await?;
                info!("seeded default xp systems config");
                stored
            }
        };
        let snapshot = XpSnapshot::new(stored.version, stored.config)?;
        info!(version = snapshot.version, "xp systems loaded");
        Ok(Self::new(snapshot))
    }

    pub fn snapshot(&self) -> Arc<XpSnapshot> {
        self.current.load_full()
    }

    pub fn version(&self) -> u64 {
        self.current.load().version
    }

    pub fn rank_cache(&self) -> &RankXpCache {
        &self.rank_cache
    }

    /// Validate, persist and activate a new document.
    ///
    /// On any failure the previous snapshot stays active.
    pub async fn replace(
        &self,
        store: &dyn Store,
        config: XpSystemsConfig,
    ) -> Result<Arc<XpSnapshot>, RunboardError> {
        config.validate()?;
        let _guard = self.update_lock.lock().await;

        let version = self.version() + 1;
        let snapshot = Arc::new(XpSnapshot::new(version, config)?);

        let mut tx = store.begin().await?;
        tx.put_xp_config(&StoredXpConfig {
            version,
            config: snapshot.config.clone(),
        })
        .await?;
        tx.commit().await?;

        self.current.store(Arc::clone(&snapshot));
        self.rank_cache.clear();
        info!(version, "xp systems config replaced");
        Ok(snapshot)
    }
}
