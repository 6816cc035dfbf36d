//! Run submission, ranking and reward pipeline.
//!
//! A game client opens a session, reports checkpoints and finally uploads a
//! replay. The [`session::RunSessionTracker`] validates the replay and hands
//! the run to the [`leaderboard::LeaderboardEngine`], which stores it, detects
//! personal bests and world records, rewrites the cohort's dense ranks and
//! computes XP through [`xp::XpSystems`]. The [`activity::ActivityNotifier`]
//! then records the achievement and fans it out to subscribers, inside the
//! same transaction.
//!
//! [`service::RunboardService`] wires everything together;
//! [`testing::TestHarness`] does the same over in-memory backends.

pub mod activity;
pub mod blob;
pub mod config;
pub mod error;
pub mod hash;
pub mod leaderboard;
pub mod metrics;
pub mod model;
pub mod replay;
pub mod service;
pub mod session;
pub mod storage;
pub mod store;
pub mod testing;
pub mod types;
pub mod validator;
pub mod xp;

pub use error::RunboardError;
pub use service::RunboardService;

/// Commonly used items for glob imports.
pub mod prelude {
    pub use crate::activity::{ActivityEvent, ActivityNotifier, RecordOutcome};
    pub use crate::config::ServiceConfig;
    pub use crate::error::RunboardError;
    pub use crate::leaderboard::{LeaderboardEngine, SubmitOutcome};
    pub use crate::model::{MapInfo, NewRun, RunRecord, RunSession, UserMapRank, UserRecord};
    pub use crate::service::RunboardService;
    pub use crate::session::{CompletedRun, RunSessionTracker};
    pub use crate::store::{Store, StoreTransaction};
    pub use crate::types::{
        ActivityFlags, ActivityType, CohortKey, MapId, RunFlags, RunId, SessionId, UserId,
    };
}
