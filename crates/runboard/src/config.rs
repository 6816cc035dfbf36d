use std::path::PathBuf;
use std::time::Duration;

use crate::error::RunboardError;

/// Process configuration for the run pipeline.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// PostgreSQL connection string. `None` selects the in-memory store.
    pub database_url: Option<String>,
    /// Connection pool size. Default: 10.
    pub database_max_connections: u32,
    /// Root directory of the file-backed replay store. `None` keeps replays
    /// in memory.
    pub replay_dir: Option<PathBuf>,
    /// Largest replay accepted by `complete_session`. Default: 16 MiB.
    pub max_replay_bytes: usize,
    /// Slack added to a session's wall-clock lifetime when checking that the
    /// replay is not longer than the session. Default: 5s.
    pub session_submit_grace: Duration,
    /// Tick interval (seconds per tick) the replay header must match.
    /// Default: 0.015.
    pub default_tick_rate: f64,
    /// Entries on each side of a user in `around` queries. Default: 5.
    pub leaderboard_around_window: u32,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            database_max_connections: 10,
            replay_dir: None,
            max_replay_bytes: 16 * 1024 * 1024,
            session_submit_grace: Duration::from_secs(5),
            default_tick_rate: 0.015,
            leaderboard_around_window: 5,
        }
    }
}

impl ServiceConfig {
    pub fn validate(&self) -> Result<(), RunboardError> {
        if self.database_max_connections == 0 {
            return Err(RunboardError::config(
                "database_max_connections must be >= 1",
            ));
        }
        if self.max_replay_bytes == 0 {
            return Err(RunboardError::config("max_replay_bytes must be >= 1"));
        }
        if !(self.default_tick_rate.is_finite() && self.default_tick_rate > 0.0) {
            return Err(RunboardError::config(format!(
                "default_tick_rate must be > 0, got {}",
                self.default_tick_rate
            )));
        }
        if self.leaderboard_around_window == 0 {
            return Err(RunboardError::config(
                "leaderboard_around_window must be >= 1",
            ));
        }
        Ok(())
    }
}
