//! Boundary check between a finished session and the leaderboard.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::blob::sha256_hex;
use crate::model::{run_time, Checkpoint, MapInfo, RunSession, TrackInfo, UserRecord};
use crate::replay::{ReplayHeader, REPLAY_MAGIC};
use crate::types::RunFlags;

/// Why a completed session was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RunValidationError {
    #[error("replay file could not be read")]
    BadReplayFile,

    #[error("checkpoint timestamps are inconsistent with the track")]
    BadTimestamps,

    #[error("replay metadata does not match the session")]
    BadMeta,

    #[error("replay timing is out of sync with the session")]
    OutOfSync,
}

impl RunValidationError {
    /// Stable numeric code surfaced to clients.
    pub const fn code(self) -> u16 {
        match self {
            Self::BadReplayFile => 1,
            Self::BadTimestamps => 2,
            Self::BadMeta => 3,
            Self::OutOfSync => 4,
        }
    }
}

/// Everything known about a session at completion time.
#[derive(Debug, Clone, Copy)]
pub struct SubmissionContext<'a> {
    pub user: &'a UserRecord,
    pub session: &'a RunSession,
    pub checkpoints: &'a [Checkpoint],
    pub map: &'a MapInfo,
    pub track: &'a TrackInfo,
    pub now: DateTime<Utc>,
}

/// Run-shaped output of a successful validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedRun {
    pub ticks: u32,
    pub tick_rate: f64,
    pub flags: RunFlags,
    /// SHA-256 hex digest of the replay bytes.
    pub hash: String,
}

impl ValidatedRun {
    pub fn time(&self) -> f64 {
        run_time(self.ticks, self.tick_rate)
    }
}

pub trait RunValidator: Send + Sync + 'static {
    fn validate(
        &self,
        ctx: &SubmissionContext<'_>,
        replay: &[u8],
    ) -> Result<ValidatedRun, RunValidationError>;
}

/// Validates the replay header and the session's checkpoints.
#[derive(Debug, Clone)]
pub struct ReplayValidator {
    tick_rate: f64,
    submit_grace: Duration,
}

const TICK_RATE_EPSILON: f64 = 1e-6;

impl ReplayValidator {
    pub fn new(tick_rate: f64, submit_grace: Duration) -> Self {
        Self {
            tick_rate,
            submit_grace,
        }
    }

    fn check_checkpoints(ctx: &SubmissionContext<'_>) -> Result<(), RunValidationError> {
        if ctx.session.is_individual_zone() || ctx.track.num_zones <= 1 {
            return ensure(
                ctx.checkpoints.is_empty(),
                RunValidationError::BadTimestamps,
            );
        }

        // the start zone never produces a checkpoint
        if ctx.checkpoints.len() != ctx.track.num_zones as usize - 1 {
            return Err(RunValidationError::BadTimestamps);
        }
        let mut sorted = ctx.checkpoints.to_vec();
        sorted.sort_by_key(|c| c.zone);
        let mut prev_tick = 0;
        for checkpoint in sorted {
            if checkpoint.tick <= prev_tick {
                return Err(RunValidationError::BadTimestamps);
            }
            prev_tick = checkpoint.tick;
        }
        Ok(())
    }
}

fn ensure(ok: bool, err: RunValidationError) -> Result<(), RunValidationError> {
    if ok {
        Ok(())
    } else {
        Err(err)
    }
}

impl RunValidator for ReplayValidator {
    fn validate(
        &self,
        ctx: &SubmissionContext<'_>,
        replay: &[u8],
    ) -> Result<ValidatedRun, RunValidationError> {
        use RunValidationError::*;

        Self::check_checkpoints(ctx)?;

        let header = ReplayHeader::parse(replay).map_err(|_| BadReplayFile)?;
        let session = ctx.session;

        ensure(header.magic == REPLAY_MAGIC, BadMeta)?;
        ensure(header.steam_id == ctx.user.steam_id, BadMeta)?;
        ensure(
            ctx.map.hash.as_deref().map_or(true, |h| h == header.map_hash),
            BadMeta,
        )?;
        ensure(header.map_name == ctx.map.name, BadMeta)?;
        ensure(header.track_num == session.track_num, BadMeta)?;
        ensure(header.zone_num == session.zone_num, BadMeta)?;

        let ticks = header.ticks().filter(|t| *t > 0).ok_or(BadTimestamps)?;

        let run_date = header.run_date_secs().ok_or(BadReplayFile)?;
        ensure(run_date <= ctx.now.timestamp(), OutOfSync)?;

        let tick_rate = header.tick_rate as f64;
        ensure(
            tick_rate.is_finite() && (tick_rate - self.tick_rate).abs() < TICK_RATE_EPSILON,
            OutOfSync,
        )?;

        let time = run_time(ticks, tick_rate);
        ensure(time > 0.0, BadTimestamps)?;
        let session_ms = (ctx.now - session.created_at).num_milliseconds() as f64;
        let allowed_ms = session_ms + self.submit_grace.as_millis() as f64;
        ensure(time * 1000.0 <= allowed_ms, OutOfSync)?;

        Ok(ValidatedRun {
            ticks,
            tick_rate,
            flags: header.flags(),
            hash: sha256_hex(replay),
        })
    }
}
