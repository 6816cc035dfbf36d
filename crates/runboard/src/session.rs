//! Lifecycle of in-flight timed attempts.
//!
//! A user owns at most one session. Opening a new one discards the old one,
//! completing one consumes it whether or not the submission succeeds.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::activity::{ActivityEvent, ActivityNotifier, RecordOutcome};
use crate::blob::BlobStore;
use crate::error::RunboardError;
use crate::leaderboard::{LeaderboardEngine, SubmitOutcome};
use crate::metrics::RunboardMetrics;
use crate::model::{Checkpoint, MapInfo, NewRun, NewSession, RunSession, TrackInfo, UserRecord};
use crate::store::Store;
use crate::types::{CohortKey, MapId, SessionId, UserId};
use crate::validator::{RunValidator, SubmissionContext};

/// Everything a successful `complete_session` produced.
#[derive(Debug, Clone)]
pub struct CompletedRun {
    pub outcome: SubmitOutcome,
    /// The PB or WR activity, if the run was one.
    pub activity: Option<RecordOutcome>,
}

/// Session state captured and consumed in one step.
struct ConsumedSession {
    user: UserRecord,
    session: RunSession,
    checkpoints: Vec<Checkpoint>,
    map: MapInfo,
    track: TrackInfo,
}

pub struct RunSessionTracker {
    store: Arc<dyn Store>,
    blobs: Arc<dyn BlobStore>,
    validator: Arc<dyn RunValidator>,
    leaderboard: Arc<LeaderboardEngine>,
    notifier: Arc<ActivityNotifier>,
    metrics: Arc<RunboardMetrics>,
    max_replay_bytes: usize,
}

impl RunSessionTracker {
    pub fn new(
        store: Arc<dyn Store>,
        blobs: Arc<dyn BlobStore>,
        validator: Arc<dyn RunValidator>,
        leaderboard: Arc<LeaderboardEngine>,
        notifier: Arc<ActivityNotifier>,
        metrics: Arc<RunboardMetrics>,
        max_replay_bytes: usize,
    ) -> Self {
        Self {
            store,
            blobs,
            validator,
            leaderboard,
            notifier,
            metrics,
            max_replay_bytes,
        }
    }

    /// Open a session for `user`, discarding any session they already had.
    ///
    /// The discard commits on its own: a user's old session is gone even if
    /// the new target turns out not to exist. The insert repeats the discard
    /// in its own transaction so a user never ends up with two sessions.
    pub async fn create_session(
        &self,
        user: UserId,
        map_id: MapId,
        track_num: u8,
        zone_num: u8,
    ) -> Result<RunSession, RunboardError> {
        let mut tx = self.store.begin().await?;
        let discarded = tx.delete_user_sessions(user).await?;
        tx.commit().await?;
        if discarded > 0 {
            debug!(user_id = %user, discarded, "discarded previous session");
        }

        let mut tx = self.store.begin().await?;
        let map = tx
            .map(map_id)
            .await?
            .ok_or_else(|| RunboardError::validation(format!("map {map_id} does not exist")))?;
        let track = map.track(track_num).ok_or_else(|| {
            RunboardError::validation(format!("map {map_id} has no track {track_num}"))
        })?;
        if zone_num > 0 && !track.has_zone(zone_num) {
            return Err(RunboardError::validation(format!(
                "track {track_num} of map {map_id} has no zone {zone_num}"
            )));
        }

        tx.delete_user_sessions(user).await?;
        let session = tx
            .insert_session(&NewSession {
                user_id: user,
                map_id,
                track_id: track.id,
                track_num,
                zone_num,
            })
            .await?;
        tx.commit().await?;

        self.metrics.sessions_opened.inc();
        info!(
            session_id = %session.id,
            user_id = %user,
            map_id = %map_id,
            track_num,
            zone_num,
            "session opened"
        );
        Ok(session)
    }

    /// Record the tick at which `zone_num` was reached.
    pub async fn update_session(
        &self,
        session_id: SessionId,
        user: UserId,
        zone_num: u8,
        tick: u32,
    ) -> Result<(), RunboardError> {
        let mut tx = self.store.begin().await?;
        let session = tx
            .session(session_id, user)
            .await?
            .ok_or_else(|| RunboardError::session_not_found(session_id, user))?;
        if session.is_individual_zone() {
            return Err(RunboardError::invalid_state(format!(
                "session {session_id} is an individual-zone run and takes no checkpoints"
            )));
        }

        let map = tx.map(session.map_id).await?.ok_or_else(|| {
            RunboardError::validation(format!("map {} does not exist", session.map_id))
        })?;
        let track = map.track(session.track_num).ok_or_else(|| {
            RunboardError::validation(format!(
                "map {} has no track {}",
                map.id, session.track_num
            ))
        })?;
        if !track.has_zone(zone_num) {
            return Err(RunboardError::validation(format!(
                "track {} of map {} has no zone {zone_num}",
                track.track_num, map.id
            )));
        }

        if !tx.insert_checkpoint(session_id, zone_num, tick).await? {
            return Err(RunboardError::conflict(format!(
                "checkpoint for zone {zone_num} already recorded"
            )));
        }
        tx.commit().await?;

        debug!(session_id = %session_id, zone_num, tick, "checkpoint recorded");
        Ok(())
    }

    /// Consume the session and submit the replay as a run.
    ///
    /// The session is deleted before validation; any later failure leaves it
    /// deleted and a retry needs a fresh session.
    pub async fn complete_session(
        &self,
        session_id: SessionId,
        user: UserId,
        replay: &[u8],
    ) -> Result<CompletedRun, RunboardError> {
        let consumed = self.consume(session_id, user).await?;

        if replay.len() > self.max_replay_bytes {
            self.metrics.rejected_submissions.inc();
            warn!(
                session_id = %session_id,
                user_id = %user,
                bytes = replay.len(),
                "replay exceeds size limit"
            );
            return Err(RunboardError::validation(format!(
                "replay is {} bytes, limit is {}",
                replay.len(),
                self.max_replay_bytes
            )));
        }

        let ctx = SubmissionContext {
            user: &consumed.user,
            session: &consumed.session,
            checkpoints: &consumed.checkpoints,
            map: &consumed.map,
            track: &consumed.track,
            now: Utc::now(),
        };
        let validated = match self.validator.validate(&ctx, replay) {
            Ok(validated) => validated,
            Err(err) => {
                self.metrics.rejected_submissions.inc();
                warn!(
                    session_id = %session_id,
                    user_id = %user,
                    code = err.code(),
                    error = %err,
                    "run rejected"
                );
                return Err(err.into());
            }
        };

        self.blobs.put(&validated.hash, replay).await?;

        let session = &consumed.session;
        let run = NewRun {
            user_id: user,
            cohort: CohortKey::new(
                session.map_id,
                session.track_num,
                session.zone_num,
                validated.flags,
            ),
            ticks: validated.ticks,
            tick_rate: validated.tick_rate,
            file_ref: Some(validated.hash.clone()),
            hash: validated.hash,
        };

        let mut tx = self.store.begin().await?;
        let outcome = self
            .leaderboard
            .submit_in(tx.as_mut(), &consumed.map, &consumed.track, run)
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
        info!(
            session_id = %session_id,
            run_id = %outcome.run.id,
            user_id = %user,
            time = outcome.run.time,
            "session completed"
        );
        Ok(CompletedRun { outcome, activity })
    }

    /// Load everything validation needs and delete the session.
    async fn consume(
        &self,
        session_id: SessionId,
        user: UserId,
    ) -> Result<ConsumedSession, RunboardError> {
        let mut tx = self.store.begin().await?;
        let session = tx
            .session(session_id, user)
            .await?
            .ok_or_else(|| {
                RunboardError::validation(format!(
                    "session {session_id} for user {user} does not exist"
                ))
            })?;
        let checkpoints = tx.checkpoints(session_id).await?;
        let map = tx.map(session.map_id).await?.ok_or_else(|| {
            RunboardError::validation(format!(
                "map {} of session {session_id} does not exist",
                session.map_id
            ))
        })?;
        let track = map
            .track(session.track_num)
            .filter(|t| t.id == session.track_id)
            .cloned()
            .ok_or_else(|| {
                RunboardError::validation(format!(
                    "track {} of session {session_id} does not exist",
                    session.track_num
                ))
            })?;
        let user_record = tx
            .user(user)
            .await?
            .ok_or_else(|| RunboardError::validation(format!("user {user} does not exist")))?;

        tx.delete_session(session_id).await?;
        tx.commit().await?;

        Ok(ConsumedSession {
            user: user_record,
            session,
            checkpoints,
            map,
            track,
        })
    }

    /// Abort the user's session.
    pub async fn invalidate_session(&self, user: UserId) -> Result<(), RunboardError> {
        let mut tx = self.store.begin().await?;
        if tx.delete_user_sessions(user).await? == 0 {
            return Err(RunboardError::not_found(format!("session for user {user}")));
        }
        tx.commit().await?;
        info!(user_id = %user, "session invalidated");
        Ok(())
    }

    pub async fn active_session(&self, user: UserId) -> Result<Option<RunSession>, RunboardError> {
        let mut tx = self.store.begin().await?;
        let session = tx.user_session(user).await?;
        tx.rollback().await?;
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use crate::error::RunboardError;
    use crate::testing::TestHarness;
    use crate::types::{MapId, SessionId};

    #[tokio::test]
    async fn second_session_replaces_first() {
        let h = TestHarness::new().await;
        let user = h.user("alice").await;
        let map = h.staged_map("surf_kitsune", 2, 3).await;
        let sessions = h.service().sessions();

        let first = sessions.create_session(user.id, map.id, 0, 0).await.unwrap();
        let second = sessions.create_session(user.id, map.id, 0, 2).await.unwrap();
        assert_ne!(first.id, second.id);

        let active = sessions.active_session(user.id).await.unwrap().unwrap();
        assert_eq!(active.id, second.id);
        let err = sessions
            .update_session(first.id, user.id, 2, 10)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 404);
    }

    #[tokio::test]
    async fn failed_create_still_clears_old_session() {
        let h = TestHarness::new().await;
        let user = h.user("alice").await;
        let map = h.linear_map("bhop_mist", 1).await;
        let sessions = h.service().sessions();

        sessions.create_session(user.id, map.id, 0, 0).await.unwrap();
        let err = sessions
            .create_session(user.id, MapId(map.id.0 + 100), 0, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, RunboardError::Validation { .. }));
        assert!(sessions.active_session(user.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn create_rejects_unknown_track_and_zone() {
        let h = TestHarness::new().await;
        let user = h.user("alice").await;
        let map = h.staged_map("surf_forest", 3, 4).await;
        let sessions = h.service().sessions();

        let err = sessions.create_session(user.id, map.id, 5, 0).await.unwrap_err();
        assert_eq!(err.status_code(), 400);
        let err = sessions.create_session(user.id, map.id, 0, 5).await.unwrap_err();
        assert_eq!(err.status_code(), 400);
        sessions.create_session(user.id, map.id, 0, 4).await.unwrap();
    }

    #[tokio::test]
    async fn checkpoints_are_write_once() {
        let h = TestHarness::new().await;
        let user = h.user("alice").await;
        let map = h.staged_map("surf_kitsune", 2, 3).await;
        let sessions = h.service().sessions();
        let session = sessions.create_session(user.id, map.id, 0, 0).await.unwrap();

        sessions.update_session(session.id, user.id, 2, 100).await.unwrap();
        let err = sessions
            .update_session(session.id, user.id, 2, 120)
            .await
            .unwrap_err();
        assert!(matches!(err, RunboardError::Conflict { .. }));

        let err = sessions
            .update_session(session.id, user.id, 9, 150)
            .await
            .unwrap_err();
        assert!(matches!(err, RunboardError::Validation { .. }));
    }

    #[tokio::test]
    async fn individual_zone_sessions_take_no_checkpoints() {
        let h = TestHarness::new().await;
        let user = h.user("alice").await;
        let map = h.staged_map("surf_kitsune", 2, 3).await;
        let sessions = h.service().sessions();
        let session = sessions.create_session(user.id, map.id, 0, 2).await.unwrap();

        let err = sessions
            .update_session(session.id, user.id, 2, 100)
            .await
            .unwrap_err();
        assert!(matches!(err, RunboardError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn update_checks_ownership() {
        let h = TestHarness::new().await;
        let alice = h.user("alice").await;
        let bob = h.user("bob").await;
        let map = h.staged_map("surf_kitsune", 2, 3).await;
        let sessions = h.service().sessions();
        let session = sessions.create_session(alice.id, map.id, 0, 0).await.unwrap();

        let err = sessions
            .update_session(session.id, bob.id, 2, 100)
            .await
            .unwrap_err();
        assert!(matches!(err, RunboardError::NotFound { .. }));
    }

    #[tokio::test]
    async fn completion_consumes_session_even_when_rejected() {
        let h = TestHarness::new().await;
        let user = h.user("alice").await;
        let map = h.linear_map("bhop_mist", 1).await;
        let sessions = h.service().sessions();
        let session = sessions.create_session(user.id, map.id, 0, 0).await.unwrap();

        let err = sessions
            .complete_session(session.id, user.id, b"not a replay")
            .await
            .unwrap_err();
        match err {
            RunboardError::Validation { code, .. } => assert_eq!(code, Some(1)),
            other => panic!("expected validation error, got {other:?}"),
        }

        let replay = h.replay_for(&user, &map, &session, 500);
        let err = sessions
            .complete_session(session.id, user.id, &replay)
            .await
            .unwrap_err();
        assert!(matches!(err, RunboardError::Validation { code: None, .. }));
        assert_eq!(h.service().metrics().rejected_submissions.get(), 1);
    }

    #[tokio::test]
    async fn completion_submits_run_and_activity() {
        let h = TestHarness::new().await;
        let user = h.user("alice").await;
        let map = h.linear_map("bhop_mist", 1).await;

        let completed = h.complete_run(&user, &map, 0, 0, 500).await.unwrap();
        assert!(completed.outcome.is_new_world_record);
        let activity = completed.activity.unwrap();
        assert_eq!(activity.activity.data, completed.outcome.run.id.0);
        assert!(h.blobs().len() == 1);
        assert_eq!(
            completed.outcome.run.file_ref.as_deref(),
            Some(completed.outcome.run.hash.as_str())
        );
        assert!(h
            .service()
            .sessions()
            .active_session(user.id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn oversized_replay_is_rejected() {
        let h = TestHarness::with_config(crate::config::ServiceConfig {
            max_replay_bytes: 8,
            ..TestHarness::default_config()
        })
        .await;
        let user = h.user("alice").await;
        let map = h.linear_map("bhop_mist", 1).await;
        let err = h.complete_run(&user, &map, 0, 0, 500).await.unwrap_err();
        assert_eq!(err.status_code(), 400);
    }

    #[tokio::test]
    async fn invalidate_without_session_is_not_found() {
        let h = TestHarness::new().await;
        let user = h.user("alice").await;
        let map = h.linear_map("bhop_mist", 1).await;
        let sessions = h.service().sessions();

        let err = sessions.invalidate_session(user.id).await.unwrap_err();
        assert_eq!(err.status_code(), 404);

        sessions.create_session(user.id, map.id, 0, 0).await.unwrap();
        sessions.invalidate_session(user.id).await.unwrap();
        let err = sessions
            .complete_session(SessionId(1), user.id, &[])
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 400);
    }
}
