//! Activity log and notification fan-out.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::debug;

use crate::error::RunboardError;
use crate::metrics::RunboardMetrics;
use crate::model::{Activity, Notification, RunRecord, Subscriber};
use crate::store::{Store, StoreTransaction};
use crate::types::{ActivityType, MapId, NotificationId, UserId};

/// Something noteworthy a user did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivityEvent {
    pub kind: ActivityType,
    pub user_id: UserId,
    pub data: i64,
    /// Map the event happened on, used to reach map subscribers.
    pub map_id: Option<MapId>,
}

impl ActivityEvent {
    pub fn run(kind: ActivityType, run: &RunRecord) -> Self {
        Self {
            kind,
            user_id: run.user_id,
            data: run.id.0,
            map_id: Some(run.cohort.map_id),
        }
    }

    pub fn map(kind: ActivityType, user_id: UserId, map_id: MapId) -> Self {
        Self {
            kind,
            user_id,
            data: map_id.0,
            map_id: Some(map_id),
        }
    }

    /// The event a submission produces, if any. A world record is reported
    /// only as a world record.
    pub fn for_submission(run: &RunRecord, is_pb: bool, is_wr: bool) -> Option<Self> {
        if is_wr {
            Some(Self::run(ActivityType::WrAchieved, run))
        } else if is_pb {
            Some(Self::run(ActivityType::PbAchieved, run))
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordOutcome {
    pub activity: Activity,
    pub recipients: Vec<UserId>,
    /// Notification rows actually inserted.
    pub written: u64,
}

/// Users to notify about `kind`: followers whose filter matches, plus map
/// subscribers whose filter matches when `kind` is a run achievement.
///
/// The result is a set, so a user reached through both paths appears once.
pub fn recipients(
    kind: ActivityType,
    followers: &[Subscriber],
    map_subscribers: &[Subscriber],
) -> BTreeSet<UserId> {
    let from_map: &[Subscriber] = if kind.is_run_achievement() {
        map_subscribers
    } else {
        &[]
    };
    followers
        .iter()
        .chain(from_map)
        .filter(|s| s.notify_on.notifies_on(kind))
        .map(|s| s.user_id)
        .collect()
}

pub struct ActivityNotifier {
    store: Arc<dyn Store>,
    metrics: Arc<RunboardMetrics>,
}

impl ActivityNotifier {
    pub fn new(store: Arc<dyn Store>, metrics: Arc<RunboardMetrics>) -> Self {
        Self { store, metrics }
    }

    /// Record an event in its own transaction.
    pub async fn record(&self, event: ActivityEvent) -> Result<RecordOutcome, RunboardError> {
        let mut tx = self.store.begin().await?;
        let outcome = self.record_in(tx.as_mut(), event).await?;
        tx.commit().await?;
        self.record_committed(&outcome);
        Ok(outcome)
    }

    /// Insert the activity and its notifications inside `tx`.
    pub async fn record_in(
        &self,
        tx: &mut dyn StoreTransaction,
        event: ActivityEvent,
    ) -> Result<RecordOutcome, RunboardError> {
        let activity = tx
            .insert_activity(event.kind, event.user_id, event.data)
            .await?;

        let followers = tx.follower_subscribers(event.user_id).await?;
        let map_subscribers = match event.map_id {
            Some(map) if event.kind.is_run_achievement() => tx.map_subscribers(map).await?,
            _ => Vec::new(),
        };
        let recipients: Vec<UserId> = recipients(event.kind, &followers, &map_subscribers)
            .into_iter()
            .collect();

        let written = if recipients.is_empty() {
            0
        } else {
            tx.insert_notifications(activity.id, &recipients).await?
        };

        debug!(
            activity_id = %activity.id,
            kind = ?activity.kind,
            user_id = %activity.user_id,
            recipients = recipients.len(),
            written,
            "activity recorded"
        );

        Ok(RecordOutcome {
            activity,
            recipients,
            written,
        })
    }

    pub fn record_committed(&self, outcome: &RecordOutcome) {
        self.metrics.notifications_written.inc_by(outcome.written);
    }

    pub async fn notifications_for(
        &self,
        user: UserId,
    ) -> Result<Vec<Notification>, RunboardError> {
        let mut tx = self.store.begin().await?;
        let notifications = tx.notifications(user).await?;
        tx.rollback().await?;
        Ok(notifications)
    }

    pub async fn mark_read(&self, user: UserId, id: NotificationId) -> Result<(), RunboardError> {
        let mut tx = self.store.begin().await?;
        let notification = tx
            .notification(id)
            .await?
            .ok_or_else(|| RunboardError::not_found(format!("notification {id}")))?;
        if notification.user_id != user {
            return Err(RunboardError::forbidden(format!(
                "notification {id} belongs to another user"
            )));
        }
        if !notification.read {
            tx.set_notification_read(id).await?;
        }
        tx.commit().await
    }
}
