mod cohort;
mod flags;
mod ids;

pub use cohort::CohortKey;
pub use flags::{ActivityFlags, ActivityType, RunFlags};
pub use ids::{ActivityId, MapId, NotificationId, RunId, SessionId, TrackId, UserId};
