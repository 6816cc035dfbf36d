use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(value: i64) -> Self {
                Self(value)
            }
        }
    };
}

id_type!(
    /// Registered user.
    UserId
);
id_type!(
    /// Map in the catalog.
    MapId
);
id_type!(
    /// Track row of a map (distinct from the per-map track number).
    TrackId
);
id_type!(
    /// In-flight run session.
    SessionId
);
id_type!(
    /// Stored run attempt.
    RunId
);
id_type!(
    /// Activity log entry.
    ActivityId
);
id_type!(
    /// Notification row.
    NotificationId
);
