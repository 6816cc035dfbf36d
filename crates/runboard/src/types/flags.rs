use serde::{Deserialize, Serialize};

bitflags::bitflags! {
    /// Gameplay modifiers a run was recorded with.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct RunFlags: u32 {
        const BACKWARDS = 1 << 0;
        const LOW_GRAVITY = 1 << 1;
        const W_KEY_ONLY = 1 << 2;
    }
}

bitflags::bitflags! {
    /// Set of activity types, used for `notifyOn` subscription filters.
    ///
    /// Bit values are the persisted representation of [`ActivityType`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct ActivityFlags: u32 {
        const MAP_UPLOADED = 1 << 0;
        const WR_ACHIEVED = 1 << 1;
        const PB_ACHIEVED = 1 << 2;
        const MAP_APPROVED = 1 << 3;
        const REVIEW_MADE = 1 << 4;
    }
}

impl ActivityFlags {
    /// True if the filter subscribes to `ty`.
    pub fn notifies_on(self, ty: ActivityType) -> bool {
        self.contains(ty.flag())
    }
}

/// Kind of a recorded activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActivityType {
    MapUploaded,
    WrAchieved,
    PbAchieved,
    MapApproved,
    ReviewMade,
}

impl ActivityType {
    pub const fn flag(self) -> ActivityFlags {
        match self {
            Self::MapUploaded => ActivityFlags::MAP_UPLOADED,
            Self::WrAchieved => ActivityFlags::WR_ACHIEVED,
            Self::PbAchieved => ActivityFlags::PB_ACHIEVED,
            Self::MapApproved => ActivityFlags::MAP_APPROVED,
            Self::ReviewMade => ActivityFlags::REVIEW_MADE,
        }
    }

    /// Persisted integer form (the single flag bit).
    pub const fn bits(self) -> u32 {
        self.flag().bits()
    }

    pub fn from_bits(bits: u32) -> Option<Self> {
        [
            Self::MapUploaded,
            Self::WrAchieved,
            Self::PbAchieved,
            Self::MapApproved,
            Self::ReviewMade,
        ]
        .into_iter()
        .find(|ty| ty.bits() == bits)
    }

    /// Run-related activities also reach map subscribers.
    pub const fn is_run_achievement(self) -> bool {
        matches!(self, Self::PbAchieved | Self::WrAchieved)
    }
}
