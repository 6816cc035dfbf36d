use serde::{Deserialize, Serialize};
use std::fmt;

use super::{MapId, RunFlags};

/// The competitive bucket a run is ranked within.
///
/// Two runs only compete when every field is equal.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct CohortKey {
    pub map_id: MapId,
    pub track_num: u8,
    pub zone_num: u8,
    pub flags: RunFlags,
}

impl CohortKey {
    pub fn new(map_id: MapId, track_num: u8, zone_num: u8, flags: RunFlags) -> Self {
        Self {
            map_id,
            track_num,
            zone_num,
            flags,
        }
    }

    /// Full-track cohort (no zone, no modifiers).
    pub fn track(map_id: MapId, track_num: u8) -> Self {
        Self::new(map_id, track_num, 0, RunFlags::empty())
    }

    /// True for individual-zone cohorts.
    pub const fn is_individual_zone(&self) -> bool {
        self.zone_num > 0
    }

    /// Stable byte encoding used to derive lock keys.
    pub fn to_key_bytes(&self) -> [u8; 14] {
        let mut out = [0u8; 14];
        out[..8].copy_from_slice(&self.map_id.0.to_le_bytes());
        out[8] = self.track_num;
        out[9] = self.zone_num;
        out[10..].copy_from_slice(&self.flags.bits().to_le_bytes());
        out
    }
}

impl fmt::Display for CohortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "map {}/track {}/zone {}/flags {:#x}",
            self.map_id,
            self.track_num,
            self.zone_num,
            self.flags.bits()
        )
    }
}
