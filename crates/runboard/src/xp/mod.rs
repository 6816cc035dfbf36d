//! Reward computation. Everything here is pure apart from [`XpSystems`],
//! which owns the active configuration snapshot.

mod config;
mod cosmetic;
mod rank;
mod systems;

pub use config::{
    CompletionParams, CosXpParams, FormulaParams, GroupParams, LevelParams, RankXpParams,
    RepeatCompletionParams, RepeatTierScale, Top10Params, UniqueCompletionParams,
    UniqueTierScale, XpSystemsConfig, TOP_RANKS,
};
pub use cosmetic::{
    completion_xp, inner_level, prestige, CompletionEvent, LevelTable, PRESTIGE_INTERVAL,
};
pub use rank::{band_sizes, compute_rank_xp, distribute, pool_size, RankXpCache};
pub use systems::{XpSnapshot, XpSystems};

use serde::{Deserialize, Serialize};

/// Rewards granted by one submission.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct XpGain {
    #[serde(rename = "rankXP")]
    pub rank_xp: f64,
    #[serde(rename = "cosXP")]
    pub cos_xp: CosXpGain,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CosXpGain {
    #[serde(rename = "gainLvl")]
    pub gain_lvl: u32,
    #[serde(rename = "oldXP")]
    pub old_xp: u64,
    #[serde(rename = "gainXP")]
    pub gain_xp: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xp_gain_json_shape() {
        let gain = XpGain {
            rank_xp: 12.5,
            cos_xp: CosXpGain {
                gain_lvl: 1,
                old_xp: 100,
                gain_xp: 25_000,
            },
        };
        let json = serde_json::to_value(gain).unwrap();
        assert_eq!(json["rankXP"], 12.5);
        assert_eq!(json["cosXP"]["gainLvl"], 1);
        assert_eq!(json["cosXP"]["oldXP"], 100);
        assert_eq!(json["cosXP"]["gainXP"], 25_000);
    }
}
