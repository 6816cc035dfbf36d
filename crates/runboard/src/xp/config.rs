//! The `XPSystems` document: rank-XP and cosmetic-XP parameters.
//!
//! Serialised with the same JSON field names the admin API exchanges.

use serde::{Deserialize, Serialize};

use crate::error::RunboardError;

/// Number of entries in the top-ranks percentage table.
pub const TOP_RANKS: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct XpSystemsConfig {
    #[serde(rename = "rankXP")]
    pub rank_xp: RankXpParams,
    #[serde(rename = "cosXP")]
    pub cos_xp: CosXpParams,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankXpParams {
    pub top10: Top10Params,
    pub formula: FormulaParams,
    pub groups: GroupParams,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Top10Params {
    #[serde(rename = "WRPoints")]
    pub wr_points: f64,
    pub rank_percentages: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormulaParams {
    #[serde(rename = "A")]
    pub a: f64,
    #[serde(rename = "B")]
    pub b: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupParams {
    pub max_groups: usize,
    pub group_scale_factors: Vec<f64>,
    pub group_exponents: Vec<f64>,
    pub group_min_sizes: Vec<u32>,
    pub group_point_pcts: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CosXpParams {
    pub levels: LevelParams,
    pub completions: CompletionParams,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LevelParams {
    pub max_levels: u32,
    pub starting_value: f64,
    pub linear_scale_base_increase: f64,
    pub linear_scale_interval: u32,
    pub linear_scale_interval_multiplier: f64,
    pub static_scale_start: u32,
    pub static_scale_base_multiplier: f64,
    pub static_scale_interval: u32,
    pub static_scale_interval_multiplier: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionParams {
    pub unique: UniqueCompletionParams,
    pub repeat: RepeatCompletionParams,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UniqueCompletionParams {
    pub tier_scale: UniqueTierScale,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UniqueTierScale {
    pub linear: f64,
    pub staged: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepeatCompletionParams {
    pub tier_scale: RepeatTierScale,
}

/// Divisors applied to the unique award for repeat completions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepeatTierScale {
    pub linear: f64,
    pub staged: f64,
    pub stages: f64,
    pub bonus: f64,
}

impl Default for XpSystemsConfig {
    fn default() -> Self {
        Self {
            rank_xp: RankXpParams {
                top10: Top10Params {
                    wr_points: 3000.0,
                    rank_percentages: vec![
                        1.0, 0.75, 0.68, 0.61, 0.57, 0.53, 0.505, 0.48, 0.455, 0.43,
                    ],
                },
                formula: FormulaParams {
                    a: 50000.0,
                    b: 49.0,
                },
                groups: GroupParams {
                    max_groups: 4,
                    group_scale_factors: vec![1.0, 1.5, 2.0, 2.5],
                    group_exponents: vec![0.5, 0.56, 0.62, 0.68],
                    group_min_sizes: vec![10, 45, 125, 250],
                    group_point_pcts: vec![0.2, 0.13, 0.07, 0.03],
                },
            },
            cos_xp: CosXpParams {
                levels: LevelParams {
                    max_levels: 500,
                    starting_value: 20000.0,
                    linear_scale_base_increase: 1000.0,
                    linear_scale_interval: 10,
                    linear_scale_interval_multiplier: 1.0,
                    static_scale_start: 101,
                    static_scale_base_multiplier: 1.5,
                    static_scale_interval: 25,
                    static_scale_interval_multiplier: 0.5,
                },
                completions: CompletionParams {
                    unique: UniqueCompletionParams {
                        tier_scale: UniqueTierScale {
                            linear: 2500.0,
                            staged: 2500.0,
                        },
                    },
                    repeat: RepeatCompletionParams {
                        tier_scale: RepeatTierScale {
                            linear: 20.0,
                            staged: 40.0,
                            stages: 5.0,
                            bonus: 40.0,
                        },
                    },
                },
            },
        }
    }
}

impl XpSystemsConfig {
    /// Reject documents that would break the XP computations.
    ///
    /// Runs before a document becomes the active snapshot.
    pub fn validate(&self) -> Result<(), RunboardError> {
        self.validate_rank_xp()?;
        self.validate_cos_xp()
    }

    fn validate_rank_xp(&self) -> Result<(), RunboardError> {
        let top10 = &self.rank_xp.top10;
        if !positive(top10.wr_points) {
            return Err(RunboardError::config("rankXP.top10.WRPoints must be > 0"));
        }
        if top10.rank_percentages.len() != TOP_RANKS {
            return Err(RunboardError::config(format!(
                "rankXP.top10.rankPercentages must have {TOP_RANKS} entries, got {}",
                top10.rank_percentages.len()
            )));
        }
        if top10
            .rank_percentages
            .iter()
            .any(|p| !p.is_finite() || *p < 0.0 || *p > 1.0)
        {
            return Err(RunboardError::config(
                "rankXP.top10.rankPercentages entries must be within [0, 1]",
            ));
        }
        if top10.rank_percentages.windows(2).any(|w| w[1] > w[0]) {
            return Err(RunboardError::config(
                "rankXP.top10.rankPercentages must be non-increasing",
            ));
        }
        if top10.rank_percentages[0] <= 0.0 {
            return Err(RunboardError::config(
                "rankXP.top10.rankPercentages[0] must be > 0",
            ));
        }

        let formula = &self.rank_xp.formula;
        if !positive(formula.a) || !positive(formula.b) {
            return Err(RunboardError::config(
                "rankXP.formula.A and rankXP.formula.B must be > 0",
            ));
        }

        let groups = &self.rank_xp.groups;
        if groups.max_groups == 0 {
            return Err(RunboardError::config("rankXP.groups.maxGroups must be >= 1"));
        }
        let lengths = [
            ("groupScaleFactors", groups.group_scale_factors.len()),
            ("groupExponents", groups.group_exponents.len()),
            ("groupMinSizes", groups.group_min_sizes.len()),
            ("groupPointPcts", groups.group_point_pcts.len()),
        ];
        for (name, len) in lengths {
            if len != groups.max_groups {
                return Err(RunboardError::config(format!(
                    "rankXP.groups.{name} must have maxGroups ({}) entries, got {len}",
                    groups.max_groups
                )));
            }
        }
        if groups.group_scale_factors.iter().any(|v| !positive(*v)) {
            return Err(RunboardError::config(
                "rankXP.groups.groupScaleFactors entries must be > 0",
            ));
        }
        if groups.group_exponents.iter().any(|v| !positive(*v)) {
            return Err(RunboardError::config(
                "rankXP.groups.groupExponents entries must be > 0",
            ));
        }
        if groups.group_min_sizes.iter().any(|v| *v == 0) {
            return Err(RunboardError::config(
                "rankXP.groups.groupMinSizes entries must be >= 1",
            ));
        }
        if groups
            .group_point_pcts
            .iter()
            .any(|v| !v.is_finite() || *v < 0.0)
        {
            return Err(RunboardError::config(
                "rankXP.groups.groupPointPcts entries must be >= 0",
            ));
        }
        let band_total: f64 = groups.group_point_pcts.iter().sum();
        if band_total >= 1.0 {
            return Err(RunboardError::config(format!(
                "rankXP.groups.groupPointPcts must sum to less than 1, got {band_total}"
            )));
        }
        Ok(())
    }

    fn validate_cos_xp(&self) -> Result<(), RunboardError> {
        let levels = &self.cos_xp.levels;
        if !positive(levels.starting_value)
            || !positive(levels.linear_scale_base_increase)
            || !positive(levels.linear_scale_interval_multiplier)
            || !positive(levels.static_scale_base_multiplier)
            || !positive(levels.static_scale_interval_multiplier)
        {
            return Err(RunboardError::config(
                "cosXP.levels scale values must be > 0",
            ));
        }
        if levels.linear_scale_interval == 0 || levels.static_scale_interval == 0 {
            return Err(RunboardError::config(
                "cosXP.levels intervals must be >= 1",
            ));
        }
        if levels.static_scale_start < 2 {
            return Err(RunboardError::config(
                "cosXP.levels.staticScaleStart must be >= 2",
            ));
        }
        if levels.max_levels < levels.static_scale_start {
            return Err(RunboardError::config(format!(
                "cosXP.levels.maxLevels ({}) must be >= staticScaleStart ({})",
                levels.max_levels, levels.static_scale_start
            )));
        }

        let completions = &self.cos_xp.completions;
        let unique = &completions.unique.tier_scale;
        if !positive(unique.linear) || !positive(unique.staged) {
            return Err(RunboardError::config(
                "cosXP.completions.unique.tierScale values must be > 0",
            ));
        }
        let repeat = &completions.repeat.tier_scale;
        if [repeat.linear, repeat.staged, repeat.stages, repeat.bonus]
            .iter()
            .any(|v| !positive(*v))
        {
            return Err(RunboardError::config(
                "cosXP.completions.repeat.tierScale divisors must be > 0",
            ));
        }
        Ok(())
    }
}

fn positive(v: f64) -> bool {
    v.is_finite() && v > 0.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        XpSystemsConfig::default().validate().unwrap();
    }

    #[test]
    fn json_uses_admin_field_names() {
        let json = serde_json::to_value(XpSystemsConfig::default()).unwrap();
        assert_eq!(json["rankXP"]["top10"]["WRPoints"], 3000.0);
        assert_eq!(json["rankXP"]["formula"]["A"], 50000.0);
        assert_eq!(json["rankXP"]["groups"]["maxGroups"], 4);
        assert_eq!(json["cosXP"]["levels"]["staticScaleStart"], 101);
        assert_eq!(
            json["cosXP"]["completions"]["repeat"]["tierScale"]["stages"],
            5.0
        );

        let decoded: XpSystemsConfig = serde_json::from_value(json).unwrap();
        assert_eq!(decoded, XpSystemsConfig::default());
    }

    #[test]
    fn missing_group_array_fails_to_parse() {
        let mut json = serde_json::to_value(XpSystemsConfig::default()).unwrap();
        json["rankXP"]["groups"]
            .as_object_mut()
            .unwrap()
            .remove("groupExponents");
        assert!(serde_json::from_value::<XpSystemsConfig>(json).is_err());
    }

    #[test]
    fn rank_percentages_length_is_checked() {
        let mut config = XpSystemsConfig::default();
        config.rank_xp.top10.rank_percentages.pop();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, RunboardError::Config { .. }));
        assert!(err.to_string().contains("rankPercentages"));
    }

    #[test]
    fn rank_percentages_must_not_increase() {
        let mut config = XpSystemsConfig::default();
        config.rank_xp.top10.rank_percentages[3] = 0.9;
        assert!(config.validate().is_err());
    }

    #[test]
    fn group_arrays_must_match_max_groups() {
        let mut config = XpSystemsConfig::default();
        config.rank_xp.groups.max_groups = 5;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("groupScaleFactors"));

        let mut config = XpSystemsConfig::default();
        config.rank_xp.groups.group_min_sizes.push(500);
        assert!(config.validate().is_err());
    }

    #[test]
    fn band_shares_must_leave_room_for_top_ranks() {
        let mut config = XpSystemsConfig::default();
        config.rank_xp.groups.group_point_pcts = vec![0.5, 0.3, 0.15, 0.05];
        assert!(config.validate().is_err());
    }

    #[test]
    fn level_curve_bounds() {
        let mut config = XpSystemsConfig::default();
        config.cos_xp.levels.static_scale_start = 1;
        assert!(config.validate().is_err());

        let mut config = XpSystemsConfig::default();
        config.cos_xp.levels.max_levels = 50;
        assert!(config.validate().is_err());

        let mut config = XpSystemsConfig::default();
        config.cos_xp.completions.repeat.tier_scale.bonus = 0.0;
        assert!(config.validate().is_err());
    }
}
