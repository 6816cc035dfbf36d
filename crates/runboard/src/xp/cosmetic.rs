//! Cosmetic XP: level curve and per-completion awards.

use serde::{Deserialize, Serialize};

use super::config::{CompletionParams, LevelParams};

/// Levels per prestige tier.
pub const PRESTIGE_INTERVAL: u32 = 500;

/// Cumulative XP thresholds, built once per config version.
#[derive(Debug, Clone, PartialEq)]
pub struct LevelTable {
    max_levels: u32,
    in_level: Vec<u64>,
    /// `for_level[l]` = total XP needed to reach level `l`. Index 0 unused.
    for_level: Vec<u64>,
}

impl LevelTable {
    pub fn build(params: &LevelParams) -> Self {
        let max = params.max_levels as usize;
        let mut in_level = vec![0u64; max + 1];
        let mut for_level = vec![0u64; max + 1];
        for level in 1..=max {
            in_level[level] = xp_in_level(params, level as u32);
            if level > 1 {
                for_level[level] = for_level[level - 1] + in_level[level - 1];
            }
        }
        Self {
            max_levels: params.max_levels,
            in_level,
            for_level,
        }
    }

    pub fn max_levels(&self) -> u32 {
        self.max_levels
    }

    /// XP spanned by `level`; `None` outside `1..=max_levels`.
    pub fn xp_in_level(&self, level: u32) -> Option<u64> {
        self.index(level).map(|i| self.in_level[i])
    }

    /// Total XP required to reach `level`; `None` outside `1..=max_levels`.
    pub fn xp_for_level(&self, level: u32) -> Option<u64> {
        self.index(level).map(|i| self.for_level[i])
    }

    /// Levels crossed when `gain` is added to `old_xp` at `current_level`.
    pub fn levels_gained(&self, old_xp: u64, gain: u64, current_level: u32) -> u32 {
        let total = old_xp.saturating_add(gain);
        let mut gained = 0;
        while let Some(required) = self.xp_for_level(current_level + gained + 1) {
            if total < required {
                break;
            }
            gained += 1;
        }
        gained
    }

    /// Level a user with `total_xp` sits at.
    pub fn level_for_xp(&self, total_xp: u64) -> u32 {
        1 + self.levels_gained(0, total_xp, 1)
    }

    fn index(&self, level: u32) -> Option<usize> {
        (level >= 1 && level <= self.max_levels).then_some(level as usize)
    }
}

fn xp_in_level(params: &LevelParams, level: u32) -> u64 {
    let lvl = level as f64;
    let value = if level < params.static_scale_start {
        params.starting_value
            + params.linear_scale_base_increase
                * lvl
                * (params.linear_scale_interval_multiplier
                    * (lvl / params.linear_scale_interval as f64).ceil())
    } else {
        let sss = params.static_scale_start as f64;
        let plateau = params.linear_scale_base_increase
            * (sss - 1.0)
            * (params.linear_scale_interval_multiplier
                * ((sss - 1.0) / params.linear_scale_interval as f64).ceil());
        let multiplier = if level >= params.static_scale_start + params.static_scale_interval {
            params.static_scale_base_multiplier
                + ((level - params.static_scale_start) / params.static_scale_interval) as f64
                    * params.static_scale_interval_multiplier
        } else {
            params.static_scale_base_multiplier
        };
        plateau * multiplier
    };
    value.round() as u64
}

pub fn prestige(total_level: u32) -> u32 {
    total_level.saturating_sub(1) / PRESTIGE_INTERVAL
}

pub fn inner_level(total_level: u32) -> u32 {
    total_level.saturating_sub(1) % PRESTIGE_INTERVAL + 1
}

/// What a completion was, for cosmetic XP purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionEvent {
    pub tier: u8,
    pub is_linear: bool,
    /// Completion of a bonus track (track number > 0).
    pub is_bonus: bool,
    /// First completion of this track/zone by the user.
    pub is_unique: bool,
    /// Completion of a single stage (zone number > 0).
    pub is_stage: bool,
}

fn initial_scale(tier: u8) -> f64 {
    let t = tier as f64;
    t * t - t + 10.0
}

/// Cosmetic XP awarded for one completion.
pub fn completion_xp(params: &CompletionParams, event: &CompletionEvent) -> u64 {
    let unique = &params.unique.tier_scale;
    let repeat = &params.repeat.tier_scale;

    let xp = if event.is_bonus {
        let base_bonus =
            ((unique.linear * initial_scale(3) + unique.linear * initial_scale(4)) / 2.0).ceil();
        if event.is_unique {
            base_bonus
        } else {
            (base_bonus / repeat.bonus).ceil()
        }
    } else {
        let scale = if event.is_linear {
            unique.linear
        } else {
            unique.staged
        };
        let base = scale * initial_scale(event.tier);
        if event.is_stage {
            // stages never count as unique
            (base / repeat.staged / repeat.stages).ceil()
        } else if event.is_unique {
            base
        } else {
            let divisor = if event.is_linear {
                repeat.linear
            } else {
                repeat.staged
            };
            (base / divisor).ceil()
        }
    };
    xp as u64
}
