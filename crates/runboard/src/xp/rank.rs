//! Rank XP: a per-cohort point pool split across the ranked field.
//!
//! The field after rank 10 is cut into bands. Every band that holds at least
//! one run spends `P * groupPointPcts[i]`, split with weights
//! `(1 - x)^exp * scale` where `x` is the position within the occupied part of
//! the band. Rank `r <= 10` gets `P * rankPercentages[r - 1]` when that fits in
//! what the bands left over; otherwise the top ranks are scaled down together
//! so the cohort total stays within `P`. Positions past the last band get
//! nothing.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;

use super::config::{RankXpParams, TOP_RANKS};
use crate::types::{CohortKey, UserId};

/// Pool size for a cohort of the given difficulty tier.
///
/// Grows monotonically with tier from `WRPoints` towards `WRPoints + A`.
pub fn pool_size(params: &RankXpParams, tier: u8) -> f64 {
    let t = tier as f64;
    params.top10.wr_points + params.formula.a * t / (t + params.formula.b)
}

/// Sizes of the bands following the top ranks, for a field of `field` runs.
pub fn band_sizes(params: &RankXpParams, field: usize) -> Vec<usize> {
    let groups = &params.groups;
    let n = field as f64;
    (0..groups.max_groups)
        .map(|i| {
            let scaled = (groups.group_scale_factors[i] * n.powf(groups.group_exponents[i])).ceil();
            (scaled as usize).max(groups.group_min_sizes[i] as usize)
        })
        .collect()
}

/// Awards by zero-based position for a field of `field` ranked runs.
pub fn distribute(params: &RankXpParams, tier: u8, field: usize) -> Vec<f64> {
    let pool = pool_size(params, tier);
    let groups = &params.groups;
    let top = field.min(TOP_RANKS);

    let mut banded = Vec::new();
    let mut band_spent = 0.0;
    for (i, size) in band_sizes(params, field).into_iter().enumerate() {
        let placed = top + banded.len();
        if placed >= field {
            break;
        }
        let occupied = size.min(field - placed);
        let share = pool * groups.group_point_pcts[i];
        let exponent = groups.group_exponents[i];
        let scale = groups.group_scale_factors[i];
        let weight = |j: usize| (1.0 - j as f64 / occupied as f64).powf(exponent) * scale;
        let norm: f64 = (0..occupied).map(weight).sum();
        banded.extend((0..occupied).map(|j| share * weight(j) / norm));
        band_spent += share;
    }

    let pcts = &params.top10.rank_percentages[..top];
    let wanted = pool * pcts.iter().sum::<f64>();
    let budget = pool - band_spent;
    let factor = if wanted > budget { budget / wanted } else { 1.0 };

    let mut awards = Vec::with_capacity(field);
    awards.extend(pcts.iter().map(|pct| pool * pct * factor));
    awards.extend(banded);
    awards.resize(field, 0.0);
    awards
}

/// Rank XP for a cohort ordered by dense rank (best first).
pub fn compute_rank_xp(
    params: &RankXpParams,
    tier: u8,
    ranking: &[UserId],
) -> HashMap<UserId, f64> {
    distribute(params, tier, ranking.len())
        .into_iter()
        .zip(ranking)
        .map(|(xp, user)| (*user, xp))
        .collect()
}

#[derive(Default)]
struct CacheSlot {
    generation: u64,
    awards: Option<(u64, Arc<HashMap<UserId, f64>>)>,
}

/// Computed rank XP per cohort, valid for one config version and until the
/// cohort is re-ranked.
///
/// Every invalidation bumps the cohort's generation. Callers capture
/// [`RankXpCache::generation`] before reading the ranking and pass it to
/// [`RankXpCache::insert`], which drops the awards if a re-rank landed in
/// between.
#[derive(Default)]
pub struct RankXpCache {
    slots: DashMap<CohortKey, CacheSlot>,
}

impl RankXpCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, cohort: &CohortKey, version: u64) -> Option<Arc<HashMap<UserId, f64>>> {
        let slot = self.slots.get(cohort)?;
        match &slot.awards {
            Some((v, awards)) if *v == version => Some(Arc::clone(awards)),
            _ => None,
        }
    }

    pub fn generation(&self, cohort: &CohortKey) -> u64 {
        self.slots.get(cohort).map_or(0, |slot| slot.generation)
    }

    /// Cache `awards` unless the cohort was invalidated after `generation`
    /// was read. Returns whether the entry was stored.
    pub fn insert(
        &self,
        cohort: CohortKey,
        version: u64,
        generation: u64,
        awards: Arc<HashMap<UserId, f64>>,
    ) -> bool {
        let mut slot = self.slots.entry(cohort).or_default();
        if slot.generation != generation {
            return false;
        }
        slot.awards = Some((version, awards));
        true
    }

    pub fn invalidate(&self, cohort: &CohortKey) {
        let mut slot = self.slots.entry(*cohort).or_default();
        slot.generation += 1;
        slot.awards = None;
    }

    pub fn clear(&self) {
        for mut slot in self.slots.iter_mut() {
            slot.generation += 1;
            slot.awards = None;
        }
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.awards.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MapId;
    use crate::xp::XpSystemsConfig;

    fn params() -> RankXpParams {
        XpSystemsConfig::default().rank_xp
    }

    #[test]
    fn pool_grows_with_tier() {
        let p = params();
        assert_eq!(pool_size(&p, 0), 3000.0);
        let mut last = 0.0;
        for tier in 1..=10 {
            let size = pool_size(&p, tier);
            assert!(size > last);
            last = size;
        }
        assert!((pool_size(&p, 1) - 4000.0).abs() < 1e-9);
    }

    #[test]
    fn lone_finisher_takes_whole_pool() {
        let p = params();
        let awards = distribute(&p, 3, 1);
        assert_eq!(awards, vec![pool_size(&p, 3)]);
    }

    #[test]
    fn top_ranks_follow_percentage_table() {
        let p = params();
        for field in [2usize, 10, 400] {
            let awards = distribute(&p, 4, field);
            let top = field.min(TOP_RANKS);
            for i in 1..top {
                let ratio = p.top10.rank_percentages[i] / p.top10.rank_percentages[0];
                assert!((awards[i] / awards[0] - ratio).abs() < 1e-9, "field {field}");
            }
        }

        // with every band occupied the top ranks share what the bands leave
        let pool = pool_size(&p, 1);
        let awards = distribute(&p, 1, 2_000);
        let pct_total: f64 = p.top10.rank_percentages.iter().sum();
        let top_share = pool * (1.0 - 0.43);
        assert!((awards[0] - top_share / pct_total).abs() < 1e-9);
    }

    #[test]
    fn partly_filled_band_spends_its_share() {
        let p = params();
        let pool = pool_size(&p, 1);
        // 15 runs: ranks 11-15 are the only occupants of the first band
        let awards = distribute(&p, 1, 15);
        let band: f64 = awards[10..].iter().sum();
        assert!((band - pool * 0.2).abs() < 1e-6);
        assert!(awards[14] > 0.0);
        assert!(awards[10..].windows(2).all(|w| w[0] > w[1]));
    }

    #[test]
    fn band_sizes_respect_minimums() {
        let p = params();
        assert_eq!(band_sizes(&p, 20), vec![10, 45, 125, 250]);
        // 1.0 * 10000^0.5 = 100
        let first = band_sizes(&p, 10_000)[0];
        assert!((100..=101).contains(&first));
    }

    #[test]
    fn band_weights_decrease_within_band() {
        let p = params();
        let awards = distribute(&p, 2, 30);
        for w in awards[10..20].windows(2) {
            assert!(w[0] > w[1]);
        }
        assert!(awards[20] > 0.0);
    }

    #[test]
    fn total_never_exceeds_pool() {
        let p = params();
        for tier in [1u8, 3, 6] {
            for field in [0usize, 1, 5, 10, 11, 37, 200, 431, 2_000, 20_000] {
                let awards = distribute(&p, tier, field);
                assert_eq!(awards.len(), field);
                let total: f64 = awards.iter().sum();
                let pool = pool_size(&p, tier);
                assert!(total <= pool + 1e-6, "tier {tier} field {field}");
                assert!(awards.iter().all(|a| *a >= 0.0));
                if field > 0 {
                    // the default table oversubscribes, so the pool is spent in full
                    assert!((total - pool).abs() < 1e-6, "tier {tier} field {field}");
                }
            }
        }
    }

    #[test]
    fn positions_past_last_band_get_nothing() {
        let p = params();
        let field = 2_000;
        let covered = 10 + band_sizes(&p, field).iter().sum::<usize>();
        assert!(covered < field);
        let awards = distribute(&p, 1, field);
        assert!(awards[covered - 1] > 0.0);
        assert_eq!(awards[covered], 0.0);
        assert_eq!(awards[field - 1], 0.0);
    }

    #[test]
    fn compute_rank_xp_keys_by_user() {
        let p = params();
        let ranking = [UserId(3), UserId(1), UserId(2)];
        let xp = compute_rank_xp(&p, 1, &ranking);
        assert_eq!(xp.len(), 3);
        assert!(xp[&UserId(3)] > xp[&UserId(1)]);
        assert!(xp[&UserId(1)] > xp[&UserId(2)]);
    }

    #[test]
    fn cache_is_scoped_to_version() {
        let cache = RankXpCache::new();
        let cohort = CohortKey::track(MapId(1), 0);
        let awards = Arc::new(HashMap::from([(UserId(1), 10.0)]));
        assert!(cache.insert(cohort, 2, cache.generation(&cohort), awards));

        assert!(cache.get(&cohort, 2).is_some());
        assert!(cache.get(&cohort, 3).is_none());

        cache.invalidate(&cohort);
        assert!(cache.get(&cohort, 2).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn awards_computed_before_a_rerank_are_not_cached() {
        let cache = RankXpCache::new();
        let cohort = CohortKey::track(MapId(1), 0);
        let stale = Arc::new(HashMap::from([(UserId(1), 10.0)]));

        // reader samples the generation, then a re-rank lands before it stores
        let seen = cache.generation(&cohort);
        cache.invalidate(&cohort);
        assert!(!cache.insert(cohort, 1, seen, stale));
        assert!(cache.get(&cohort, 1).is_none());

        let fresh = Arc::new(HashMap::from([(UserId(1), 12.0)]));
        assert!(cache.insert(cohort, 1, cache.generation(&cohort), fresh));
        assert_eq!(cache.get(&cohort, 1).unwrap()[&UserId(1)], 12.0);

        let seen = cache.generation(&cohort);
        cache.clear();
        let late = Arc::new(HashMap::new());
        assert!(!cache.insert(cohort, 1, seen, late));
        assert!(cache.is_empty());
    }
}
