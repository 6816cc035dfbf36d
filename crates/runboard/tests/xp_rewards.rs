use runboard::model::NewRun;
use runboard::testing::TestHarness;
use runboard::types::{CohortKey, UserId};
use runboard::xp::{distribute, pool_size, CompletionEvent, XpSystemsConfig};
use runboard::RunboardError;

#[test]
fn awards_never_exceed_pool() {
    let params = XpSystemsConfig::default().rank_xp;
    for tier in 1..=10u8 {
        let pool = pool_size(&params, tier);
        for field in [1usize, 2, 9, 10, 11, 25, 100, 1_000, 20_000] {
            let awards = distribute(&params, tier, field);
            assert_eq!(awards.len(), field);
            let total: f64 = awards.iter().sum();
            assert!(
                total <= pool * (1.0 + 1e-9),
                "tier {tier} field {field}: {total} > {pool}"
            );
            assert!(awards.iter().all(|a| *a >= 0.0));
        }
    }
}

#[test]
fn pool_grows_with_tier() {
    let params = XpSystemsConfig::default().rank_xp;
    let pools: Vec<f64> = (1..=10u8).map(|t| pool_size(&params, t)).collect();
    assert!(pools.windows(2).all(|w| w[1] > w[0]));
}

#[test]
fn admin_document_parses_from_camel_case_json() {
    let json = serde_json::to_string(&XpSystemsConfig::default()).unwrap();
    assert!(json.contains("\"rankXP\""));
    assert!(json.contains("\"WRPoints\""));
    assert!(json.contains("\"groupPointPcts\""));
    let parsed: XpSystemsConfig = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed, XpSystemsConfig::default());
}

#[tokio::test]
async fn stored_rank_xp_matches_direct_computation() {
    let h = TestHarness::new().await;
    let map = h.linear_map("bhop_pool", 4).await;
    let cohort = CohortKey::track(map.id, 0);
    let mut ranking: Vec<UserId> = Vec::new();
    for i in 0..14u32 {
        let user = h.user(&format!("u{i}")).await;
        h.service()
            .submit(NewRun {
                user_id: user.id,
                cohort,
                ticks: 500 + i,
                tick_rate: 1.0,
                hash: format!("pool-{i}"),
                file_ref: None,
            })
            .await
            .unwrap();
        ranking.push(user.id);
    }

    let direct = h.service().compute_rank_xp(4, &ranking);
    let ranks = h.service().top(&cohort, usize::MAX).await.unwrap();
    for rank in &ranks {
        let expected = direct[&rank.user_id];
        assert!((rank.rank_xp - expected).abs() < 1e-9);
    }
    let cached = h.service().rank_xp(&cohort).await.unwrap();
    assert_eq!(cached.len(), ranks.len());
}

#[tokio::test]
async fn config_replacement_changes_future_awards_only() {
    let h = TestHarness::new().await;
    let event = CompletionEvent {
        tier: 3,
        is_linear: true,
        is_bonus: false,
        is_unique: true,
        is_stage: false,
    };
    let before = h.service().compute_cos_xp(&event);

    let mut config = XpSystemsConfig::default();
    config.cos_xp.completions.unique.tier_scale.linear *= 2.0;
    let snapshot = h.service().put_xp_config(config).await.unwrap();
    assert_eq!(snapshot.version, 2);
    assert!(h.service().compute_cos_xp(&event) > before);

    let mut broken = XpSystemsConfig::default();
    broken.rank_xp.groups.group_exponents.clear();
    let err = h.service().put_xp_config(broken).await.unwrap_err();
    assert!(matches!(err, RunboardError::Config { .. }));
    assert_eq!(h.service().xp_config().version, 2);
}

#[tokio::test]
async fn level_ups_are_reported() {
    let h = TestHarness::new().await;
    let alice = h.user("alice").await;
    let map = h.linear_map("bhop_levels", 8).await;

    let completed = h.complete_run(&alice, &map, 0, 0, 900).await.unwrap();
    let gain = completed.outcome.xp.cos_xp;
    let stats = h.service().user_stats(alice.id).await.unwrap();
    assert_eq!(stats.level, 1 + gain.gain_lvl);
    assert_eq!(stats.cos_xp, gain.gain_xp);
    let levels = &h.service().xp().snapshot().levels;
    assert_eq!(levels.level_for_xp(stats.cos_xp), stats.level);
}
