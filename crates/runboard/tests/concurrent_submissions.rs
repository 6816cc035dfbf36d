use std::sync::Arc;

use runboard::model::NewRun;
use runboard::testing::TestHarness;
use runboard::types::CohortKey;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_submits_keep_ranks_dense() {
    let h = Arc::new(TestHarness::new().await);
    let map = h.linear_map("bhop_rush", 3).await;
    let cohort = CohortKey::track(map.id, 0);

    let mut users = Vec::new();
    for i in 0..12 {
        users.push(h.user(&format!("racer{i}")).await);
    }

    let mut handles = Vec::new();
    for (i, user) in users.iter().enumerate() {
        for attempt in 0..4u32 {
            let h = Arc::clone(&h);
            let user_id = user.id;
            let ticks = 2_000 - (i as u32 * 13) - attempt * 50;
            handles.push(tokio::spawn(async move {
                h.service()
                    .submit(NewRun {
                        user_id,
                        cohort,
                        ticks,
                        tick_rate: 1.0,
                        hash: format!("{user_id}-{attempt}"),
                        file_ref: None,
                    })
                    .await
            }));
        }
    }

    let mut world_records = 0;
    for handle in handles {
        let outcome = handle.await.unwrap().unwrap();
        assert!(!outcome.is_new_world_record || outcome.is_new_personal_best);
        world_records += usize::from(outcome.is_new_world_record);
    }
    assert!(world_records >= 1);

    let ranks = h.service().top(&cohort, usize::MAX).await.unwrap();
    assert_eq!(ranks.len(), users.len());
    for (i, rank) in ranks.iter().enumerate() {
        assert_eq!(rank.rank, i as u32 + 1);
    }

    let mut previous = 0.0;
    for rank in &ranks {
        let run = h.service().run(rank.run_id).await.unwrap();
        assert!(run.time >= previous);
        previous = run.time;
    }

    // every rank row points at the user's fastest attempt
    let best = h.service().run(ranks[0].run_id).await.unwrap();
    assert_eq!(best.ticks, 2_000 - 11 * 13 - 3 * 50);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_sessions_for_distinct_users() {
    let h = Arc::new(TestHarness::new().await);
    let map = h.staged_map("surf_rush", 2, 4).await;

    let mut handles = Vec::new();
    for i in 0..8u32 {
        let h = Arc::clone(&h);
        let map = map.clone();
        handles.push(tokio::spawn(async move {
            let user = h.user(&format!("surfer{i}")).await;
            h.complete_run(&user, &map, 0, 0, 4_000 + i * 10).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let ranks = h
        .service()
        .top(&CohortKey::track(map.id, 0), usize::MAX)
        .await
        .unwrap();
    let got: Vec<u32> = ranks.iter().map(|r| r.rank).collect();
    assert_eq!(got, (1..=8).collect::<Vec<u32>>());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_session_creates_leave_one_session() {
    let h = Arc::new(TestHarness::new().await);
    let map = h.staged_map("bhop_twins", 1, 2).await;
    let user = h.user("double_clicker").await;

    for round in 0..50u32 {
        let (a, b) = tokio::join!(
            h.service().create_session(user.id, map.id, 0, 0),
            h.service().create_session(user.id, map.id, 0, 0),
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_ne!(a.id, b.id);

        let active = h
            .service()
            .sessions()
            .active_session(user.id)
            .await
            .unwrap()
            .expect("one session survives");
        assert!(active.id == a.id || active.id == b.id, "round {round}");

        let stale = if active.id == a.id { b.id } else { a.id };
        assert!(h
            .service()
            .update_session(stale, user.id, 1, 10)
            .await
            .is_err());
        h.service()
            .update_session(active.id, user.id, 1, 10)
            .await
            .unwrap();
    }
}
