use runboard::activity::ActivityEvent;
use runboard::model::{Follow, MapNotify};
use runboard::testing::TestHarness;
use runboard::types::{ActivityFlags, ActivityType, UserId};

async fn follow(h: &TestHarness, follower: UserId, followed: UserId, notify_on: ActivityFlags) {
    h.service()
        .follow(Follow {
            follower_id: follower,
            followed_id: followed,
            notify_on,
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn follower_and_map_watcher_get_one_notification() {
    let h = TestHarness::new().await;
    let a = h.user("a").await;
    let b = h.user("b").await;
    let map = h.linear_map("bhop_watch", 2).await;

    follow(&h, a.id, b.id, ActivityFlags::WR_ACHIEVED).await;
    h.service()
        .subscribe_map(MapNotify {
            user_id: a.id,
            map_id: map.id,
            notify_on: ActivityFlags::WR_ACHIEVED,
        })
        .await
        .unwrap();

    let completed = h.complete_run(&b, &map, 0, 0, 700).await.unwrap();
    let activity = completed.activity.unwrap();
    assert_eq!(activity.activity.kind, ActivityType::WrAchieved);
    assert_eq!(activity.recipients, vec![a.id]);

    let inbox = h.service().notifications_for(a.id).await.unwrap();
    assert_eq!(inbox.len(), 1);
    assert_eq!(inbox[0].activity_id, activity.activity.id);
    assert!(!inbox[0].read);
    assert_eq!(h.service().metrics().notifications_written.get(), 1);
}

#[tokio::test]
async fn filters_decide_pb_and_wr_routing() {
    let h = TestHarness::new().await;
    let leader = h.user("leader").await;
    let chaser = h.user("chaser").await;
    let wr_fan = h.user("wr_fan").await;
    let pb_fan = h.user("pb_fan").await;
    let watcher = h.user("watcher").await;
    let map = h.linear_map("bhop_route", 3).await;

    follow(&h, wr_fan.id, chaser.id, ActivityFlags::WR_ACHIEVED).await;
    follow(&h, pb_fan.id, chaser.id, ActivityFlags::PB_ACHIEVED).await;
    h.service()
        .subscribe_map(MapNotify {
            user_id: watcher.id,
            map_id: map.id,
            notify_on: ActivityFlags::PB_ACHIEVED | ActivityFlags::WR_ACHIEVED,
        })
        .await
        .unwrap();

    h.complete_run(&leader, &map, 0, 0, 500).await.unwrap();

    // a personal best behind the leader is not a world record
    let pb = h.complete_run(&chaser, &map, 0, 0, 600).await.unwrap();
    let pb_activity = pb.activity.unwrap();
    assert_eq!(pb_activity.activity.kind, ActivityType::PbAchieved);
    let mut expected = vec![pb_fan.id, watcher.id];
    expected.sort();
    assert_eq!(pb_activity.recipients, expected);

    // a world record is reported only as a world record
    let wr = h.complete_run(&chaser, &map, 0, 0, 400).await.unwrap();
    let wr_activity = wr.activity.unwrap();
    assert_eq!(wr_activity.activity.kind, ActivityType::WrAchieved);
    let mut expected = vec![wr_fan.id, watcher.id];
    expected.sort();
    assert_eq!(wr_activity.recipients, expected);

    assert_eq!(h.service().notifications_for(pb_fan.id).await.unwrap().len(), 1);
    assert_eq!(h.service().notifications_for(wr_fan.id).await.unwrap().len(), 1);
    assert_eq!(h.service().notifications_for(watcher.id).await.unwrap().len(), 3);
}

#[tokio::test]
async fn map_events_skip_map_subscribers() {
    let h = TestHarness::new().await;
    let mapper = h.user("mapper").await;
    let fan = h.user("fan").await;
    let watcher = h.user("watcher").await;
    let map = h.linear_map("bhop_new", 1).await;

    follow(&h, fan.id, mapper.id, ActivityFlags::MAP_UPLOADED).await;
    h.service()
        .subscribe_map(MapNotify {
            user_id: watcher.id,
            map_id: map.id,
            notify_on: ActivityFlags::all(),
        })
        .await
        .unwrap();

    let outcome = h
        .service()
        .record_activity(ActivityEvent::map(ActivityType::MapUploaded, mapper.id, map.id))
        .await
        .unwrap();
    assert_eq!(outcome.recipients, vec![fan.id]);
    assert!(h.service().notifications_for(watcher.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn non_improving_run_notifies_nobody() {
    let h = TestHarness::new().await;
    let runner = h.user("runner").await;
    let fan = h.user("fan").await;
    let map = h.linear_map("bhop_slow", 2).await;
    follow(&h, fan.id, runner.id, ActivityFlags::all()).await;

    h.complete_run(&runner, &map, 0, 0, 300).await.unwrap();
    let slower = h.complete_run(&runner, &map, 0, 0, 400).await.unwrap();
    assert!(slower.activity.is_none());
    assert_eq!(h.service().notifications_for(fan.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn read_state_is_per_recipient() {
    let h = TestHarness::new().await;
    let runner = h.user("runner").await;
    let fan = h.user("fan").await;
    let other = h.user("other").await;
    let map = h.linear_map("bhop_read", 2).await;
    follow(&h, fan.id, runner.id, ActivityFlags::WR_ACHIEVED).await;
    follow(&h, other.id, runner.id, ActivityFlags::WR_ACHIEVED).await;

    h.complete_run(&runner, &map, 0, 0, 300).await.unwrap();
    let id = h.service().notifications_for(fan.id).await.unwrap()[0].id;
    h.service().mark_read(fan.id, id).await.unwrap();

    assert!(h.service().notifications_for(fan.id).await.unwrap()[0].read);
    assert!(!h.service().notifications_for(other.id).await.unwrap()[0].read);
    let err = h.service().mark_read(other.id, id).await.unwrap_err();
    assert_eq!(err.status_code(), 403);
}

#[tokio::test]
async fn direct_submission_also_fans_out() {
    let h = TestHarness::new().await;
    let runner = h.user("runner").await;
    let fan = h.user("fan").await;
    let map = h.linear_map("bhop_direct", 2).await;
    follow(&h, fan.id, runner.id, ActivityFlags::WR_ACHIEVED).await;

    h.service()
        .submit(runboard::model::NewRun {
            user_id: runner.id,
            cohort: runboard::types::CohortKey::track(map.id, 0),
            ticks: 250,
            tick_rate: 1.0,
            hash: "direct-250".into(),
            file_ref: None,
        })
        .await
        .unwrap();
    assert_eq!(h.service().notifications_for(fan.id).await.unwrap().len(), 1);
}
