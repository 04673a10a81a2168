//! Sync engine lifecycle, retries and change feeds.

use std::time::Duration;

use portal::{
    config::{RemoteChangePolicy, RemoteChanges},
    notify::NoticeKind,
    reconcile::Change,
    records::{Collection, RecordId},
    sync::SyncState,
};
use serde_json::json;

use crate::helpers::{self, EMAIL, PASSWORD, TestPortal, fast_config, within};

fn project_ids(ctx: &TestPortal) -> Vec<String> {
    ctx.portal
        .mirrors()
        .projects
        .snapshot()
        .into_iter()
        .map(|p| p.id.as_str().to_string())
        .collect()
}

#[tokio::test]
async fn test_login_loads_then_goes_live() {
    let ctx = helpers::setup().await;
    ctx.seed(
        Collection::Projects,
        vec![json!({"id": 1, "name": "P1", "status": "active"})],
    );
    ctx.backend.select_delay(Some(Duration::from_millis(100)));

    ctx.portal.login(EMAIL, PASSWORD).await.unwrap();
    let loading = ctx.wait_for(SyncState::Loading).await;
    assert_eq!(loading.generation, 1);
    assert!(ctx.portal.mirrors().is_empty());

    ctx.wait_for(SyncState::Live).await;
    let projects = ctx.portal.mirrors().projects.snapshot();
    assert_eq!(projects.len(), 1);
    assert_eq!(projects[0].id, RecordId::from(1u64));
    assert_eq!(projects[0].name, "P1");
    assert_eq!(projects[0].status, "active");
    assert_eq!(ctx.backend.open_subscriptions(), 3);
}

#[tokio::test]
async fn test_feedback_is_loaded_newest_first() {
    let ctx = helpers::setup().await;
    ctx.seed(
        Collection::Feedback,
        vec![
            json!({"id": 1, "text": "first", "created_at": "2024-01-01T00:00:00Z"}),
            json!({"id": 2, "text": "second", "created_at": "2024-01-02T00:00:00Z"}),
        ],
    );
    ctx.login().await;

    let texts: Vec<_> = ctx
        .portal
        .mirrors()
        .feedback
        .snapshot()
        .into_iter()
        .map(|f| f.text)
        .collect();
    assert_eq!(texts, vec!["second", "first"]);
}

#[tokio::test]
async fn test_duplicate_delivery_keeps_one_record() {
    let ctx = helpers::setup_live().await;
    ctx.backend.duplicate_events(true);

    ctx.backend.upsert_remote(
        Collection::Projects,
        &ctx.user_id,
        json!({"id": 7, "name": "dup", "status": "active"}),
    );
    helpers::wait_until("record 7", || {
        ctx.portal.mirrors().projects.contains(&RecordId::from(7u64))
    })
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let projects = ctx.portal.mirrors().projects.snapshot();
    assert_eq!(projects.len(), 1);
    assert_eq!(projects[0].name, "dup");
}

#[tokio::test]
async fn test_remote_changes_are_reconciled_in_order() {
    let ctx = helpers::setup_live().await;
    let user = ctx.user_id.clone();

    ctx.backend
        .upsert_remote(Collection::Projects, &user, json!({"id": 1, "name": "a"}));
    ctx.backend
        .upsert_remote(Collection::Projects, &user, json!({"id": 2, "name": "b"}));
    ctx.backend
        .upsert_remote(Collection::Projects, &user, json!({"id": 1, "name": "a2"}));
    ctx.backend
        .delete_remote(Collection::Projects, &user, &RecordId::from(2u64));
    ctx.backend
        .upsert_remote(Collection::Projects, &user, json!({"id": 3, "name": "c"}));

    helpers::wait_until("record 3", || {
        ctx.portal.mirrors().projects.contains(&RecordId::from(3u64))
    })
    .await;
    let names: Vec<_> = ctx
        .portal
        .mirrors()
        .projects
        .snapshot()
        .into_iter()
        .map(|p| p.name)
        .collect();
    assert_eq!(names, vec!["a2", "c"]);
}

#[tokio::test]
async fn test_foreign_records_are_dropped() {
    let ctx = helpers::setup_live().await;
    ctx.backend.emit(
        Collection::Projects,
        &ctx.user_id,
        Change::Insert(json!({"id": 9, "name": "theirs", "user_id": "someone-else"})),
    );
    ctx.backend.upsert_remote(
        Collection::Projects,
        &ctx.user_id,
        json!({"id": 10, "name": "mine"}),
    );

    helpers::wait_until("record 10", || {
        ctx.portal.mirrors().projects.contains(&RecordId::from(10u64))
    })
    .await;
    assert_eq!(project_ids(&ctx), vec!["10"]);
}

#[tokio::test]
async fn test_malformed_event_raises_notice() {
    let ctx = helpers::setup_live().await;
    ctx.backend.emit(
        Collection::Projects,
        &ctx.user_id,
        Change::Insert(json!({"id": 3})),
    );

    helpers::wait_until("notice", || ctx.portal.notifier().current().is_some()).await;
    let notice = ctx.portal.notifier().current().unwrap();
    assert_eq!(notice.kind, NoticeKind::Subscription);
    assert!(ctx.portal.mirrors().projects.is_empty());
    assert_eq!(ctx.portal.engine().state(), SyncState::Live);
}

#[tokio::test]
async fn test_logout_clears_mirrors_and_closes_subscriptions() {
    let ctx = helpers::setup().await;
    ctx.seed(Collection::Projects, vec![json!({"id": 1, "name": "P1"})]);
    ctx.seed(Collection::Assets, vec![json!({"id": 1, "type": "model"})]);
    ctx.login().await;
    assert!(!ctx.portal.mirrors().is_empty());

    ctx.portal.logout().await.unwrap();
    assert!(ctx.portal.mirrors().is_empty());
    let status = ctx.wait_for(SyncState::Idle).await;
    assert_eq!(status.generation, 2);
    assert!(ctx.portal.mirrors().is_empty());
    assert_eq!(ctx.backend.open_subscriptions(), 0);

    // Events for the old session no longer reach the mirrors
    ctx.backend
        .emit(Collection::Projects, &ctx.user_id, Change::Insert(json!({"id": 2, "name": "late"})));
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(ctx.portal.mirrors().is_empty());
}

#[tokio::test]
async fn test_logout_empties_mirrors_before_returning() {
    let ctx = helpers::setup().await;
    ctx.seed(Collection::Projects, vec![json!({"id": 1, "name": "P1"})]);
    ctx.seed(Collection::Assets, vec![json!({"id": 1, "type": "model"})]);
    ctx.seed(
        Collection::Feedback,
        vec![json!({"id": 1, "text": "hi", "created_at": "2024-01-01T00:00:00Z"})],
    );
    ctx.login().await;

    ctx.portal.logout().await.unwrap();
    let mirrors = ctx.portal.mirrors();
    assert_eq!(mirrors.projects.snapshot().len(), 0);
    assert_eq!(mirrors.assets.snapshot().len(), 0);
    assert_eq!(mirrors.feedback.snapshot().len(), 0);
}

#[tokio::test]
async fn test_next_user_never_sees_previous_records() {
    let ctx = helpers::setup().await;
    let other = ctx.backend.add_user("c@d.com", "y");
    ctx.seed(Collection::Projects, vec![json!({"id": 1, "name": "P1"})]);
    ctx.backend
        .seed(Collection::Projects, &other, vec![json!({"id": 2, "name": "P2"})]);
    ctx.login().await;

    ctx.portal.logout().await.unwrap();
    ctx.portal.login("c@d.com", "y").await.unwrap();

    let owned_by_other = || {
        ctx.portal
            .mirrors()
            .projects
            .snapshot()
            .iter()
            .all(|p| p.user_id.as_deref() == Some(other.as_str()))
    };
    assert!(owned_by_other());
    helpers::wait_until("second user's projects", || project_ids(&ctx) == vec!["2"]).await;
    assert!(owned_by_other());
}

#[tokio::test]
async fn test_external_invalidation_tears_down() {
    let ctx = helpers::setup().await;
    ctx.seed(Collection::Projects, vec![json!({"id": 1, "name": "P1"})]);
    ctx.login().await;

    ctx.backend.invalidate_session();
    ctx.wait_for(SyncState::Idle).await;
    assert!(!ctx.portal.session().is_active());
    assert!(ctx.portal.mirrors().is_empty());
    assert_eq!(ctx.backend.open_subscriptions(), 0);
}

#[tokio::test]
async fn test_results_from_previous_session_are_discarded() {
    let ctx = helpers::setup().await;
    let other = ctx.backend.add_user("c@d.com", "y");
    ctx.seed(Collection::Projects, vec![json!({"id": 1, "name": "first user"})]);
    ctx.backend
        .seed(Collection::Projects, &other, vec![json!({"id": 2, "name": "second user"})]);
    ctx.backend.select_delay(Some(Duration::from_millis(100)));

    ctx.portal.login(EMAIL, PASSWORD).await.unwrap();
    ctx.wait_for(SyncState::Loading).await;
    ctx.portal.logout().await.unwrap();
    ctx.portal.login("c@d.com", "y").await.unwrap();

    let status = ctx.wait_for(SyncState::Live).await;
    assert_eq!(status.generation, ctx.portal.sessions().generation());
    assert_eq!(project_ids(&ctx), vec!["2"]);

    // Nothing from the first session shows up later either
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(project_ids(&ctx), vec!["2"]);
}

#[tokio::test]
async fn test_failed_load_is_retried() {
    let ctx = helpers::setup().await;
    ctx.seed(Collection::Projects, vec![json!({"id": 1, "name": "P1"})]);
    ctx.backend.fail_next_selects(1);

    ctx.login().await;
    assert_eq!(project_ids(&ctx), vec!["1"]);
    assert_eq!(ctx.portal.status().last_error, None);
    // The failure was surfaced while retrying
    let notice = ctx.portal.notifier().current().unwrap();
    assert_eq!(notice.kind, NoticeKind::Data);
}

#[tokio::test]
async fn test_suspends_after_three_failures_and_recovers() {
    let ctx = helpers::setup().await;
    ctx.seed(Collection::Projects, vec![json!({"id": 1, "name": "P1"})]);
    ctx.backend.fail_all_selects(true);

    ctx.portal.login(EMAIL, PASSWORD).await.unwrap();
    let status = ctx.wait_for(SyncState::Suspended).await;
    assert!(status.last_error.is_some());
    assert_eq!(ctx.portal.notifier().current().unwrap().kind, NoticeKind::Data);
    assert!(ctx.portal.mirrors().is_empty());

    // No more attempts once suspended
    let selects = ctx.backend.calls().selects();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(ctx.backend.calls().selects(), selects);

    ctx.backend.fail_all_selects(false);
    within(ctx.portal.engine().refresh()).await.unwrap();
    assert_eq!(ctx.portal.engine().state(), SyncState::Live);
    assert_eq!(project_ids(&ctx), vec!["1"]);
    assert_eq!(ctx.backend.open_subscriptions(), 3);
}

#[tokio::test]
async fn test_refresh_buffers_events_until_reload_completes() {
    let ctx = helpers::setup().await;
    ctx.seed(Collection::Projects, vec![json!({"id": 1, "name": "P1"})]);
    ctx.login().await;
    ctx.backend.select_delay(Some(Duration::from_millis(150)));

    let engine = ctx.portal.engine();
    let (refreshed, ()) = tokio::join!(engine.refresh(), async {
        ctx.wait_for(SyncState::Loading).await;
        ctx.backend
            .emit(Collection::Projects, &ctx.user_id, Change::Insert(json!({"id": 2, "name": "P2"})));
        tokio::time::sleep(Duration::from_millis(30)).await;
        // Held back while the reload is in flight
        assert!(!ctx.portal.mirrors().projects.contains(&RecordId::from(2u64)));
        assert!(ctx.portal.mirrors().projects.contains(&RecordId::from(1u64)));
    });
    refreshed.unwrap();

    // Replayed on top of the reloaded content
    assert_eq!(project_ids(&ctx), vec!["1", "2"]);
    assert_eq!(ctx.portal.engine().state(), SyncState::Live);
}

#[tokio::test]
async fn test_refresh_during_load_reflects_later_write() {
    let ctx = helpers::setup().await;
    ctx.seed(
        Collection::Projects,
        vec![json!({"id": 1, "name": "P1"}), json!({"id": 2, "name": "P2"})],
    );
    ctx.login().await;
    // Only the reload can reveal the delete
    ctx.backend.drop_events(true);
    ctx.backend.select_delay(Some(Duration::from_millis(100)));
    let selects = ctx.backend.calls().selects();

    let engine = ctx.portal.engine();
    let (refreshed, deleted) = tokio::join!(engine.refresh(), async {
        // The running reload has read its rows before the delete lands
        helpers::wait_until("reload queried", || ctx.backend.calls().selects() >= selects + 3).await;
        ctx.portal.gateway().delete_project(1u64).await
    });
    refreshed.unwrap();
    deleted.unwrap();

    assert_eq!(project_ids(&ctx), vec!["2"]);
    assert!(ctx.backend.calls().selects() >= selects + 6);
    assert_eq!(ctx.portal.engine().state(), SyncState::Live);
}

#[tokio::test]
async fn test_refresh_without_session_fails() {
    let ctx = helpers::setup().await;
    let err = ctx.portal.engine().refresh().await.unwrap_err();
    assert!(matches!(err, portal::Error::Sync(_)));
}

#[tokio::test]
async fn test_resubscribes_after_stream_failure() {
    let ctx = helpers::setup_live().await;

    ctx.backend.interrupt_subscriptions(Collection::Projects);
    assert_eq!(ctx.backend.open_subscriptions(), 2);
    helpers::wait_until("resubscription", || ctx.backend.open_subscriptions() == 3).await;
    ctx.wait_for(SyncState::Live).await;

    ctx.backend.upsert_remote(
        Collection::Projects,
        &ctx.user_id,
        json!({"id": 5, "name": "after"}),
    );
    helpers::wait_until("record 5", || {
        ctx.portal.mirrors().projects.contains(&RecordId::from(5u64))
    })
    .await;
}

#[tokio::test]
async fn test_exhausted_resubscription_raises_notice() {
    let ctx = helpers::setup_live().await;
    ctx.backend.fail_next_subscribes(3);

    ctx.backend.interrupt_subscriptions(Collection::Assets);
    helpers::wait_until("notice", || ctx.portal.notifier().current().is_some()).await;
    let notice = ctx.portal.notifier().current().unwrap();
    assert_eq!(notice.kind, NoticeKind::Subscription);
    assert!(notice.message.contains("assets"));
    assert_eq!(ctx.backend.open_subscriptions(), 2);

    // A manual refresh reopens the missing feed
    within(ctx.portal.engine().refresh()).await.unwrap();
    assert_eq!(ctx.backend.open_subscriptions(), 3);
}

#[tokio::test]
async fn test_reload_policy_refreshes_on_remote_change() {
    let mut config = fast_config();
    config.remote_changes = RemoteChanges {
        projects: RemoteChangePolicy::Reload,
        ..RemoteChanges::default()
    };
    let ctx = helpers::setup_with(config).await;
    ctx.login().await;
    let selects = ctx.backend.calls().selects();

    ctx.backend.upsert_remote(
        Collection::Projects,
        &ctx.user_id,
        json!({"id": 4, "name": "remote"}),
    );
    helpers::wait_until("record 4", || {
        ctx.portal.mirrors().projects.contains(&RecordId::from(4u64))
    })
    .await;
    assert!(ctx.backend.calls().selects() >= selects + 3);
}

#[tokio::test]
async fn test_shutdown_stops_engine() {
    let ctx = helpers::setup_live().await;
    ctx.portal.engine().shutdown();
    helpers::wait_until("subscriptions closed", || ctx.backend.open_subscriptions() == 0).await;

    let err = within(ctx.portal.engine().refresh()).await.unwrap_err();
    assert!(err.is_engine_stopped());
}
