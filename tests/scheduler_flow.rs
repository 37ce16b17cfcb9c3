mod common;

use chrono::{NaiveTime, Utc};
use common::{open_app, open_app_with};
use serde_json::json;
use stepmon_lib::models::{CheckSource, FetchResult, InvestTarget, PreferenceUpdate, ScheduleDecision, TaskState};

#[tokio::test]
async fn lifecycle_hooks_never_replace_a_pending_request() {
    let harness = open_app();

    let launch = harness.app.on_launch().await;
    let ScheduleDecision::Submitted { earliest_begin } = launch else {
        panic!("launch should submit");
    };
    assert!(earliest_begin > Utc::now() + chrono::Duration::minutes(14));

    let foreground = harness.app.on_foreground_active().await;
    let background = harness.app.on_background_transition().await;
    assert!(matches!(foreground, ScheduleDecision::AlreadyPending { pending: 1 }));
    assert!(matches!(background, ScheduleDecision::AlreadyPending { pending: 1 }));

    assert_eq!(harness.tasks.submission_count(), 1);
    assert_eq!(harness.pending_count().await, 1);
    assert_eq!(harness.app.scheduler().state(), TaskState::Scheduled);
}

#[tokio::test]
async fn rapid_triggers_inside_throttle_window_are_dropped() {
    let harness = open_app_with(json!({}));
    assert!(matches!(harness.app.on_launch().await, ScheduleDecision::Submitted { .. }));
    assert_eq!(harness.app.on_foreground_active().await, ScheduleDecision::Throttled);
    assert_eq!(harness.app.on_background_transition().await, ScheduleDecision::Throttled);
    assert_eq!(harness.tasks.submission_count(), 1);
}

#[tokio::test]
async fn wake_records_history_alerts_and_rearms() {
    let harness = open_app();
    harness.steps.record(Utc::now() - chrono::Duration::minutes(5), 30);
    harness.app.on_launch().await;

    assert!(harness.wake().await);

    let history = harness.app.history(10).expect("history");
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].steps_in_window, 30);
    assert_eq!(history[0].source, CheckSource::BackgroundTask);
    assert!(history[0].was_notified);

    let alerts = harness.notifications.posted();
    assert_eq!(alerts.len(), 1);
    assert!(alerts[0].body.contains("now: 30 steps"));

    assert_eq!(harness.pending_count().await, 1);
    assert_eq!(harness.tasks.completion_count(), 1);
    assert_eq!(harness.app.scheduler().state(), TaskState::Scheduled);
}

#[tokio::test]
async fn goal_met_wake_stays_quiet() {
    let harness = open_app();
    harness.steps.record(Utc::now() - chrono::Duration::minutes(1), 5_000);
    harness.app.on_launch().await;

    assert!(harness.wake().await);
    assert!(harness.notifications.posted().is_empty());
    assert!(!harness.app.history(1).expect("history")[0].was_notified);
}

#[tokio::test]
async fn unavailable_pedometer_counts_as_zero() {
    let harness = open_app();
    harness.steps.set_available(false);
    harness.app.on_launch().await;

    assert!(harness.wake().await);
    let history = harness.app.history(1).expect("history");
    let entry = &history[0];
    assert_eq!(entry.steps_in_window, 0);
    assert!(!entry.measurement_available);
    assert_eq!(harness.notifications.posted().len(), 1);
}

#[tokio::test]
async fn silent_push_and_foreground_refresh_share_the_check() {
    let harness = open_app();
    harness.steps.record(Utc::now(), 10);

    assert_eq!(harness.app.silent_push().handle().await, FetchResult::NewData);
    let report = harness.app.refresh_now().await.expect("refresh").expect("report");
    assert_eq!(report.source, CheckSource::Foreground);

    let sources: Vec<CheckSource> = harness
        .app
        .history(10)
        .expect("history")
        .iter()
        .map(|entry| entry.source)
        .collect();
    assert_eq!(sources, vec![CheckSource::Foreground, CheckSource::SilentPush]);
}

#[tokio::test]
async fn history_is_capped_across_runs() {
    let harness = open_app_with(json!({ "submitThrottleSeconds": 0, "historyCap": 3 }));
    for _ in 0..5 {
        harness.app.refresh_now().await.expect("refresh");
    }
    assert_eq!(harness.app.history(10).expect("history").len(), 3);
}

#[tokio::test]
async fn notification_toggle_queues_settings_upload() {
    let harness = open_app();
    let updated = harness
        .app
        .update_preference(PreferenceUpdate {
            is_notification_enabled: Some(false),
            quiet_hours_start: NaiveTime::from_hms_opt(9, 0, 0),
            quiet_hours_end: NaiveTime::from_hms_opt(21, 0, 0),
            ..PreferenceUpdate::default()
        })
        .expect("update");
    assert!(!updated.is_notification_enabled);

    let pending = harness
        .app
        .relay()
        .settings_uploader()
        .pending()
        .expect("pending")
        .expect("queued");
    assert_eq!(pending["isNotificationEnabled"], json!(false));
    assert_eq!(pending["startMinutes"], json!(540));
    assert_eq!(pending["endMinutes"], json!(1260));

    harness.steps.record(Utc::now(), 0);
    harness.app.refresh_now().await.expect("refresh");
    assert!(harness.notifications.posted().is_empty());
}

#[tokio::test]
async fn threshold_edit_does_not_touch_relay() {
    let harness = open_app();
    harness
        .app
        .update_preference(PreferenceUpdate {
            step_threshold: Some(300),
            ..PreferenceUpdate::default()
        })
        .expect("update");
    assert_eq!(harness.app.preference().expect("pref").step_threshold, 300);
    assert!(harness
        .app
        .relay()
        .settings_uploader()
        .pending()
        .expect("pending")
        .is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn garden_actions_never_clobber_the_check_mirror() {
    let harness = open_app();
    harness.app.garden().tap_tree(Utc::now()).expect("tap");

    for round in 0..100u32 {
        harness.steps.record(Utc::now(), round);
        let garden = harness.app.garden().clone();
        let investing = tokio::task::spawn_blocking(move || {
            for _ in 0..5 {
                garden.invest(InvestTarget::Tree).expect("invest");
            }
        });
        harness.app.refresh_now().await.expect("refresh");
        investing.await.expect("join");

        let latest = harness.app.history(1).expect("history").remove(0);
        let pref = harness.app.preference().expect("pref");
        assert_eq!(pref.last_background_steps, Some(latest.steps_in_window), "round {}", round);
        assert_eq!(pref.last_background_check_time, Some(latest.timestamp), "round {}", round);
    }
}
