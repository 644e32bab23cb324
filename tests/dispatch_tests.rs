//! Tests for the campaign dispatch loop.

use chrono::{NaiveDate, NaiveTime};
use integrations_smtp_campaign::mocks::{
    self, FixedStatusSource, MockClock, MockConnector, MockRelayBehavior, RecordingObserver,
};
use integrations_smtp_campaign::{
    CampaignDispatcher, CampaignErrorKind, CampaignEvent, CampaignObserver, CompletionReason,
    DeliveryStatus, DispatchMode, DispatchState, RecipientTable, SendOutcome, StopHandle,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

fn dispatcher(
    behavior: MockRelayBehavior,
    status: DeliveryStatus,
) -> (
    CampaignDispatcher<MockConnector>,
    Arc<mocks::MockRelayState>,
    Arc<RecordingObserver>,
) {
    let connector = MockConnector::new(behavior);
    let state = connector.state();
    let observer = Arc::new(RecordingObserver::new());
    let dispatcher = CampaignDispatcher::new(mocks::test_config(), connector)
        .unwrap()
        .with_observer(observer.clone())
        .with_status_source(Box::new(FixedStatusSource::new(status)));
    (dispatcher, state, observer)
}

#[tokio::test(start_paused = true)]
async fn test_counters_add_up_after_every_recipient() {
    let behavior = MockRelayBehavior::default()
        .permanent_failure(&mocks::recipient_email(1))
        .always_transient(&mocks::recipient_email(3));
    let (mut dispatcher, _, observer) = dispatcher(behavior, DeliveryStatus::Delivered);

    let report = dispatcher.run(&mocks::recipient_table(5)).await.unwrap();

    let snapshots: Vec<_> = observer
        .events()
        .into_iter()
        .filter_map(|event| match event {
            CampaignEvent::MetricsUpdated(snapshot) => Some(snapshot),
            _ => None,
        })
        .collect();
    assert_eq!(snapshots.len(), 5);
    for snapshot in &snapshots {
        assert_eq!(snapshot.sent + snapshot.failed + snapshot.pending, snapshot.total);
    }
    assert_eq!(report.metrics.sent, 3);
    assert_eq!(report.metrics.failed, 2);
    assert_eq!(report.metrics.pending, 0);
    assert_eq!(report.completion, CompletionReason::AllProcessed);
}

#[tokio::test(start_paused = true)]
async fn test_response_rate_bounds() {
    let (mut opened, _, _) = dispatcher(MockRelayBehavior::default(), DeliveryStatus::Opened);
    let report = opened.run(&mocks::recipient_table(4)).await.unwrap();
    assert_eq!(report.metrics.response_rate, 1.0);

    let (mut delivered, _, _) = dispatcher(MockRelayBehavior::default(), DeliveryStatus::Delivered);
    let report = delivered.run(&mocks::recipient_table(4)).await.unwrap();
    assert_eq!(report.metrics.response_rate, 0.0);

    let behavior = MockRelayBehavior::default().permanent_failure(&mocks::recipient_email(0));
    let (mut none_sent, _, _) = dispatcher(behavior, DeliveryStatus::Opened);
    let report = none_sent.run(&mocks::recipient_table(1)).await.unwrap();
    assert_eq!(report.metrics.sent, 0);
    assert_eq!(report.metrics.response_rate, 0.0);
}

#[tokio::test(start_paused = true)]
async fn test_daily_cap_leaves_rest_pending() {
    let connector = MockConnector::new(MockRelayBehavior::default());
    let state = connector.state();
    let observer = Arc::new(RecordingObserver::new());
    let mut config = mocks::test_config();
    config.throttle.daily_limit = 5;
    let mut dispatcher = CampaignDispatcher::new(config, connector)
        .unwrap()
        .with_observer(observer.clone());

    let report = dispatcher.run(&mocks::recipient_table(10)).await.unwrap();

    assert_eq!(report.completion, CompletionReason::DailyCapReached);
    assert_eq!(report.outcomes.len(), 5);
    assert!(report.outcomes.iter().all(|o| o.outcome.is_sent()));
    assert_eq!(report.metrics.sent, 5);
    assert_eq!(report.metrics.pending, 5);
    assert_eq!(state.sent_messages().len(), 5);
    assert_eq!(dispatcher.state(), DispatchState::Completed);
    assert_eq!(
        observer.count(|e| matches!(e, CampaignEvent::DailyLimitReached { limit: 5 })),
        1
    );
    assert_eq!(state.closes(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_missing_email_column_fails_before_connecting() {
    let err = RecipientTable::from_reader("Company Name,Contact Person\nAcme,Ann\n".as_bytes())
        .unwrap_err();
    assert_eq!(err.kind(), CampaignErrorKind::MissingColumns);
    assert!(err.message().contains("Email"));

    let (mut dispatcher, state, _) = dispatcher(MockRelayBehavior::default(), DeliveryStatus::Delivered);
    let err = dispatcher.run(&RecipientTable::default()).await.unwrap_err();

    assert_eq!(err.kind(), CampaignErrorKind::MissingColumns);
    assert_eq!(state.opens(), 0);
    assert_eq!(dispatcher.state(), DispatchState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_auth_failure_processes_nobody() {
    let behavior = MockRelayBehavior {
        fail_auth: true,
        ..Default::default()
    };
    let (mut dispatcher, state, observer) = dispatcher(behavior, DeliveryStatus::Delivered);

    let err = dispatcher.run(&mocks::recipient_table(3)).await.unwrap_err();

    assert_eq!(err.kind(), CampaignErrorKind::CredentialsInvalid);
    assert!(dispatcher.outcomes().is_empty());
    assert_eq!(state.total_attempts(), 0);
    assert_eq!(state.opens(), 1);
    assert_eq!(state.closes(), 1);
    assert_eq!(dispatcher.state(), DispatchState::Failed);
    assert_eq!(dispatcher.metrics().pending(), 3);
    assert_eq!(
        observer.count(|e| matches!(e, CampaignEvent::ConnectionFailed { .. })),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_record_failure() {
    let target = mocks::recipient_email(0);
    let behavior = MockRelayBehavior::default().always_transient(&target);
    let (mut dispatcher, state, observer) = dispatcher(behavior, DeliveryStatus::Delivered);

    let started = Instant::now();
    let report = dispatcher.run(&mocks::recipient_table(1)).await.unwrap();

    assert_eq!(
        observer.retry_delays(),
        vec![
            Duration::from_secs(5),
            Duration::from_secs(10),
            Duration::from_secs(20)
        ]
    );
    assert_eq!(started.elapsed(), Duration::from_secs(35));
    assert_eq!(state.attempts_for(&target), 3);

    match &report.outcomes[0].outcome {
        SendOutcome::Failed { reason, attempts } => {
            assert_eq!(*attempts, 3);
            assert!(reason.starts_with("Failed after 3 attempts"));
        }
        other => panic!("expected failure, got {:?}", other),
    }
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures.entries()[0].email, target);
    assert_eq!(
        report.failure_summary().as_deref(),
        Some("1 emails failed to send. Check log for details.")
    );
}

#[tokio::test(start_paused = true)]
async fn test_retry_attempts_are_spaced_by_backoff() {
    let target = mocks::recipient_email(0);
    let behavior = MockRelayBehavior::default().transient_failures(&target, 2);
    let (mut dispatcher, state, _) = dispatcher(behavior, DeliveryStatus::Delivered);

    let report = dispatcher.run(&mocks::recipient_table(1)).await.unwrap();

    let times = state.attempt_times(&target);
    assert_eq!(times.len(), 3);
    assert_eq!(times[1] - times[0], Duration::from_secs(5));
    assert_eq!(times[2] - times[1], Duration::from_secs(10));
    assert!(matches!(
        report.outcomes[0].outcome,
        SendOutcome::Sent { attempts: 3, .. }
    ));
}

#[tokio::test(start_paused = true)]
async fn test_throttle_pauses_once_per_window() {
    let (mut dispatcher, state, observer) = dispatcher(MockRelayBehavior::default(), DeliveryStatus::Delivered);

    let started = Instant::now();
    dispatcher.run(&mocks::recipient_table(11)).await.unwrap();

    let pauses: Vec<_> = observer
        .events()
        .into_iter()
        .filter_map(|event| match event {
            CampaignEvent::ThrottlePause { index, pause } => Some((index, pause)),
            _ => None,
        })
        .collect();
    assert_eq!(pauses, vec![(10, Duration::from_secs(60))]);
    assert_eq!(started.elapsed(), Duration::from_secs(60));

    let ninth = state.attempt_times(&mocks::recipient_email(9))[0];
    let tenth = state.attempt_times(&mocks::recipient_email(10))[0];
    assert_eq!(tenth - ninth, Duration::from_secs(60));
}

struct StopAfterFirstSend {
    stop: StopHandle,
}

impl CampaignObserver for StopAfterFirstSend {
    fn on_event(&self, event: &CampaignEvent) {
        if matches!(event, CampaignEvent::RecipientSent { .. }) {
            self.stop.request_stop();
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_stop_request_ends_run_between_recipients() {
    let connector = MockConnector::new(MockRelayBehavior::default());
    let state = connector.state();
    let stop = StopHandle::new();
    let mut dispatcher = CampaignDispatcher::new(mocks::test_config(), connector)
        .unwrap()
        .with_stop_handle(stop.clone())
        .with_observer(Arc::new(StopAfterFirstSend { stop }));

    let report = dispatcher.run(&mocks::recipient_table(4)).await.unwrap();

    assert_eq!(report.completion, CompletionReason::Stopped);
    assert_eq!(report.outcomes.len(), 1);
    assert_eq!(report.metrics.pending, 3);
    assert_eq!(state.closes(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_fatal_error_mid_run_aborts_and_closes_once() {
    let behavior = MockRelayBehavior::default().fatal_failure(&mocks::recipient_email(1));
    let (mut dispatcher, state, observer) = dispatcher(behavior, DeliveryStatus::Delivered);

    let err = dispatcher.run(&mocks::recipient_table(3)).await.unwrap_err();

    assert_eq!(err.kind(), CampaignErrorKind::AuthenticationRequired);
    assert_eq!(dispatcher.state(), DispatchState::Failed);
    assert_eq!(dispatcher.outcomes().len(), 1);
    assert_eq!(state.attempts_for(&mocks::recipient_email(2)), 0);
    assert_eq!(state.closes(), 1);
    assert_eq!(observer.count(|e| matches!(e, CampaignEvent::Aborted { .. })), 1);
}

#[tokio::test(start_paused = true)]
async fn test_scheduled_run_waits_for_release_time() {
    let start = NaiveDate::from_ymd_opt(2024, 3, 1)
        .and_then(|d| d.and_hms_opt(9, 0, 0))
        .unwrap();
    let connector = MockConnector::new(MockRelayBehavior::default());
    let state = connector.state();
    let observer = Arc::new(RecordingObserver::new());
    let mut config = mocks::test_config();
    config.dispatch = DispatchMode::Scheduled {
        at: NaiveTime::from_hms_opt(9, 1, 0).unwrap(),
    };
    let mut dispatcher = CampaignDispatcher::new(config, connector)
        .unwrap()
        .with_observer(observer.clone())
        .with_clock(Arc::new(MockClock::starting_at(start)));

    let started = Instant::now();
    dispatcher.run(&mocks::recipient_table(1)).await.unwrap();

    let first_send = state.attempt_times(&mocks::recipient_email(0))[0];
    assert_eq!(first_send - started, Duration::from_secs(60));

    let messages = observer.messages();
    let waiting = messages
        .iter()
        .position(|m| m.starts_with("Waiting until 09:01:00"))
        .unwrap();
    let reached = messages
        .iter()
        .position(|m| m == "Scheduled time reached. Starting to send emails.")
        .unwrap();
    let sent = messages.iter().position(|m| m.starts_with("Email sent to")).unwrap();
    assert!(waiting < reached && reached < sent);
}

#[tokio::test(start_paused = true)]
async fn test_messages_are_personalized() {
    let (mut dispatcher, state, _) = dispatcher(MockRelayBehavior::default(), DeliveryStatus::Delivered);
    dispatcher.run(&mocks::recipient_table(2)).await.unwrap();

    let sent = state.sent_messages();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[1].to, "contact1@company1.test");
    assert_eq!(sent[1].from, "sender@example.com");
    assert!(sent[1].body.contains("Person 1"));
    assert!(sent[1].body.contains("Company 1"));
    assert!(!sent[1].body.contains('{'));
}

#[tokio::test(start_paused = true)]
async fn test_failure_ledger_written_as_json() {
    let behavior = MockRelayBehavior::default().permanent_failure(&mocks::recipient_email(0));
    let (mut dispatcher, _, _) = dispatcher(behavior, DeliveryStatus::Delivered);
    dispatcher.run(&mocks::recipient_table(2)).await.unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("failed_emails.json");
    dispatcher.failures().write_json(&path).unwrap();

    let written: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    let entries = written.as_array().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["email"], "contact0@company0.test");
    assert!(entries[0]["error"].as_str().unwrap().contains("550"));
}
