mod common;

use common::{fast_config, inbound, start_gateway, MockModem, RecordingPublisher};
use smsgate::error::GatewayError;
use smsgate::modem::MessageState;
use smsgate::monitor::{CycleOutcome, MonitorConfig, SmsMonitor};
use smsgate::publisher::StatusEvent;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

fn monitor_over(modem: &MockModem, publisher: &Arc<RecordingPublisher>, dir: &std::path::Path, auto_delete: bool) -> SmsMonitor {
    let gateway = start_gateway(modem.clone(), publisher.clone(), fast_config(), dir);
    SmsMonitor::new(
        gateway,
        publisher.clone(),
        MonitorConfig {
            auto_delete,
            ..MonitorConfig::default()
        },
    )
}

fn delivered_ids(publisher: &RecordingPublisher) -> Vec<u32> {
    publisher
        .events()
        .into_iter()
        .filter_map(|e| match e {
            StatusEvent::NewMessage(m) => Some(m.id),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn first_cycle_only_delivers_unread() {
    let tmp = tempfile::tempdir().unwrap();
    let modem = MockModem::with_messages(vec![
        inbound(1, "+420777000111", "old news", MessageState::Read),
        inbound(2, "+420777000222", "fresh", MessageState::Unread),
        inbound(3, "+420777000333", "draft", MessageState::Unsent),
    ]);
    let publisher = RecordingPublisher::new();
    let monitor = monitor_over(&modem, &publisher, tmp.path(), false);

    monitor.run_cycle().await.unwrap();
    assert_eq!(delivered_ids(&publisher), vec![2]);

    // a message that arrives later is delivered even if the modem already marked it read
    modem
        .state
        .lock()
        .unwrap()
        .messages
        .push(inbound(4, "+420777000444", "later", MessageState::Read));
    monitor.run_cycle().await.unwrap();
    assert_eq!(delivered_ids(&publisher), vec![2, 4]);
}

#[tokio::test]
async fn seen_messages_are_not_delivered_twice() {
    let tmp = tempfile::tempdir().unwrap();
    let modem = MockModem::with_messages(vec![inbound(1, "+420777000111", "hi", MessageState::Unread)]);
    let publisher = RecordingPublisher::new();
    let monitor = monitor_over(&modem, &publisher, tmp.path(), false);

    for _ in 0..3 {
        monitor.run_cycle().await.unwrap();
    }
    assert_eq!(delivered_ids(&publisher), vec![1]);
    // capacity did not change after the first snapshot
    assert_eq!(publisher.count("capacity"), 1);
}

#[tokio::test]
async fn reused_storage_slot_is_delivered_again() {
    let tmp = tempfile::tempdir().unwrap();
    let modem = MockModem::with_messages(vec![inbound(1, "+420777000111", "first", MessageState::Unread)]);
    let publisher = RecordingPublisher::new();
    let monitor = monitor_over(&modem, &publisher, tmp.path(), false);

    monitor.run_cycle().await.unwrap();
    {
        let mut st = modem.state.lock().unwrap();
        st.messages.clear();
    }
    monitor.run_cycle().await.unwrap();
    {
        let mut st = modem.state.lock().unwrap();
        let mut reused = inbound(1, "+420777000999", "second", MessageState::Unread);
        reused.timestamp = reused.timestamp + chrono::Duration::minutes(5);
        st.messages.push(reused);
    }
    monitor.run_cycle().await.unwrap();
    assert_eq!(delivered_ids(&publisher), vec![1, 1]);
}

#[tokio::test]
async fn overlapping_trigger_is_skipped() {
    let tmp = tempfile::tempdir().unwrap();
    let modem = MockModem::with_messages(vec![inbound(1, "+420777000111", "hi", MessageState::Unread)]);
    modem.set_delay(Duration::from_millis(60));
    let publisher = RecordingPublisher::new();
    let monitor = monitor_over(&modem, &publisher, tmp.path(), false);

    let (first, second) = tokio::join!(monitor.run_cycle(), async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        monitor.run_cycle().await
    });
    assert!(matches!(first.unwrap(), CycleOutcome::Completed(_)));
    assert_eq!(second.unwrap(), CycleOutcome::Skipped);
    assert_eq!(modem.calls(), vec!["list", "capacity"]);
    assert!(!modem.overlap_detected());
}

#[tokio::test]
async fn failed_cycle_does_not_poison_the_next() {
    let tmp = tempfile::tempdir().unwrap();
    let modem = MockModem::with_messages(vec![inbound(1, "+420777000111", "hi", MessageState::Unread)]);
    modem.fail_next([GatewayError::DeviceUnavailable("unplugged".into())]);
    let publisher = RecordingPublisher::new();
    let monitor = monitor_over(&modem, &publisher, tmp.path(), false);

    assert!(monitor.run_cycle().await.is_err());
    assert!(matches!(monitor.run_cycle().await.unwrap(), CycleOutcome::Completed(_)));
    assert_eq!(delivered_ids(&publisher), vec![1]);
}

#[tokio::test]
async fn failed_delete_is_retried_on_a_later_cycle_without_redelivery() {
    let tmp = tempfile::tempdir().unwrap();
    let modem = MockModem::with_messages(vec![
        inbound(1, "+420777000111", "one", MessageState::Unread),
        inbound(2, "+420777000222", "two", MessageState::Unread),
    ]);
    modem.fail_op("delete", GatewayError::DeviceUnavailable("busy".into()));
    let publisher = RecordingPublisher::new();
    let monitor = monitor_over(&modem, &publisher, tmp.path(), true);

    let first = monitor.run_cycle().await.unwrap();
    assert!(matches!(first, CycleOutcome::Completed(ref r) if r.published == 2 && r.deleted == 1));
    assert_eq!(modem.deleted(), vec![2]);

    let second = monitor.run_cycle().await.unwrap();
    assert!(matches!(second, CycleOutcome::Completed(ref r) if r.published == 0 && r.deleted == 1));
    assert_eq!(modem.deleted(), vec![2, 1]);
    assert_eq!(delivered_ids(&publisher), vec![1, 2]);
}

#[tokio::test]
async fn spawned_loop_runs_and_stops_on_shutdown() {
    let tmp = tempfile::tempdir().unwrap();
    let modem = MockModem::with_messages(vec![inbound(1, "+420777000111", "hi", MessageState::Unread)]);
    let publisher = RecordingPublisher::new();
    let monitor = Arc::new(monitor_over(&modem, &publisher, tmp.path(), false));
    let (tx, rx) = watch::channel(false);

    let handles = monitor.clone().spawn(rx);
    // the first tick fires immediately
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while publisher.count("new_message") == 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(publisher.count("new_message"), 1);

    tx.send(true).unwrap();
    for h in handles {
        tokio::time::timeout(Duration::from_secs(1), h)
            .await
            .expect("loop did not stop")
            .unwrap();
    }
}
