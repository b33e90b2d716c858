mod common;

use common::{inbound, MockModem, RecordingPublisher};
use smsgate::bridge::SmsBridge;
use smsgate::config::Config;
use smsgate::connectivity::ConnectivityState;
use smsgate::error::ErrorKind;
use smsgate::modem::MessageState;
use smsgate::publisher::StatusEvent;

fn test_config(dir: &std::path::Path) -> Config {
    let mut config = Config::default();
    config.counters.file = dir.join("sms_counter.json").to_string_lossy().into_owned();
    config.counters.cost_per_message = 2.0;
    config.counters.currency = "CZK".into();
    config.gateway.retry_backoff_ms = 1;
    config.gateway.retry_max_backoff_ms = 2;
    config.gateway.retry_jitter_ms = 0;
    config.normalized()
}

#[tokio::test]
async fn startup_publishes_initial_snapshot_in_order() {
    let tmp = tempfile::tempdir().unwrap();
    let publisher = RecordingPublisher::new();
    let mut bridge = SmsBridge::build(MockModem::new(), &test_config(tmp.path()), publisher.clone()).unwrap();

    let report = bridge.startup().await;
    assert!(report.identity.is_some());
    assert!(report.status.is_some());
    assert_eq!(report.capacity.map(|c| c.sim_size), Some(30));

    // the first successful query also reports the Unknown -> Online transition
    let names: Vec<&str> = publisher
        .names()
        .into_iter()
        .skip_while(|n| *n == "connectivity")
        .collect();
    assert_eq!(names, vec!["identity", "status", "capacity", "counters", "connectivity"]);
    assert_eq!(bridge.connectivity().state, ConnectivityState::Online);
    bridge.shutdown().await;
}

#[tokio::test]
async fn startup_survives_a_dead_modem() {
    let tmp = tempfile::tempdir().unwrap();
    let modem = MockModem::new();
    modem.fail_next((0..10).map(|_| smsgate::error::GatewayError::DeviceUnavailable("no port".into())));
    let publisher = RecordingPublisher::new();
    let mut bridge = SmsBridge::build(modem, &test_config(tmp.path()), publisher.clone()).unwrap();

    let report = bridge.startup().await;
    assert!(report.identity.is_none());
    assert!(report.status.is_none());
    assert!(report.capacity.is_none());
    assert_eq!(publisher.count("counters"), 1);
    assert_eq!(bridge.connectivity().state, ConnectivityState::Offline);
    bridge.shutdown().await;
}

#[tokio::test]
async fn send_and_reset_counters_through_the_bridge() {
    let tmp = tempfile::tempdir().unwrap();
    let publisher = RecordingPublisher::new();
    let mut bridge = SmsBridge::build(MockModem::new(), &test_config(tmp.path()), publisher.clone()).unwrap();

    bridge.send("+420 777 123 456", "Příliš žluťoučký kůň", None).await.unwrap();
    bridge.send("+420777123456", "plain", Some(true)).await.unwrap();
    let usage = bridge.counters();
    assert_eq!(usage.sent_count, 2);
    assert_eq!(usage.total_cost, 4.0);
    assert_eq!(usage.cost_per_message, 2.0);

    publisher.clear();
    let zero = bridge.reset_counters().await.unwrap();
    assert_eq!(zero.sent_count, 0);
    assert_eq!(zero.total_cost, 0.0);
    assert!(matches!(
        publisher.events().as_slice(),
        [StatusEvent::Counters(u)] if u.sent_count == 0
    ));
    bridge.shutdown().await;

    // persisted across a rebuild
    let bridge = SmsBridge::build(MockModem::new(), &test_config(tmp.path()), RecordingPublisher::new()).unwrap();
    assert_eq!(bridge.counters().sent_count, 0);
}

#[tokio::test]
async fn list_and_delete_commands_map_to_the_gateway() {
    let tmp = tempfile::tempdir().unwrap();
    let modem = MockModem::with_messages(vec![
        inbound(5, "+420777000111", "a", MessageState::Read),
        inbound(6, "+420777000222", "b", MessageState::Unread),
    ]);
    let publisher = RecordingPublisher::new();
    let mut bridge = SmsBridge::build(modem.clone(), &test_config(tmp.path()), publisher.clone()).unwrap();

    assert_eq!(bridge.list_messages().await.unwrap().len(), 2);
    bridge.delete_message(5).await.unwrap();
    assert_eq!(bridge.query_capacity().await.unwrap().sim_used, 1);
    assert_eq!(bridge.delete_all().await.unwrap().deleted_count, 1);
    assert!(bridge.list_messages().await.unwrap().is_empty());
    assert_eq!(publisher.count("capacity"), 2);

    let identity = bridge.query_identity().await.unwrap();
    assert_eq!(identity.imei, "356938035643809");
    bridge.query_status().await.unwrap();
    assert_eq!(publisher.count("identity"), 1);
    assert_eq!(publisher.count("status"), 1);
    bridge.shutdown().await;
}

#[tokio::test]
async fn commands_after_shutdown_fail_cleanly() {
    let tmp = tempfile::tempdir().unwrap();
    let mut bridge = SmsBridge::build(MockModem::new(), &test_config(tmp.path()), RecordingPublisher::new()).unwrap();
    bridge.start_monitor();
    bridge.shutdown().await;

    let err = bridge.send("+420777123456", "late", None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DeviceUnavailable);
}
