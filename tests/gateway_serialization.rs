mod common;

use common::{fast_config, inbound, start_gateway, MockModem, RecordingPublisher};
use smsgate::error::{ErrorKind, GatewayError};
use smsgate::modem::MessageState;
use std::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_callers_never_overlap_on_the_channel() {
    let tmp = tempfile::tempdir().unwrap();
    let modem = MockModem::with_messages(vec![inbound(1, "+420777000111", "hi", MessageState::Unread)]);
    modem.set_delay(Duration::from_millis(5));
    let gateway = start_gateway(modem.clone(), RecordingPublisher::new(), fast_config(), tmp.path());

    let mut tasks = Vec::new();
    for i in 0..12 {
        let gw = gateway.clone();
        tasks.push(tokio::spawn(async move {
            match i % 4 {
                0 => gw.send_message("+420777123456", "ping", None).await.map(|_| ()),
                1 => gw.list_messages().await.map(|_| ()),
                2 => gw.query_status().await.map(|_| ()),
                _ => gw.query_capacity().await.map(|_| ()),
            }
        }));
    }
    for t in tasks {
        t.await.unwrap().unwrap();
    }

    assert!(!modem.overlap_detected(), "two operations were in flight at once");
    assert_eq!(modem.calls().len(), 12);
    assert_eq!(gateway.counters().current().sent_count, 3);
}

#[tokio::test]
async fn requests_are_served_in_arrival_order() {
    let tmp = tempfile::tempdir().unwrap();
    let modem = MockModem::new();
    modem.set_delay(Duration::from_millis(10));
    let gateway = start_gateway(modem.clone(), RecordingPublisher::new(), fast_config(), tmp.path());

    let (a, b, c) = tokio::join!(
        gateway.query_identity(),
        gateway.list_messages(),
        gateway.query_status()
    );
    a.unwrap();
    b.unwrap();
    c.unwrap();
    assert_eq!(modem.calls(), vec!["identity", "list", "status"]);
}

#[tokio::test]
async fn every_attempt_is_recorded_including_retries() {
    let tmp = tempfile::tempdir().unwrap();
    let modem = MockModem::new();
    modem.fail_next([GatewayError::Timeout, GatewayError::Timeout]);
    let gateway = start_gateway(modem.clone(), RecordingPublisher::new(), fast_config(), tmp.path());

    gateway.query_status().await.unwrap();

    let status = gateway.tracker().current_status();
    assert_eq!(status.total_operations, 3);
    assert_eq!(status.successful_operations, 1);
    assert_eq!(status.consecutive_failures, 0);
    assert_eq!(modem.calls(), vec!["status", "status", "status"]);
}

#[tokio::test]
async fn retries_exhausted_surfaces_typed_error() {
    let tmp = tempfile::tempdir().unwrap();
    let modem = MockModem::new();
    modem.fail_next([GatewayError::Timeout, GatewayError::Timeout, GatewayError::Timeout]);
    let gateway = start_gateway(modem.clone(), RecordingPublisher::new(), fast_config(), tmp.path());

    let err = gateway.list_messages().await.unwrap_err();
    assert_eq!(err, GatewayError::Timeout);
    assert_eq!(modem.calls().len(), 3);
    assert_eq!(gateway.tracker().current_status().consecutive_failures, 3);
}

#[tokio::test]
async fn non_transient_errors_are_not_retried() {
    let tmp = tempfile::tempdir().unwrap();
    let modem = MockModem::new();
    modem.fail_next([GatewayError::DeviceUnavailable("unplugged".into())]);
    let gateway = start_gateway(modem.clone(), RecordingPublisher::new(), fast_config(), tmp.path());

    let err = gateway.query_identity().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DeviceUnavailable);
    assert_eq!(modem.calls().len(), 1);
}

#[tokio::test]
async fn invalid_destination_never_reaches_the_modem() {
    let tmp = tempfile::tempdir().unwrap();
    let modem = MockModem::new();
    let publisher = RecordingPublisher::new();
    let gateway = start_gateway(modem.clone(), publisher.clone(), fast_config(), tmp.path());

    let err = gateway.send_message("call me maybe", "hi", None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidDestination);
    assert!(modem.calls().is_empty());
    assert_eq!(gateway.tracker().current_status().total_operations, 0);
    assert_eq!(publisher.count("send_result"), 1);
    assert_eq!(gateway.counters().current().sent_count, 0);
}

#[tokio::test]
async fn long_text_is_split_but_counted_once() {
    let tmp = tempfile::tempdir().unwrap();
    let modem = MockModem::new();
    let gateway = start_gateway(modem.clone(), RecordingPublisher::new(), fast_config(), tmp.path());

    let text = "x".repeat(200);
    let handle = gateway.send_message("+420777123456", &text, None).await.unwrap();
    assert_eq!(handle.parts, 2);
    assert_eq!(handle.references, vec![1, 2]);
    assert_eq!(modem.sent().len(), 2);
    assert_eq!(gateway.counters().current().sent_count, 1);
}

#[tokio::test]
async fn retried_send_increments_counters_once() {
    let tmp = tempfile::tempdir().unwrap();
    let modem = MockModem::new();
    modem.fail_next([GatewayError::Timeout]);
    let gateway = start_gateway(modem.clone(), RecordingPublisher::new(), fast_config(), tmp.path());

    gateway.send_message("+420777123456", "hello", None).await.unwrap();
    assert_eq!(modem.calls(), vec!["send", "send"]);
    assert_eq!(gateway.counters().current().sent_count, 1);
}

#[tokio::test]
async fn shutdown_finishes_queue_then_rejects() {
    let tmp = tempfile::tempdir().unwrap();
    let modem = MockModem::new();
    modem.set_delay(Duration::from_millis(20));
    let gateway = start_gateway(modem.clone(), RecordingPublisher::new(), fast_config(), tmp.path());

    let queued = {
        let gw = gateway.clone();
        tokio::spawn(async move { gw.query_capacity().await })
    };
    tokio::time::sleep(Duration::from_millis(5)).await;
    gateway.shutdown().await;

    assert!(queued.await.unwrap().is_ok());
    let err = gateway.query_status().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DeviceUnavailable);
}

#[tokio::test]
async fn manual_delete_always_publishes_capacity() {
    let tmp = tempfile::tempdir().unwrap();
    let modem = MockModem::with_messages(vec![
        inbound(1, "+420777000111", "a", MessageState::Read),
        inbound(2, "+420777000222", "b", MessageState::Read),
    ]);
    let publisher = RecordingPublisher::new();
    let gateway = start_gateway(modem.clone(), publisher.clone(), fast_config(), tmp.path());

    gateway.delete_message(1).await.unwrap();
    let report = gateway.delete_all().await.unwrap();
    assert_eq!(report.deleted_count, 1);
    assert_eq!(report.capacity.map(|c| c.sim_used), Some(0));

    assert_eq!(modem.deleted(), vec![1, 2]);
    assert_eq!(publisher.count("capacity"), 2);
    assert_eq!(
        modem.calls(),
        vec!["delete", "capacity", "delete_all", "capacity"]
    );
}
