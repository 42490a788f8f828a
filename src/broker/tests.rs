use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;

use super::engine::Dispatch;
use super::*;
use crate::persistence::{MemoryStore, Storage};
use crate::queue::{TaskHandler, TaskQueue};
use crate::transport::message::{Envelope, Frame};
use crate::utils::now_millis;

/// Records every frame written, per socket. Sockets in `dead` refuse writes.
#[derive(Default)]
struct RecordingSink {
    frames: Mutex<Vec<(String, Frame)>>,
    dead: Mutex<HashSet<String>>,
}

impl RecordingSink {
    fn kill(&self, socket_id: &str) {
        self.dead.lock().insert(socket_id.to_string());
    }

    fn sent_to(&self, socket_id: &str) -> Vec<Frame> {
        self.frames
            .lock()
            .iter()
            .filter(|(s, _)| s == socket_id)
            .map(|(_, f)| f.clone())
            .collect()
    }

    fn total(&self) -> usize {
        self.frames.lock().len()
    }
}

impl FrameSink for RecordingSink {
    fn send_frame(&self, socket_id: &str, frame: &Frame) -> bool {
        if self.dead.lock().contains(socket_id) {
            return false;
        }
        self.frames
            .lock()
            .push((socket_id.to_string(), frame.clone()));
        true
    }
}

fn options(notify_expired: bool) -> BrokerOptions {
    BrokerOptions {
        id: "broker-test".to_string(),
        task_interval: Duration::from_millis(1),
        sweep_interval: Duration::from_secs(60),
        sync_interval: Duration::from_secs(60),
        notify_expired,
    }
}

fn broker_with(storage: Arc<dyn Storage>, notify_expired: bool) -> (Broker, Arc<RecordingSink>) {
    let sink = Arc::new(RecordingSink::default());
    let broker = Broker::new(options(notify_expired), storage, sink.clone(), Vec::new());
    (broker, sink)
}

fn broker() -> (Broker, Arc<RecordingSink>) {
    broker_with(Arc::new(MemoryStore::new()), false)
}

fn message(id: &str, receiver: &str) -> Message {
    Message {
        outgoing_id: id.to_string(),
        incoming_id: Some(format!("in-{id}")),
        socket_id: "sa".to_string(),
        sender: Some("svc-a".to_string()),
        receiver: receiver.to_string(),
        status: MessageStatus::Received,
        options: MessageOptions::default(),
        data: json!({ "x": 1 }),
        info: MessageInfo {
            received_at: Some(now_millis()),
            ..MessageInfo::default()
        },
    }
}

fn error_code(frame: &Frame) -> Option<String> {
    match frame {
        Frame::Error(envelope) => envelope.info.error.clone(),
        _ => None,
    }
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

#[test]
fn test_round_robin_over_registered_sockets() {
    let mut registry = ServiceRegistry::new();
    registry.add_service("svc", "s1".to_string());
    registry.add_service("svc", "s2".to_string());
    registry.add_service("svc", "s3".to_string());
    registry.add_service("svc", "s2".to_string());

    let picks: Vec<_> = (0..4).filter_map(|_| registry.next_socket("svc")).collect();
    assert_eq!(picks, vec!["s1", "s2", "s3", "s1"]);
    assert_eq!(registry.next_socket("other"), None);
}

#[test]
fn test_removing_a_socket_keeps_rotation_fair() {
    let mut registry = ServiceRegistry::new();
    for s in ["s1", "s2", "s3"] {
        registry.add_service("svc", s.to_string());
    }
    assert_eq!(registry.next_socket("svc").as_deref(), Some("s1"));
    assert_eq!(registry.remove_service("s1"), 1);
    assert_eq!(registry.next_socket("svc").as_deref(), Some("s2"));
    assert_eq!(registry.next_socket("svc").as_deref(), Some("s3"));
}

#[test]
fn test_last_socket_gone_leaves_empty_entry() {
    let mut registry = ServiceRegistry::new();
    registry.add_service("svc", "s1".to_string());
    registry.add_service("other", "s1".to_string());
    assert_eq!(registry.remove_service("s1"), 2);

    assert!(registry.entry("svc").is_some_and(|e| e.is_empty()));
    assert!(!registry.is_registered("svc"));
    assert!(registry.names().is_empty());
}

#[tokio::test]
async fn test_expired_request_reports_to_sender() {
    let (broker, sink) = broker();
    broker.add_service("svc-a", "sa".to_string());
    broker.add_service("svc-b", "sb".to_string());

    let mut msg = message("m1", "svc-b");
    msg.options.ttl = Some(10);
    msg.info.received_at = Some(now_millis() - 100);

    let handler = broker.incoming_handler();
    let err = handler.handle(msg).await.unwrap_err();
    assert_eq!(err.task.status, MessageStatus::Expired);
    handler.on_error(err, &TaskQueue::new(Duration::ZERO));

    assert!(sink.sent_to("sb").is_empty());
    let to_sender = sink.sent_to("sa");
    assert_eq!(to_sender.len(), 1);
    assert_eq!(error_code(&to_sender[0]).as_deref(), Some("expired"));
    assert!(!broker.is_buffered("m1"));
}

#[tokio::test]
async fn test_unknown_receiver_is_not_delivered() {
    let (broker, sink) = broker();
    broker.add_service("svc-a", "sa".to_string());

    let handler = broker.incoming_handler();
    let err = handler.handle(message("m1", "nobody")).await.unwrap_err();
    assert_eq!(err.task.status, MessageStatus::NotDelivered);
    handler.on_error(err, &TaskQueue::new(Duration::ZERO));

    let to_sender = sink.sent_to("sa");
    assert_eq!(error_code(&to_sender[0]).as_deref(), Some("not_delivered"));
}

#[tokio::test]
async fn test_local_delivery_buffers_until_response() {
    let (broker, sink) = broker();
    broker.add_service("svc-b", "sb".to_string());

    let dispatch = broker
        .incoming_handler()
        .handle(message("m1", "svc-b"))
        .await
        .unwrap();
    assert!(matches!(dispatch, Dispatch::Local(ref id) if id == "m1"));
    assert!(broker.is_buffered("m1"));

    let frames = sink.sent_to("sb");
    let Frame::Request(envelope) = &frames[0] else {
        panic!("expected a request");
    };
    assert_eq!(envelope.outgoing_id.as_deref(), Some("m1"));
    assert_eq!(envelope.sender.as_deref(), Some("svc-a"));

    let buffered = broker.snapshot().pending_response_buffer["m1"].clone();
    assert_eq!(buffered.status, MessageStatus::Delivered);
    assert!(buffered.info.delivered_at.is_some());
}

#[tokio::test]
async fn test_failed_write_is_not_buffered() {
    let (broker, sink) = broker();
    broker.add_service("svc-b", "sb".to_string());
    sink.kill("sb");

    let err = broker
        .incoming_handler()
        .handle(message("m1", "svc-b"))
        .await
        .unwrap_err();
    assert_eq!(err.task.info.error.as_deref(), Some("not_delivered"));
    assert_eq!(broker.buffered_len(), 0);
}

#[tokio::test]
async fn test_broadcast_reaches_every_socket() {
    let (broker, sink) = broker();
    broker.add_service("svc-b", "sb1".to_string());
    broker.add_service("svc-b", "sb2".to_string());

    let mut msg = message("m1", "svc-b");
    msg.options.broadcast = Some(true);
    broker.incoming_handler().handle(msg).await.unwrap();

    assert_eq!(sink.sent_to("sb1").len(), 1);
    assert_eq!(sink.sent_to("sb2").len(), 1);
    assert!(broker.is_buffered("m1"));
}

#[tokio::test]
async fn test_response_completes_buffered_message_once() {
    let (broker, _sink) = broker();
    broker.add_service("svc-b", "sb".to_string());
    broker
        .incoming_handler()
        .handle(message("m1", "svc-b"))
        .await
        .unwrap();

    let reply = Envelope {
        outgoing_id: Some("m1".to_string()),
        status: Some(MessageStatus::Handled),
        data: json!({ "x": 2 }),
        ..Envelope::default()
    };
    assert!(broker.process_response(reply.clone()));
    assert!(!broker.process_response(reply));
    assert!(!broker.is_buffered("m1"));

    let queued = broker.snapshot().outgoing_queue_snapshot;
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].status, MessageStatus::Handled);
    assert_eq!(queued[0].data, json!({ "x": 2 }));
    assert!(queued[0].info.handled_at.is_some());
}

#[tokio::test]
async fn test_not_handled_error_keeps_handler_message() {
    let (broker, _sink) = broker();
    broker.add_service("svc-b", "sb".to_string());
    broker
        .incoming_handler()
        .handle(message("m1", "svc-b"))
        .await
        .unwrap();

    let mut reply = Envelope {
        outgoing_id: Some("m1".to_string()),
        status: Some(MessageStatus::NotHandled),
        ..Envelope::default()
    };
    reply.info.error = Some("boom".to_string());
    assert!(broker.process_response(reply));

    let queued = broker.snapshot().outgoing_queue_snapshot;
    assert_eq!(queued[0].status, MessageStatus::NotHandled);
    assert_eq!(queued[0].info.error.as_deref(), Some("boom"));
}

#[tokio::test]
async fn test_reply_fans_out_to_all_sender_sockets() {
    let (broker, sink) = broker();
    broker.add_service("svc-a", "sa1".to_string());
    broker.add_service("svc-a", "sa2".to_string());

    let mut msg = message("m1", "svc-b");
    msg.status = MessageStatus::Handled;
    broker.outgoing_handler().handle(msg).await.unwrap();

    for socket in ["sa1", "sa2"] {
        let frames = sink.sent_to(socket);
        assert!(matches!(&frames[..], [Frame::Response(_)]));
    }
}

#[tokio::test]
async fn test_undeliverable_reply_is_retried_until_expired() {
    let (broker, _sink) = broker();
    let handler = broker.outgoing_handler();
    let queue = TaskQueue::new(Duration::ZERO);

    let err = handler.handle(message("m1", "svc-b")).await.unwrap_err();
    handler.on_error(err, &queue);
    assert_eq!(queue.len(), 1);

    let mut stale = message("m2", "svc-b");
    stale.options.ttl = Some(1);
    stale.info.received_at = Some(now_millis() - 50);
    let err = handler.handle(stale).await.unwrap_err();
    handler.on_error(err, &queue);

    let mut orphan = message("m3", "svc-b");
    orphan.sender = None;
    let err = handler.handle(orphan).await.unwrap_err();
    handler.on_error(err, &queue);

    assert_eq!(queue.len(), 1);
}

#[tokio::test]
async fn test_reply_waits_for_sender_to_reconnect() {
    let (broker, sink) = broker();
    broker.start();

    broker.add_service("svc-b", "sb".to_string());
    broker.add_service("svc-a", "sa".to_string());
    broker.process_request(message("m1", "svc-b"));
    wait_until(|| broker.is_buffered("m1")).await;

    broker.remove_service("sa");
    broker.process_response(Envelope {
        outgoing_id: Some("m1".to_string()),
        data: json!({ "x": 2 }),
        ..Envelope::default()
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(sink.sent_to("sa2").is_empty());

    broker.add_service("svc-a", "sa2".to_string());
    wait_until(|| !sink.sent_to("sa2").is_empty()).await;
    assert!(matches!(&sink.sent_to("sa2")[..], [Frame::Response(_)]));
    broker.shutdown();
}

#[tokio::test]
async fn test_sweep_drops_expired_entries() {
    let (broker, sink) = broker();
    broker.add_service("svc-a", "sa".to_string());
    broker.add_service("svc-b", "sb".to_string());

    let mut short = message("m1", "svc-b");
    short.options.ttl = Some(30);
    broker.incoming_handler().handle(short).await.unwrap();
    broker
        .incoming_handler()
        .handle(message("m2", "svc-b"))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(broker.sweep_expired(), 1);
    assert!(!broker.is_buffered("m1"));
    assert!(broker.is_buffered("m2"));
    assert!(sink.sent_to("sa").is_empty());
}

#[tokio::test]
async fn test_sweep_can_notify_senders() {
    let (broker, sink) = broker_with(Arc::new(MemoryStore::new()), true);
    broker.add_service("svc-a", "sa".to_string());
    broker.add_service("svc-b", "sb".to_string());

    let mut short = message("m1", "svc-b");
    short.options.ttl = Some(30);
    broker.incoming_handler().handle(short).await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(broker.sweep_expired(), 1);
    let frames = sink.sent_to("sa");
    assert_eq!(error_code(&frames[0]).as_deref(), Some("expired"));
}

#[tokio::test]
async fn test_snapshot_restores_queued_and_buffered_messages() {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStore::new());
    {
        let (broker, _sink) = broker_with(storage.clone(), false);
        broker.add_service("svc-b", "sb".to_string());
        broker
            .incoming_handler()
            .handle(message("m1", "svc-b"))
            .await
            .unwrap();
        broker.process_request(message("m2", "svc-c"));
        broker.sync().unwrap();
    }

    let (restored, sink) = broker_with(storage, false);
    assert!(restored.is_buffered("m1"));
    assert_eq!(restored.queued_len(), (1, 0));
    assert_eq!(restored.snapshot().incoming_queue_snapshot[0].outgoing_id, "m2");

    // The restored buffer still accepts the response.
    restored.add_service("svc-a", "sa".to_string());
    restored.start();
    assert!(restored.process_response(Envelope {
        outgoing_id: Some("m1".to_string()),
        ..Envelope::default()
    }));
    wait_until(|| !sink.sent_to("sa").is_empty()).await;
    restored.shutdown();
}

#[tokio::test]
async fn test_corrupt_snapshot_starts_empty() {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStore::new());
    storage.set("broker-test", b"{not json").unwrap();

    let (broker, _sink) = broker_with(storage, false);
    assert!(broker.snapshot().is_empty());
}

#[tokio::test]
async fn test_snapshot_with_mismatched_key_is_rejected() {
    let mut snapshot = Snapshot::default();
    snapshot
        .pending_response_buffer
        .insert("wrong".to_string(), message("m1", "svc-b"));
    assert!(snapshot.validate().is_err());

    let storage = MemoryStore::new();
    snapshot.write(&storage, "k").unwrap();
    assert!(Snapshot::read(&storage, "k").is_err());
    assert!(Snapshot::load_or_default(&storage, "k").is_empty());
}

#[tokio::test]
async fn test_started_broker_routes_end_to_end() {
    let (broker, sink) = broker();
    broker.add_service("svc-a", "sa".to_string());
    broker.add_service("svc-b", "sb".to_string());
    broker.start();

    broker.process_request(message("m1", "svc-b"));
    wait_until(|| broker.is_buffered("m1")).await;
    assert!(broker.process_response(Envelope {
        outgoing_id: Some("m1".to_string()),
        status: Some(MessageStatus::Handled),
        data: json!({ "x": 2 }),
        ..Envelope::default()
    }));
    wait_until(|| !sink.sent_to("sa").is_empty()).await;

    let Frame::Response(reply) = &sink.sent_to("sa")[0] else {
        panic!("expected a response");
    };
    assert_eq!(reply.data, json!({ "x": 2 }));
    assert_eq!(reply.incoming_id.as_deref(), Some("in-m1"));
    assert_eq!(sink.total(), 2);

    broker.process_request(message("m2", "nobody"));
    wait_until(|| sink.sent_to("sa").len() == 2).await;
    assert_eq!(
        error_code(&sink.sent_to("sa")[1]).as_deref(),
        Some("not_delivered")
    );
    broker.shutdown();
}
