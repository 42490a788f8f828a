use serde_json::json;
use tokio::sync::mpsc;
use tungstenite::protocol::Message as WsMessage;

use crate::broker::FrameSink;
use crate::broker::message::{MessageOptions, MessageStatus};
use crate::transport::codec::{self, CodecError};
use crate::transport::connections::Connections;
use crate::transport::crypto::{CryptoError, FrameCipher};
use crate::transport::message::{AcknowledgePayload, Envelope, Frame, InitPayload};

fn request_frame() -> Frame {
    Frame::Request(Envelope::request(
        "svc-b",
        "corr-1".to_string(),
        json!({ "x": 1 }),
        MessageOptions::with_ttl(500),
    ))
}

#[test]
fn test_request_frame_wire_shape() {
    let value = serde_json::to_value(request_frame()).unwrap();
    assert_eq!(value["action"], "request");
    assert_eq!(value["message"]["receiver"], "svc-b");
    assert_eq!(value["message"]["incomingId"], "corr-1");
    assert_eq!(value["message"]["status"], "enqueued");
    assert_eq!(value["message"]["options"]["ttl"], 500);
    assert_eq!(value["message"]["data"], json!({ "x": 1 }));
    assert!(value["message"].get("outgoingId").is_none());
}

#[test]
fn test_decodes_frames_from_plain_json() {
    let text = r#"{"action":"init","message":{"id":"svc-a"}}"#;
    let frame = codec::decode(&WsMessage::text(text), None).unwrap();
    assert_eq!(
        frame,
        Some(Frame::Init(InitPayload {
            id: "svc-a".to_string()
        }))
    );

    let text = r#"{"action":"acknowledge","message":{"incomingId":"c1"}}"#;
    let frame = codec::decode(&WsMessage::text(text), None).unwrap();
    assert_eq!(
        frame,
        Some(Frame::Acknowledge(AcknowledgePayload {
            incoming_id: "c1".to_string()
        }))
    );

    let text = r#"{"action":"error","message":{"outgoingId":"o1","status":"not_handled","info":{"error":"boom"}}}"#;
    let Some(Frame::Error(envelope)) = codec::decode(&WsMessage::text(text), None).unwrap() else {
        panic!("expected an error frame");
    };
    assert_eq!(envelope.status, Some(MessageStatus::NotHandled));
    assert_eq!(envelope.info.error.as_deref(), Some("boom"));
}

#[test]
fn test_rejects_unknown_action_and_garbage() {
    let text = r#"{"action":"subscribe","message":{}}"#;
    assert!(matches!(
        codec::decode(&WsMessage::text(text), None),
        Err(CodecError::Deserialize(_))
    ));
    assert!(codec::decode(&WsMessage::text("not json"), None).is_err());
}

#[test]
fn test_control_messages_carry_no_frame() {
    let ping = WsMessage::Ping(Vec::new().into());
    assert_eq!(codec::decode(&ping, None).unwrap(), None);
}

#[test]
fn test_encrypted_frames_round_trip() {
    let cipher = FrameCipher::new("s3cret");
    let msg = codec::encode(&request_frame(), Some(&cipher)).unwrap();

    let text = msg.to_text().unwrap();
    assert!(!text.contains("svc-b"));
    assert!(text.chars().all(|c| c.is_ascii_hexdigit()));

    let decoded = codec::decode(&msg, Some(&cipher)).unwrap();
    assert_eq!(decoded, Some(request_frame()));
}

#[test]
fn test_wrong_key_or_plaintext_fails_to_decode() {
    let msg = codec::encode(&request_frame(), Some(&FrameCipher::new("a"))).unwrap();
    assert!(matches!(
        codec::decode(&msg, Some(&FrameCipher::new("b"))),
        Err(CodecError::Crypto(CryptoError::Open))
    ));

    let plain = codec::encode(&request_frame(), None).unwrap();
    assert!(matches!(
        codec::decode(&plain, Some(&FrameCipher::new("a"))),
        Err(CodecError::Crypto(CryptoError::Hex))
    ));
}

#[test]
fn test_short_ciphertext_is_rejected() {
    let cipher = FrameCipher::new("k");
    assert_eq!(cipher.decrypt("00ff"), Err(CryptoError::TooShort));
}

#[test]
fn test_connections_track_names_and_sink_writes() {
    let connections = Connections::new(None);
    let (tx_a, mut rx_a) = mpsc::unbounded_channel();
    let (tx_b, mut rx_b) = mpsc::unbounded_channel();
    connections.register("s1", tx_a);
    connections.register("s2", tx_b);
    connections.set_name("s1", "svc-b");
    connections.set_name("s2", "svc-a");
    assert_eq!(connections.name_of("s1").as_deref(), Some("svc-b"));

    assert!(connections.send_frame("s1", &request_frame()));
    let written = rx_a.try_recv().unwrap();
    assert_eq!(codec::decode(&written, None).unwrap(), Some(request_frame()));
    assert!(!connections.send_frame("missing", &request_frame()));

    connections.broadcast_receivers(vec!["svc-a".to_string(), "svc-b".to_string()]);
    for rx in [&mut rx_a, &mut rx_b] {
        let Some(Frame::Receivers(payload)) = codec::decode(&rx.try_recv().unwrap(), None).unwrap()
        else {
            panic!("expected receivers frame");
        };
        assert_eq!(payload.data, vec!["svc-a", "svc-b"]);
    }

    assert_eq!(connections.remove("s1").as_deref(), Some("svc-b"));
    assert_eq!(connections.name_of("s1"), None);
    assert_eq!(connections.name_of("s2").as_deref(), Some("svc-a"));
    assert!(!connections.send_frame("s1", &request_frame()));
}

#[test]
fn test_closed_socket_write_fails() {
    let connections = Connections::new(None);
    let (tx, rx) = mpsc::unbounded_channel();
    connections.register("s1", tx);
    drop(rx);
    assert!(!connections.send_frame("s1", &request_frame()));
}
