//! Wire frames exchanged over a connection.
//!
//! Frames are JSON objects tagged by `"type"`. The server pushes `deliver`
//! for each notification, `recovered` at the end of a replay and `closed`
//! before it hangs up. The client sends `recover` once after subscribing and
//! `ack` for every `deliver` it processed.

use crate::delivery::channel::CloseReason;
use crate::error::{HeraldError, Result};
use crate::types::{Notification, NotificationId, Sequence, Timestamp};
use serde::{Deserialize, Serialize};

/// Server -> client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Deliver {
        id: NotificationId,
        seq: Sequence,
        #[serde(with = "payload")]
        payload: Vec<u8>,
        created_at: Timestamp,
    },
    /// Replay finished; everything up to `through` has been pushed.
    Recovered { through: Sequence, count: usize },
    Closed { reason: CloseReason },
}

impl ServerFrame {
    pub fn deliver(notification: &Notification) -> Self {
        ServerFrame::Deliver {
            id: notification.id,
            seq: notification.sequence,
            payload: notification.payload.clone(),
            created_at: notification.created_at,
        }
    }
}

/// Client -> server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Recover {
        #[serde(alias = "lastSeenSeq")]
        last_seen_seq: Sequence,
    },
    Ack {
        #[serde(default, alias = "notificationId")]
        notification_id: Option<NotificationId>,
        seq: Sequence,
    },
}

/// UTF-8 payloads travel as JSON strings, anything else as a byte array.
mod payload {
    use serde::de::{self, SeqAccess, Visitor};
    use serde::{Deserializer, Serializer};
    use std::fmt;

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        match std::str::from_utf8(bytes) {
            Ok(text) => serializer.serialize_str(text),
            Err(_) => serializer.collect_seq(bytes),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        deserializer.deserialize_any(PayloadVisitor)
    }

    struct PayloadVisitor;

    impl<'de> Visitor<'de> for PayloadVisitor {
        type Value = Vec<u8>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a string or an array of bytes")
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Vec<u8>, E> {
            Ok(v.as_bytes().to_vec())
        }

        fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Vec<u8>, E> {
            Ok(v.to_vec())
        }

        fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Vec<u8>, A::Error> {
            let mut bytes = Vec::with_capacity(seq.size_hint().unwrap_or(0));
            while let Some(byte) = seq.next_element::<u8>()? {
                bytes.push(byte);
            }
            Ok(bytes)
        }
    }
}

pub fn encode_server(frame: &ServerFrame) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(frame)?)
}

pub fn decode_server(bytes: &[u8]) -> Result<ServerFrame> {
    serde_json::from_slice(bytes).map_err(|e| HeraldError::Protocol(e.to_string()))
}

pub fn encode_client(frame: &ClientFrame) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(frame)?)
}

pub fn decode_client(bytes: &[u8]) -> Result<ClientFrame> {
    serde_json::from_slice(bytes).map_err(|e| HeraldError::Protocol(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_frames_parse_from_json() {
        let recover = decode_client(br#"{"type":"recover","last_seen_seq":0}"#).unwrap();
        assert_eq!(
            recover,
            ClientFrame::Recover {
                last_seen_seq: Sequence(0)
            }
        );

        // Extra fields from older clients are ignored.
        let ack = decode_client(br#"{"type":"ack","notification_id":7,"seq":3,"to_user_id":"alice"}"#)
            .unwrap();
        assert_eq!(
            ack,
            ClientFrame::Ack {
                notification_id: Some(NotificationId(7)),
                seq: Sequence(3)
            }
        );

        let bare = decode_client(br#"{"type":"ack","seq":4}"#).unwrap();
        assert!(matches!(bare, ClientFrame::Ack { notification_id: None, .. }));
    }

    #[test]
    fn test_camel_case_client_frames() {
        assert_eq!(
            decode_client(br#"{"type":"recover","lastSeenSeq":5}"#).unwrap(),
            ClientFrame::Recover {
                last_seen_seq: Sequence(5)
            }
        );
        assert_eq!(
            decode_client(br#"{"type":"ack","notificationId":7,"seq":3,"toUserId":"alice"}"#)
                .unwrap(),
            ClientFrame::Ack {
                notification_id: Some(NotificationId(7)),
                seq: Sequence(3)
            }
        );
    }

    #[test]
    fn test_recover_requires_cursor() {
        assert!(matches!(
            decode_client(br#"{"type":"recover"}"#),
            Err(HeraldError::Protocol(_))
        ));
    }

    #[test]
    fn test_malformed_frame_is_protocol_error() {
        assert!(matches!(
            decode_client(b"not json"),
            Err(HeraldError::Protocol(_))
        ));
        assert!(matches!(
            decode_client(br#"{"type":"subscribe"}"#),
            Err(HeraldError::Protocol(_))
        ));
    }

    #[test]
    fn test_deliver_frame_shape() {
        let frame = ServerFrame::Deliver {
            id: NotificationId(9),
            seq: Sequence(2),
            payload: b"hi".to_vec(),
            created_at: Timestamp(5),
        };
        let value: serde_json::Value =
            serde_json::from_slice(&encode_server(&frame).unwrap()).unwrap();
        assert_eq!(value["type"], "deliver");
        assert_eq!(value["id"], 9);
        assert_eq!(value["seq"], 2);
        assert_eq!(value["payload"], "hi");

        let closed = encode_server(&ServerFrame::Closed {
            reason: CloseReason::Superseded,
        })
        .unwrap();
        assert_eq!(
            serde_json::from_slice::<serde_json::Value>(&closed).unwrap()["reason"],
            "superseded"
        );
    }

    #[test]
    fn test_binary_payload_survives() {
        let frame = ServerFrame::Deliver {
            id: NotificationId(1),
            seq: Sequence(1),
            payload: vec![0xff, 0x00, 0x7f],
            created_at: Timestamp(0),
        };
        let bytes = encode_server(&frame).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["payload"], serde_json::json!([255, 0, 127]));
        assert_eq!(decode_server(&bytes).unwrap(), frame);

        let text = decode_server(
            br#"{"type":"deliver","id":2,"seq":2,"payload":"hello","created_at":0}"#,
        )
        .unwrap();
        assert!(matches!(text, ServerFrame::Deliver { payload, .. } if payload == b"hello"));
    }
}
