//! Frames exchanged between a `WsBus` client and a relay bus hub.

use serde::{Deserialize, Serialize};

use crate::protocol::BusMessage;

/// Client → hub
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum ClientFrame {
    Subscribe { topic: String },
    Unsubscribe { topic: String },
    Publish { topic: String, message: BusMessage },
}

/// Hub → client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum HubFrame {
    Message { topic: String, message: BusMessage },
    Error { error: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_tags() {
        let f = ClientFrame::Subscribe { topic: "mcp-tunnel:t1:responses".into() };
        let json = serde_json::to_string(&f).unwrap();
        assert_eq!(json, r#"{"op":"subscribe","topic":"mcp-tunnel:t1:responses"}"#);

        let hub: HubFrame = serde_json::from_str(r#"{"op":"error","error":"forbidden"}"#).unwrap();
        assert_eq!(hub, HubFrame::Error { error: "forbidden".into() });
    }

    #[test]
    fn test_publish_frame_carries_message() {
        let raw = r#"{"op":"publish","topic":"a","message":{"name":"request","data":{"x":1}}}"#;
        let f: ClientFrame = serde_json::from_str(raw).unwrap();
        match f {
            ClientFrame::Publish { topic, message } => {
                assert_eq!(topic, "a");
                assert_eq!(message.name, "request");
                assert_eq!(message.data["x"], 1);
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }
}
