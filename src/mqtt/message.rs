use chrono::{DateTime, Local};
use serde::Serialize;
use std::fmt;

/// Inbound publish as captured by a subscriber
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReceivedMessage {
    pub topic: String,
    pub payload: String,
    pub received_at: DateTime<Local>,
}

impl ReceivedMessage {
    /// Payload bytes are decoded lossily; invalid UTF-8 becomes U+FFFD
    pub fn from_publish(topic: &str, payload: &[u8]) -> Self {
        ReceivedMessage {
            topic: topic.to_string(),
            payload: String::from_utf8_lossy(payload).into_owned(),
            received_at: Local::now(),
        }
    }
}

impl fmt::Display for ReceivedMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} - {}: {}", self.received_at, self.topic, self.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_utf8_is_replaced() {
        let msg = ReceivedMessage::from_publish("t", &[0x66, 0x6f, 0xff]);
        assert_eq!(msg.payload, "fo\u{fffd}");
        assert_eq!(msg.topic, "t");
    }
}
