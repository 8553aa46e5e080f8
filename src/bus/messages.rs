use std::sync::atomic::{AtomicU64, Ordering};

use serde::Deserialize;
use tracing::warn;

use crate::types::{ChangeEvent, Notification};

static PARSE_FAILURES: AtomicU64 = AtomicU64::new(0);

/// Raw deserializable shape of a change-notification frame. Fields are
/// optional because heartbeats and acks share the channel with change rows.
#[derive(Debug, Deserialize)]
struct RawChangeMsg {
    pub event: Option<String>,
    pub table: Option<String>,
    /// Present on change rows; never inspected. The row content cannot be
    /// trusted for state — receipt only means the table must be re-read.
    #[serde(default)]
    #[allow(dead_code)]
    pub payload: serde_json::Value,
}

/// Parse a raw text frame into zero or more notifications.
///
/// The notification service delivers either a single JSON object or an
/// array of objects per frame. Frames that are not change rows (acks,
/// heartbeats, unknown event labels) parse to nothing.
pub fn parse_change_frame(raw: &str) -> Vec<Notification> {
    let msgs: Vec<RawChangeMsg> = if raw.trim_start().starts_with('[') {
        serde_json::from_str(raw).unwrap_or_default()
    } else {
        match serde_json::from_str::<RawChangeMsg>(raw) {
            Ok(m) => vec![m],
            Err(_) => vec![],
        }
    };

    if msgs.is_empty() {
        let count = PARSE_FAILURES.fetch_add(1, Ordering::Relaxed) + 1;
        if count <= 10 || count % 1000 == 0 {
            let sample = &raw[..500.min(raw.len())];
            warn!(count, "[BUS PARSE] unrecognized frame: {sample}");
        }
        return vec![];
    }

    let mut notifications = Vec::new();
    for msg in msgs {
        let (Some(table), Some(event_label)) = (msg.table, msg.event) else {
            continue;
        };
        let Some(event) = ChangeEvent::from_label(&event_label) else {
            continue;
        };
        notifications.push(Notification { table, event });
    }
    notifications
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_update_object() {
        let raw = r#"{"event":"UPDATE","table":"markets","payload":{"id":"m1","yes_price":0.4}}"#;
        let notifications = parse_change_frame(raw);
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].table, "markets");
        assert_eq!(notifications[0].event, ChangeEvent::Update);
    }

    #[test]
    fn parses_array_of_changes() {
        let raw = r#"[{"event":"INSERT","table":"markets","payload":{}},{"event":"DELETE","table":"transactions","payload":{}}]"#;
        let notifications = parse_change_frame(raw);
        assert_eq!(notifications.len(), 2);
        assert_eq!(notifications[0].event, ChangeEvent::Insert);
        assert_eq!(notifications[1].table, "transactions");
    }

    #[test]
    fn wildcard_event_is_carried_through() {
        let raw = r#"{"event":"*","table":"markets"}"#;
        let notifications = parse_change_frame(raw);
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].event, ChangeEvent::All);
    }

    #[test]
    fn payload_body_is_not_surfaced() {
        // Nothing of the row survives parsing — only table and event.
        let raw = r#"{"event":"UPDATE","table":"markets","payload":{"yes_price":"garbage"}}"#;
        let notifications = parse_change_frame(raw);
        assert_eq!(notifications.len(), 1);
    }

    #[test]
    fn unknown_event_label_is_skipped() {
        let raw = r#"{"event":"TRUNCATE","table":"markets"}"#;
        assert!(parse_change_frame(raw).is_empty());
    }

    #[test]
    fn ack_frames_parse_to_nothing() {
        let raw = r#"{"status":"subscribed","table":"markets"}"#;
        assert!(parse_change_frame(raw).is_empty());
    }

    #[test]
    fn garbage_returns_empty() {
        assert!(parse_change_frame("not json at all").is_empty());
    }
}
