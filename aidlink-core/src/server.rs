//! Inbound transport: the write-only endpoint. Reassembles prepared write
//! sequences per session, decodes completed payloads, and stores them.

use std::collections::HashMap;
use std::sync::Arc;

use crate::codec;
use crate::model::EventType;
use crate::store::{EventLog, MessageStore};

/// Passive endpoint receiving writes from connected peers. Each live inbound
/// session owns at most one pending buffer, created on the first fragment
/// and destroyed on commit, abort, or disconnect.
pub struct TransportServer {
    local_id: String,
    buffers: HashMap<String, Vec<u8>>,
    messages: Arc<MessageStore>,
    events: Arc<EventLog>,
}

impl TransportServer {
    pub fn new(local_id: String, messages: Arc<MessageStore>, events: Arc<EventLog>) -> Self {
        Self {
            local_id,
            buffers: HashMap::new(),
            messages,
            events,
        }
    }

    /// A peer session opened.
    pub fn on_connect(&mut self, session: &str) {
        self.events
            .log(EventType::ServerEvent, format!("Server CONNECTED: {session}"));
    }

    /// One write request. Fragments accumulate in the session buffer until
    /// an explicit execute; a single-shot write is decoded and stored right
    /// away and leaves any open buffer untouched. Returns the acknowledgement.
    pub fn on_write(&mut self, session: &str, bytes: &[u8], is_fragment: bool) -> bool {
        if is_fragment {
            self.buffers
                .entry(session.to_string())
                .or_default()
                .extend_from_slice(bytes);
            true
        } else {
            self.decode_and_store(bytes)
        }
    }

    /// Close an open prepared sequence. Commit concatenates and decodes the
    /// buffer; abort discards it and still acknowledges success. A commit
    /// with no buffer is acknowledged as a failure.
    pub fn on_execute(&mut self, session: &str, commit: bool) -> bool {
        let buffer = self.buffers.remove(session);
        if !commit {
            return true;
        }
        match buffer {
            Some(bytes) => self.decode_and_store(&bytes),
            None => {
                self.events.log(
                    EventType::Error,
                    format!("Execute with no pending buffer for {session}"),
                );
                false
            }
        }
    }

    /// Discard any pending buffer so stale partial data cannot leak into a
    /// future session from the same peer.
    pub fn on_disconnect(&mut self, session: &str) {
        self.buffers.remove(session);
        self.events.log(
            EventType::ServerEvent,
            format!("Server DISCONNECTED: {session}"),
        );
    }

    /// Drop every open buffer; used when the whole system stops.
    pub fn discard_all(&mut self) {
        self.buffers.clear();
    }

    fn decode_and_store(&self, bytes: &[u8]) -> bool {
        match codec::decode(bytes, &self.local_id) {
            Some(msg) => {
                let geo = match (msg.lat, msg.lon) {
                    (Some(lat), Some(lon)) => format!(", lat={lat}, lon={lon}"),
                    _ => String::new(),
                };
                self.events.log(
                    EventType::MessageReceived,
                    format!("From {}: {} (ts={}{geo})", msg.from_id, msg.text, msg.timestamp),
                );
                self.messages.append(msg);
                true
            }
            None => {
                self.events.log(
                    EventType::Error,
                    format!(
                        "Malformed message received: {}",
                        String::from_utf8_lossy(bytes)
                    ),
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;

    fn server() -> (TransportServer, Arc<MessageStore>) {
        let tag = uuid::Uuid::new_v4();
        let messages = Arc::new(MessageStore::new(
            std::env::temp_dir().join(format!("aidlink-srv-msg-{tag}.json")),
        ));
        let events = Arc::new(EventLog::new(
            std::env::temp_dir().join(format!("aidlink-srv-log-{tag}.json")),
        ));
        (
            TransportServer::new("LOCAL".into(), messages.clone(), events),
            messages,
        )
    }

    #[test]
    fn single_shot_write_stores_immediately() {
        let (mut server, messages) = server();
        let payload = codec::encode("A", "hello", 1, None, None);
        assert!(server.on_write("s1", &payload, false));
        let stored = messages.read_all();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].to_id.as_deref(), Some("LOCAL"));
    }

    #[test]
    fn three_fragments_then_commit_yield_one_message() {
        let (mut server, messages) = server();
        let payload = codec::encode("A", "fragmented hello", 7, None, None);
        let third = payload.len() / 3;
        assert!(server.on_write("s1", &payload[..third], true));
        assert!(server.on_write("s1", &payload[third..2 * third], true));
        assert!(server.on_write("s1", &payload[2 * third..], true));
        assert!(messages.read_all().is_empty());

        assert!(server.on_execute("s1", true));
        let stored = messages.read_all();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].text, "fragmented hello");
    }

    #[test]
    fn abort_discards_buffer_and_acks_success() {
        let (mut server, messages) = server();
        let payload = codec::encode("A", "never delivered", 7, None, None);
        server.on_write("s1", &payload[..4], true);
        assert!(server.on_execute("s1", false));
        assert!(messages.read_all().is_empty());
        // The buffer is gone, so a follow-up commit fails.
        assert!(!server.on_execute("s1", true));
    }

    #[test]
    fn commit_without_buffer_acks_failure() {
        let (mut server, _messages) = server();
        assert!(!server.on_execute("nobody", true));
    }

    #[test]
    fn disconnect_discards_partial_state() {
        let (mut server, messages) = server();
        server.on_write("s1", b"{\"fromId\":\"A\",", true);
        server.on_disconnect("s1");
        // A new sequence from the same session starts from an empty buffer.
        let payload = codec::encode("A", "fresh", 7, None, None);
        server.on_write("s1", &payload, true);
        assert!(server.on_execute("s1", true));
        let stored = messages.read_all();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].text, "fresh");
    }

    #[test]
    fn sessions_do_not_share_buffers() {
        let (mut server, messages) = server();
        let a = codec::encode("A", "from a", 1, None, None);
        let b = codec::encode("B", "from b", 2, None, None);
        server.on_write("s1", &a, true);
        server.on_write("s2", &b, true);
        assert!(server.on_execute("s1", true));
        assert!(server.on_execute("s2", true));
        let texts: Vec<String> = messages.read_all().into_iter().map(|m| m.text).collect();
        assert_eq!(texts, ["from a", "from b"]);
    }

    #[test]
    fn malformed_payload_is_dropped_not_stored() {
        let (mut server, messages) = server();
        assert!(!server.on_write("s1", b"not json and no pipes", false));
        server.on_write("s1", b"garbage", true);
        assert!(!server.on_execute("s1", true));
        assert!(messages.read_all().is_empty());
    }
}
