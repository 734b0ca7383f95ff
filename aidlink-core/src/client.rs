//! Outbound transport: the per-recipient send pipeline and the sequential
//! broadcast helper.
//!
//! The pipeline is host-driven in the events-in/actions-out style: the host
//! owns the connection and feeds radio outcomes in; the pipeline answers
//! with the next steps. Every send resolves to exactly one `Complete`.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::codec;
use crate::model::{now_ms, EventType, Message};
use crate::store::{EventLog, MessageStore};

/// Payload budget requested from the endpoint during negotiation.
pub const REQUESTED_MTU: u16 = 185;
/// Usable payload bytes when negotiation is skipped or fails.
pub const DEFAULT_WRITE_BUDGET: usize = 20;
/// Fixed pause between broadcast attempts, for radio contention.
pub const BROADCAST_DELAY_MS: u64 = 300;

/// What endpoint discovery reported about the write characteristic.
#[derive(Debug, Clone, Copy)]
pub struct EndpointProps {
    pub supports_ack: bool,
    pub supports_unacked: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    Acknowledged,
    Unacknowledged,
}

/// Host-reported outcome of one write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    Success,
    Rejected,
    /// The endpoint refuses acknowledged writes specifically; retry once
    /// fire-and-forget.
    RequiresUnacked,
}

/// Radio outcomes fed in by the host.
#[derive(Debug)]
pub enum SendEvent {
    Connected,
    ConnectFailed(String),
    MtuChanged(u16),
    MtuFailed,
    Discovered(EndpointProps),
    ServiceNotFound,
    WriteAck(WriteStatus),
    Disconnected,
}

/// Steps for the host to carry out, in order.
#[derive(Debug, PartialEq)]
pub enum SendAction {
    NegotiateMtu(u16),
    Discover,
    Write {
        payload: Vec<u8>,
        kind: WriteKind,
        fragment: bool,
    },
    Execute {
        commit: bool,
    },
    Disconnect,
    Complete(bool),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendState {
    Connecting,
    Negotiating,
    Discovering,
    Writing,
    Committing,
    Done,
}

/// Linear per-send state machine: Connect, negotiate (best effort),
/// discover, write with fallback, complete. On success the locally authored
/// message (no recipient) is appended to the store as the durable record of
/// the attempt.
pub struct SendPipeline {
    address: String,
    record: Message,
    payload: Vec<u8>,
    budget: usize,
    state: SendState,
    props: Option<EndpointProps>,
    kind: WriteKind,
    retried_unacked: bool,
    remaining_fragments: VecDeque<Vec<u8>>,
    fragmented: bool,
    messages: Arc<MessageStore>,
    events: Arc<EventLog>,
}

impl SendPipeline {
    pub fn new(
        address: impl Into<String>,
        local_id: &str,
        text: &str,
        location: Option<(f64, f64)>,
        messages: Arc<MessageStore>,
        events: Arc<EventLog>,
    ) -> Self {
        let timestamp = now_ms();
        let (lat, lon) = match location {
            Some((lat, lon)) => (Some(lat), Some(lon)),
            None => (None, None),
        };
        let payload = codec::encode(local_id, text, timestamp, lat, lon);
        Self {
            address: address.into(),
            record: Message {
                from_id: local_id.to_string(),
                to_id: None,
                text: text.to_string(),
                timestamp,
                lat,
                lon,
            },
            payload,
            budget: DEFAULT_WRITE_BUDGET,
            state: SendState::Connecting,
            props: None,
            kind: WriteKind::Acknowledged,
            retried_unacked: false,
            remaining_fragments: VecDeque::new(),
            fragmented: false,
            messages,
            events,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_done(&self) -> bool {
        self.state == SendState::Done
    }

    /// Advance the machine with one host event. Unexpected events for the
    /// current state are ignored; after completion everything is ignored.
    pub fn on_event(&mut self, event: SendEvent) -> Vec<SendAction> {
        if self.state == SendState::Done {
            return Vec::new();
        }
        match (self.state, event) {
            (SendState::Connecting, SendEvent::Connected) => {
                self.state = SendState::Negotiating;
                vec![SendAction::NegotiateMtu(REQUESTED_MTU)]
            }
            (SendState::Connecting, SendEvent::ConnectFailed(reason)) => self.fail(
                format!("Connect failed to {}: {reason}", self.address),
                false,
            ),
            (SendState::Negotiating, SendEvent::MtuChanged(mtu)) => {
                self.budget = usize::from(mtu).saturating_sub(3).max(1);
                self.events.log(
                    EventType::ClientEvent,
                    format!("MTU changed to {mtu} on {}", self.address),
                );
                self.state = SendState::Discovering;
                vec![SendAction::Discover]
            }
            (SendState::Negotiating, SendEvent::MtuFailed) => {
                // Negotiation is best effort; carry on with the default.
                self.state = SendState::Discovering;
                vec![SendAction::Discover]
            }
            (SendState::Discovering, SendEvent::Discovered(props)) => {
                self.props = Some(props);
                self.plan_writes(props)
            }
            (SendState::Discovering, SendEvent::ServiceNotFound) => self.fail(
                format!(
                    "Target service/characteristic not found on {}",
                    self.address
                ),
                true,
            ),
            (SendState::Writing, SendEvent::WriteAck(status)) => self.on_write_ack(status),
            (SendState::Committing, SendEvent::WriteAck(WriteStatus::Success)) => self.succeed(),
            (SendState::Committing, SendEvent::WriteAck(_)) => self.fail(
                format!("Execute write failed to {}", self.address),
                true,
            ),
            (_, SendEvent::Disconnected) => {
                self.fail(format!("Disconnected from {} mid-send", self.address), false)
            }
            (_, _) => Vec::new(),
        }
    }

    fn plan_writes(&mut self, props: EndpointProps) -> Vec<SendAction> {
        if self.payload.len() <= self.budget {
            let kind = if props.supports_ack {
                WriteKind::Acknowledged
            } else if props.supports_unacked {
                WriteKind::Unacknowledged
            } else {
                return self.fail(
                    format!("Characteristic not writable on {}", self.address),
                    true,
                );
            };
            self.kind = kind;
            self.state = SendState::Writing;
            return vec![SendAction::Write {
                payload: self.payload.clone(),
                kind,
                fragment: false,
            }];
        }
        // Oversized payloads go as a prepared sequence, which needs the
        // acknowledged write form.
        if !props.supports_ack {
            return self.fail(
                format!(
                    "Payload exceeds write budget and {} lacks acknowledged writes",
                    self.address
                ),
                true,
            );
        }
        self.fragmented = true;
        self.kind = WriteKind::Acknowledged;
        self.remaining_fragments = self
            .payload
            .chunks(self.budget)
            .map(|c| c.to_vec())
            .collect();
        self.state = SendState::Writing;
        match self.remaining_fragments.pop_front() {
            Some(first) => vec![SendAction::Write {
                payload: first,
                kind: WriteKind::Acknowledged,
                fragment: true,
            }],
            None => self.fail("Empty payload".to_string(), true),
        }
    }

    fn on_write_ack(&mut self, status: WriteStatus) -> Vec<SendAction> {
        match status {
            WriteStatus::Success => {
                if !self.fragmented {
                    return self.succeed();
                }
                match self.remaining_fragments.pop_front() {
                    Some(next) => vec![SendAction::Write {
                        payload: next,
                        kind: WriteKind::Acknowledged,
                        fragment: true,
                    }],
                    None => {
                        self.state = SendState::Committing;
                        vec![SendAction::Execute { commit: true }]
                    }
                }
            }
            WriteStatus::RequiresUnacked => {
                let supports_unacked = self.props.map(|p| p.supports_unacked).unwrap_or(false);
                if self.kind == WriteKind::Acknowledged
                    && !self.fragmented
                    && supports_unacked
                    && !self.retried_unacked
                {
                    self.retried_unacked = true;
                    self.kind = WriteKind::Unacknowledged;
                    return vec![SendAction::Write {
                        payload: self.payload.clone(),
                        kind: WriteKind::Unacknowledged,
                        fragment: false,
                    }];
                }
                self.fail(
                    format!("Write not allowed to {}", self.address),
                    true,
                )
            }
            WriteStatus::Rejected => {
                self.fail(format!("Write failed to {}", self.address), true)
            }
        }
    }

    fn succeed(&mut self) -> Vec<SendAction> {
        self.state = SendState::Done;
        self.messages.append(self.record.clone());
        let suffix = if self.kind == WriteKind::Unacknowledged {
            " (NO_RESPONSE)"
        } else {
            ""
        };
        self.events.log(
            EventType::MessageSent,
            format!("To {}: {}{suffix}", self.address, self.record.text),
        );
        vec![SendAction::Disconnect, SendAction::Complete(true)]
    }

    fn fail(&mut self, reason: String, disconnect: bool) -> Vec<SendAction> {
        self.state = SendState::Done;
        tracing::warn!("send failed: {reason}");
        self.events.log(EventType::Error, reason);
        if disconnect {
            vec![SendAction::Disconnect, SendAction::Complete(false)]
        } else {
            vec![SendAction::Complete(false)]
        }
    }
}

/// Sequential broadcast bookkeeping. Targets are de-duplicated non-blank
/// addresses; progress is cumulative attempts over the total, reported after
/// every attempt whatever its outcome. The host inserts the
/// [`BROADCAST_DELAY_MS`] pause between attempts.
pub struct Broadcast {
    targets: Vec<String>,
    attempted: usize,
}

impl Broadcast {
    pub fn new<I>(addresses: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        let mut targets: Vec<String> = Vec::new();
        for addr in addresses {
            let addr = addr.trim();
            if !addr.is_empty() && !targets.iter().any(|t| t == addr) {
                targets.push(addr.to_string());
            }
        }
        Self {
            targets,
            attempted: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn total(&self) -> usize {
        self.targets.len()
    }

    /// Next address to attempt, if any remain.
    pub fn next_target(&self) -> Option<&str> {
        self.targets.get(self.attempted).map(String::as_str)
    }

    /// Record one finished attempt and return cumulative `(sent, total)`.
    pub fn record_attempt(&mut self) -> (usize, usize) {
        self.attempted += 1;
        (self.attempted, self.targets.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;

    fn stores() -> (Arc<MessageStore>, Arc<EventLog>) {
        let tag = uuid::Uuid::new_v4();
        (
            Arc::new(MessageStore::new(
                std::env::temp_dir().join(format!("aidlink-cli-msg-{tag}.json")),
            )),
            Arc::new(EventLog::new(
                std::env::temp_dir().join(format!("aidlink-cli-log-{tag}.json")),
            )),
        )
    }

    fn pipeline(text: &str) -> (SendPipeline, Arc<MessageStore>) {
        let (messages, events) = stores();
        (
            SendPipeline::new("AA:01", "LOCAL", text, None, messages.clone(), events),
            messages,
        )
    }

    fn both() -> EndpointProps {
        EndpointProps {
            supports_ack: true,
            supports_unacked: true,
        }
    }

    /// Drive a pipeline to completion against a scripted endpoint, returning
    /// the completion flag and the number of completions seen.
    fn drive(
        pipeline: &mut SendPipeline,
        props: EndpointProps,
        mut ack: impl FnMut(usize) -> WriteStatus,
    ) -> (Option<bool>, usize) {
        let mut queue: VecDeque<SendAction> = pipeline.on_event(SendEvent::Connected).into();
        let mut completions = 0;
        let mut outcome = None;
        let mut writes = 0;
        while let Some(action) = queue.pop_front() {
            let next = match action {
                SendAction::NegotiateMtu(_) => pipeline.on_event(SendEvent::MtuChanged(64)),
                SendAction::Discover => pipeline.on_event(SendEvent::Discovered(props)),
                SendAction::Write { .. } => {
                    let status = ack(writes);
                    writes += 1;
                    pipeline.on_event(SendEvent::WriteAck(status))
                }
                SendAction::Execute { .. } => pipeline.on_event(SendEvent::WriteAck(ack(writes))),
                SendAction::Disconnect => Vec::new(),
                SendAction::Complete(ok) => {
                    completions += 1;
                    outcome = Some(ok);
                    Vec::new()
                }
            };
            queue.extend(next);
        }
        (outcome, completions)
    }

    #[test]
    fn short_payload_single_acknowledged_write() {
        let (mut p, messages) = pipeline("hi");
        let (outcome, completions) = drive(&mut p, both(), |_| WriteStatus::Success);
        assert_eq!(outcome, Some(true));
        assert_eq!(completions, 1);
        // Durable local record: authored locally, no recipient.
        let stored = messages.read_all();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].to_id, None);
        assert_eq!(stored[0].from_id, "LOCAL");
    }

    #[test]
    fn oversized_payload_fragments_then_commits() {
        let text = "x".repeat(400);
        let (mut p, messages) = pipeline(&text);
        let mut actions = p.on_event(SendEvent::Connected);
        assert_eq!(actions, vec![SendAction::NegotiateMtu(REQUESTED_MTU)]);
        actions = p.on_event(SendEvent::MtuFailed);
        assert_eq!(actions, vec![SendAction::Discover]);
        // Default budget 20: the payload must split into multiple fragments.
        let mut fragments = 0;
        let mut committed = false;
        actions = p.on_event(SendEvent::Discovered(both()));
        loop {
            match actions.remove(0) {
                SendAction::Write { fragment, .. } => {
                    assert!(fragment);
                    fragments += 1;
                    actions = p.on_event(SendEvent::WriteAck(WriteStatus::Success));
                }
                SendAction::Execute { commit } => {
                    assert!(commit);
                    committed = true;
                    actions = p.on_event(SendEvent::WriteAck(WriteStatus::Success));
                }
                SendAction::Disconnect => {
                    assert_eq!(actions, vec![SendAction::Complete(true)]);
                    break;
                }
                other => panic!("unexpected action {other:?}"),
            }
        }
        assert!(committed);
        assert!(fragments > 2);
        assert_eq!(messages.read_all().len(), 1);
    }

    #[test]
    fn rejected_ack_write_retries_once_unacknowledged() {
        let (mut p, messages) = pipeline("hi");
        let (outcome, completions) = drive(&mut p, both(), |attempt| {
            if attempt == 0 {
                WriteStatus::RequiresUnacked
            } else {
                WriteStatus::Success
            }
        });
        assert_eq!(outcome, Some(true));
        assert_eq!(completions, 1);
        assert_eq!(messages.read_all().len(), 1);
    }

    #[test]
    fn repeated_rejection_fails_after_single_retry() {
        let (mut p, messages) = pipeline("hi");
        let (outcome, completions) = drive(&mut p, both(), |_| WriteStatus::RequiresUnacked);
        assert_eq!(outcome, Some(false));
        assert_eq!(completions, 1);
        assert!(messages.read_all().is_empty());
    }

    #[test]
    fn unwritable_endpoint_fails() {
        let (mut p, messages) = pipeline("hi");
        let props = EndpointProps {
            supports_ack: false,
            supports_unacked: false,
        };
        let (outcome, _) = drive(&mut p, props, |_| WriteStatus::Success);
        assert_eq!(outcome, Some(false));
        assert!(messages.read_all().is_empty());
    }

    #[test]
    fn ack_only_endpoint_still_delivers() {
        let (mut p, messages) = pipeline("hi");
        let props = EndpointProps {
            supports_ack: true,
            supports_unacked: false,
        };
        let (outcome, _) = drive(&mut p, props, |_| WriteStatus::Success);
        assert_eq!(outcome, Some(true));
        assert_eq!(messages.read_all().len(), 1);
    }

    #[test]
    fn service_not_found_fails_once() {
        let (mut p, messages) = pipeline("hi");
        p.on_event(SendEvent::Connected);
        p.on_event(SendEvent::MtuFailed);
        let actions = p.on_event(SendEvent::ServiceNotFound);
        assert_eq!(
            actions,
            vec![SendAction::Disconnect, SendAction::Complete(false)]
        );
        // Everything after completion is ignored.
        assert!(p.on_event(SendEvent::Disconnected).is_empty());
        assert!(messages.read_all().is_empty());
    }

    #[test]
    fn mid_send_disconnect_completes_failure_without_disconnect_action() {
        let (mut p, _messages) = pipeline("hi");
        p.on_event(SendEvent::Connected);
        let actions = p.on_event(SendEvent::Disconnected);
        assert_eq!(actions, vec![SendAction::Complete(false)]);
    }

    #[test]
    fn connect_failure_completes_failure() {
        let (mut p, _messages) = pipeline("hi");
        let actions = p.on_event(SendEvent::ConnectFailed("refused".into()));
        assert_eq!(actions, vec![SendAction::Complete(false)]);
        assert!(p.is_done());
    }

    #[test]
    fn random_payload_fragments_reassemble_to_original_via_codec() {
        // End to end with the server: fragments produced here decode there.
        let mut noise = [0u8; 24];
        rand::thread_rng().fill_bytes(&mut noise);
        let text: String = noise.iter().map(|b| char::from(b'a' + (b % 26))).collect();
        let text = text.repeat(10);
        let (mut p, _messages) = pipeline(&text);
        p.on_event(SendEvent::Connected);
        p.on_event(SendEvent::MtuFailed);
        let mut actions = p.on_event(SendEvent::Discovered(both()));
        let mut reassembled = Vec::new();
        loop {
            match actions.remove(0) {
                SendAction::Write { payload, .. } => {
                    reassembled.extend_from_slice(&payload);
                    actions = p.on_event(SendEvent::WriteAck(WriteStatus::Success));
                }
                SendAction::Execute { .. } => break,
                other => panic!("unexpected action {other:?}"),
            }
        }
        let decoded = codec::decode(&reassembled, "LOCAL").unwrap();
        assert_eq!(decoded.text, text);
    }

    #[test]
    fn broadcast_progress_counts_up() {
        let mut b = Broadcast::new(
            ["AA:01", "", "BB:02", "AA:01", "CC:03"]
                .into_iter()
                .map(String::from),
        );
        assert_eq!(b.total(), 3);
        assert_eq!(b.next_target(), Some("AA:01"));
        assert_eq!(b.record_attempt(), (1, 3));
        assert_eq!(b.next_target(), Some("BB:02"));
        assert_eq!(b.record_attempt(), (2, 3));
        assert_eq!(b.record_attempt(), (3, 3));
        assert_eq!(b.next_target(), None);
    }

    #[test]
    fn broadcast_trims_addresses_before_dedup() {
        let mut b = Broadcast::new(
            ["AA:01", " AA:01 ", "BB:02", "BB:02  "]
                .into_iter()
                .map(String::from),
        );
        assert_eq!(b.total(), 2);
        assert_eq!(b.next_target(), Some("AA:01"));
        b.record_attempt();
        assert_eq!(b.next_target(), Some("BB:02"));
    }

    #[test]
    fn broadcast_empty_or_blank_reports_zero() {
        let b = Broadcast::new(["", "   "].into_iter().map(String::from));
        assert!(b.is_empty());
        assert_eq!(b.total(), 0);
        assert_eq!(b.next_target(), None);
    }
}
