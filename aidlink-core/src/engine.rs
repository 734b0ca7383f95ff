//! Lifecycle facade: owns the identity, the discovery engine, the inbound
//! endpoint, and both durable stores. The host drives radio I/O and the
//! periodic retention trigger; everything here stays synchronous.

use std::path::Path;
use std::sync::Arc;

use crate::client::{Broadcast, SendPipeline};
use crate::discovery::DiscoveryEngine;
use crate::identity::IdentityProvider;
use crate::link::Frame;
use crate::model::{ConnectionEvent, EventType, Message, Peer};
use crate::platform::{LocationSource, Permissions, RadioState};
use crate::server::TransportServer;
use crate::store::{EventLog, MessageStore};

pub struct Engine {
    local_id: String,
    discovery: DiscoveryEngine,
    server: TransportServer,
    messages: Arc<MessageStore>,
    events: Arc<EventLog>,
}

impl Engine {
    /// Build an engine rooted at `data_dir`; the identity file and both
    /// store files live there. `seed` is the host's stable machine seed;
    /// `name` is the optional display name carried in beacons.
    pub fn new(
        data_dir: &Path,
        seed: Option<String>,
        name: Option<String>,
        listen_port: u16,
    ) -> Self {
        let messages = Arc::new(MessageStore::new(data_dir.join("messages.json")));
        let events = Arc::new(EventLog::new(data_dir.join("connection_log.json")));
        let identity = IdentityProvider::new(data_dir.join("device_id"), seed);
        let local_id = identity.get_identity();
        let digest = identity.identity_digest();
        Self {
            discovery: DiscoveryEngine::new(digest, name, listen_port, events.clone()),
            server: TransportServer::new(local_id.clone(), messages.clone(), events.clone()),
            local_id,
            messages,
            events,
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Arm advertising and scanning. Returns the beacon frame to broadcast
    /// (when advertising could start).
    pub fn start(
        &mut self,
        permissions: &dyn Permissions,
        radio: &dyn RadioState,
    ) -> Option<Frame> {
        let beacon = self.discovery.start_advertising(permissions, radio);
        self.discovery.start_scanning(permissions, radio);
        beacon
    }

    /// Stop discovery and drop every open inbound buffer. In-flight outbound
    /// sends resolve through their own state machines. Blocks until both
    /// store writers drained.
    pub fn stop(&mut self) {
        self.discovery.stop_scanning();
        self.discovery.stop_advertising();
        self.server.discard_all();
        self.messages.flush();
        self.events.flush();
    }

    /// Current beacon frame, if advertising is active.
    pub fn beacon_frame(&self) -> Option<Frame> {
        self.discovery.beacon_frame()
    }

    pub fn discovery_mut(&mut self) -> &mut DiscoveryEngine {
        &mut self.discovery
    }

    pub fn server_mut(&mut self) -> &mut TransportServer {
        &mut self.server
    }

    pub fn peers(&self) -> Vec<Peer> {
        self.discovery.peers().to_vec()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.messages.read_all()
    }

    pub fn events(&self) -> Vec<ConnectionEvent> {
        self.events.read_all()
    }

    /// Hourly-style retention trigger; the host calls this from its
    /// periodic task so idle periods still get compacted.
    pub fn prune_retained(&self) {
        let _ = self.messages.read_all();
    }

    /// Begin one send. `None` when the connect permission is denied (logged
    /// as a Permission event; the caller reports failure and does not retry).
    pub fn new_send(
        &self,
        address: &str,
        text: &str,
        permissions: &dyn Permissions,
        location: &dyn LocationSource,
    ) -> Option<SendPipeline> {
        if !permissions.can_connect() {
            self.events.log(
                EventType::Permission,
                "Missing connect permission; cannot send message",
            );
            return None;
        }
        let position = if permissions.can_location() {
            location.last_known()
        } else {
            None
        };
        Some(SendPipeline::new(
            address,
            &self.local_id,
            text,
            position,
            self.messages.clone(),
            self.events.clone(),
        ))
    }

    /// Plan a broadcast over the given addresses.
    pub fn broadcast<I>(&self, addresses: I) -> Broadcast
    where
        I: IntoIterator<Item = String>,
    {
        Broadcast::new(addresses)
    }
}
