//! Aidlink: infrastructure-free disaster-relief messaging engine.
//! Host-driven: no sockets and no async runtime in this crate; the host
//! feeds radio events in and carries out the returned actions.

pub mod client;
pub mod codec;
pub mod discovery;
pub mod engine;
pub mod identity;
pub mod link;
pub mod model;
pub mod platform;
pub mod server;
pub mod store;

pub use client::{
    Broadcast, EndpointProps, SendAction, SendEvent, SendPipeline, WriteKind, WriteStatus,
    BROADCAST_DELAY_MS, REQUESTED_MTU,
};
pub use discovery::{DiscoveryEngine, ScanResult};
pub use engine::Engine;
pub use identity::IdentityProvider;
pub use link::{
    decode_frame, encode_frame, Frame, CHARACTERISTIC_MESSAGE_ID, MAX_FRAME_LEN,
    PROTOCOL_VERSION, SERVICE_ID, VENDOR_ID,
};
pub use model::{ConnectionEvent, EventType, Message, Peer};
pub use platform::{GrantAll, LocationSource, NoLocation, Permissions, RadioState};
pub use server::TransportServer;
pub use store::{EventLog, MessageStore, RETENTION_MS};
