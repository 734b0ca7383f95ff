//! Discovery: presence beaconing and the deduplicated peer registry.
//!
//! Advertising and scanning are independent toggles. The registry is keyed
//! by transport address when one is visible, and by identity digest when the
//! host's permission level hides addresses.

use std::sync::Arc;

use crate::identity::digest_hex;
use crate::link::{self, Frame};
use crate::model::{EventType, Peer};
use crate::platform::{Permissions, RadioState};
use crate::store::EventLog;

/// One scan hit as reported by the host radio. `address` is empty when the
/// connect-level permission is missing; the vendor digest is always carried.
#[derive(Debug, Clone)]
pub struct ScanResult {
    pub address: String,
    pub digest: Option<[u8; 16]>,
    pub name: Option<String>,
}

/// Owns the peer registry and the advertising/scanning state.
pub struct DiscoveryEngine {
    local_digest: [u8; 16],
    local_name: Option<String>,
    listen_port: u16,
    advertising: bool,
    scanning: bool,
    peers: Vec<Peer>,
    events: Arc<EventLog>,
}

impl DiscoveryEngine {
    pub fn new(
        local_digest: [u8; 16],
        local_name: Option<String>,
        listen_port: u16,
        events: Arc<EventLog>,
    ) -> Self {
        Self {
            local_digest,
            local_name,
            listen_port,
            advertising: false,
            scanning: false,
            peers: Vec::new(),
            events,
        }
    }

    pub fn is_advertising(&self) -> bool {
        self.advertising
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning
    }

    /// Begin advertising. Returns the beacon frame the host should
    /// broadcast, or `None` when blocked (logged, retryable, never fatal).
    pub fn start_advertising(
        &mut self,
        permissions: &dyn Permissions,
        radio: &dyn RadioState,
    ) -> Option<Frame> {
        if self.advertising {
            self.events
                .log(EventType::Error, "Advertising already running");
            return None;
        }
        if !permissions.can_advertise() {
            self.events.log(
                EventType::Permission,
                "Missing advertise permission; cannot advertise",
            );
            return None;
        }
        if !radio.is_enabled() {
            self.events.log(
                EventType::Error,
                "Radio not available or disabled; cannot advertise",
            );
            return None;
        }
        self.advertising = true;
        self.events.log(
            EventType::Advertise,
            "Advertising started (service id in primary slot, digest in scan response)",
        );
        Some(link::beacon(
            self.local_digest,
            self.local_name.clone(),
            self.listen_port,
        ))
    }

    /// The beacon to broadcast while advertising is active.
    pub fn beacon_frame(&self) -> Option<Frame> {
        self.advertising
            .then(|| link::beacon(self.local_digest, self.local_name.clone(), self.listen_port))
    }

    /// Host reports an asynchronous advertise failure (oversize payload, too
    /// many advertisers, unsupported, ...). Leaves the engine retryable.
    pub fn advertise_failed(&mut self, reason: &str) {
        self.advertising = false;
        self.events
            .log(EventType::Error, format!("Advertising failed: {reason}"));
    }

    /// Idempotent: a no-op when not advertising.
    pub fn stop_advertising(&mut self) {
        if !self.advertising {
            return;
        }
        self.advertising = false;
        self.events.log(EventType::Advertise, "Advertising stopped");
    }

    /// Begin scanning for beacons carrying the well-known service id.
    pub fn start_scanning(
        &mut self,
        permissions: &dyn Permissions,
        radio: &dyn RadioState,
    ) -> bool {
        if self.scanning {
            self.events.log(EventType::Error, "Scan already running");
            return false;
        }
        if !permissions.can_scan() {
            self.events
                .log(EventType::Permission, "Missing scan permission; cannot scan");
            return false;
        }
        if !radio.is_enabled() {
            self.events.log(
                EventType::Error,
                "Radio not available or disabled; cannot scan",
            );
            return false;
        }
        self.scanning = true;
        self.events.log(EventType::Scan, "Scanning started");
        true
    }

    /// Host reports an asynchronous scan failure. Leaves the engine retryable.
    pub fn scan_failed(&mut self, reason: &str) {
        self.scanning = false;
        self.events
            .log(EventType::Error, format!("Scan failed: {reason}"));
    }

    /// Idempotent: a no-op when not scanning.
    pub fn stop_scanning(&mut self) {
        if !self.scanning {
            return;
        }
        self.scanning = false;
        self.events.log(EventType::Scan, "Scanning stopped");
    }

    /// Merge one scan hit into the registry.
    ///
    /// Address visible: insert new, or update digest/name in place keeping
    /// the entry's position. Address hidden: the digest hex is the key, with
    /// the same insert-or-update rule. A hit carrying neither is only logged.
    pub fn handle_scan_result(&mut self, result: ScanResult) {
        if !self.scanning {
            return;
        }
        // Our own beacon echoes back on shared media; never register it.
        if result.digest == Some(self.local_digest) {
            return;
        }
        let id_hex = result.digest.map(|d| digest_hex(&d)).unwrap_or_default();
        let peer = Peer {
            address: result.address,
            device_id_hex: id_hex.clone(),
            name: result.name,
        };
        if !peer.address.is_empty() {
            match self.peers.iter().position(|p| p.address == peer.address) {
                None => {
                    self.events.log(
                        EventType::Scan,
                        format!(
                            "Found {} id={} name={:?}",
                            peer.address, peer.device_id_hex, peer.name
                        ),
                    );
                    self.peers.push(peer);
                }
                Some(idx) => {
                    let existing = &self.peers[idx];
                    if existing.device_id_hex != peer.device_id_hex || existing.name != peer.name {
                        self.peers[idx] = peer;
                    }
                }
            }
        } else if !id_hex.is_empty() {
            match self.peers.iter().position(|p| p.device_id_hex == id_hex) {
                None => {
                    self.events.log(
                        EventType::Scan,
                        format!("Found peer (address hidden) id={id_hex} name={:?}", peer.name),
                    );
                    self.peers.push(peer);
                }
                Some(idx) => {
                    if peer.name.is_some() && self.peers[idx].name != peer.name {
                        self.peers[idx].name = peer.name;
                    }
                }
            }
        } else {
            self.events
                .log(EventType::Scan, "Found peer (address hidden)");
        }
    }

    /// Registry snapshot in discovery order.
    pub fn peers(&self) -> &[Peer] {
        &self.peers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::GrantAll;

    struct Denied;
    impl Permissions for Denied {
        fn can_scan(&self) -> bool {
            false
        }
        fn can_connect(&self) -> bool {
            false
        }
        fn can_advertise(&self) -> bool {
            false
        }
        fn can_location(&self) -> bool {
            false
        }
    }

    struct RadioOff;
    impl RadioState for RadioOff {
        fn is_enabled(&self) -> bool {
            false
        }
    }

    fn event_log() -> Arc<EventLog> {
        Arc::new(EventLog::new(std::env::temp_dir().join(format!(
            "aidlink-disc-{}.json",
            uuid::Uuid::new_v4()
        ))))
    }

    fn engine() -> DiscoveryEngine {
        DiscoveryEngine::new([9u8; 16], None, 45711, event_log())
    }

    fn scanning_engine() -> DiscoveryEngine {
        let mut e = engine();
        assert!(e.start_scanning(&GrantAll, &GrantAll));
        e
    }

    fn hit(address: &str, digest: u8, name: Option<&str>) -> ScanResult {
        ScanResult {
            address: address.into(),
            digest: Some([digest; 16]),
            name: name.map(Into::into),
        }
    }

    #[test]
    fn advertising_and_scanning_are_independent() {
        let mut e = engine();
        let frame = e.start_advertising(&GrantAll, &GrantAll);
        assert!(matches!(frame, Some(Frame::Beacon { .. })));
        assert!(e.is_advertising());
        assert!(!e.is_scanning());
        assert!(e.start_scanning(&GrantAll, &GrantAll));
        assert!(e.is_advertising() && e.is_scanning());
    }

    #[test]
    fn denied_permission_blocks_but_stays_retryable() {
        let mut e = engine();
        assert!(e.start_advertising(&Denied, &GrantAll).is_none());
        assert!(!e.is_advertising());
        assert!(e.start_advertising(&GrantAll, &GrantAll).is_some());
    }

    #[test]
    fn radio_off_blocks_scan() {
        let mut e = engine();
        assert!(!e.start_scanning(&GrantAll, &RadioOff));
        assert!(!e.is_scanning());
    }

    #[test]
    fn advertise_failure_resets_state() {
        let mut e = engine();
        e.start_advertising(&GrantAll, &GrantAll);
        e.advertise_failed("TOO_MANY_ADVERTISERS");
        assert!(!e.is_advertising());
        assert!(e.start_advertising(&GrantAll, &GrantAll).is_some());
    }

    #[test]
    fn stop_is_idempotent_when_not_running() {
        let mut e = engine();
        e.stop_advertising();
        e.stop_scanning();
        assert!(!e.is_advertising() && !e.is_scanning());
    }

    #[test]
    fn same_address_updates_in_place() {
        let mut e = scanning_engine();
        e.handle_scan_result(hit("AA:01", 1, Some("alpha")));
        e.handle_scan_result(hit("BB:02", 2, None));
        e.handle_scan_result(hit("AA:01", 1, Some("renamed")));
        let peers = e.peers();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].address, "AA:01");
        assert_eq!(peers[0].name.as_deref(), Some("renamed"));
        assert_eq!(peers[1].address, "BB:02");
    }

    #[test]
    fn hidden_address_keys_by_digest() {
        let mut e = scanning_engine();
        e.handle_scan_result(hit("", 3, None));
        e.handle_scan_result(hit("", 3, Some("late-name")));
        let peers = e.peers();
        assert_eq!(peers.len(), 1);
        assert!(peers[0].address.is_empty());
        assert_eq!(peers[0].name.as_deref(), Some("late-name"));
    }

    #[test]
    fn no_address_no_digest_is_ignored() {
        let mut e = scanning_engine();
        e.handle_scan_result(ScanResult {
            address: String::new(),
            digest: None,
            name: None,
        });
        assert!(e.peers().is_empty());
    }

    #[test]
    fn own_beacon_echo_is_never_registered() {
        let mut e = scanning_engine();
        e.handle_scan_result(ScanResult {
            address: "SELF:00".into(),
            digest: Some([9u8; 16]),
            name: None,
        });
        assert!(e.peers().is_empty());
    }

    #[test]
    fn double_start_advertising_logs_and_stays_running() {
        let events = event_log();
        let mut e = DiscoveryEngine::new([9u8; 16], None, 45711, events.clone());
        assert!(e.start_advertising(&GrantAll, &GrantAll).is_some());
        assert!(e.start_advertising(&GrantAll, &GrantAll).is_none());
        assert!(e.is_advertising());
        assert!(events
            .read_all()
            .iter()
            .any(|ev| ev.event_type == EventType::Error
                && ev.message.contains("already running")));
    }

    #[test]
    fn beacon_carries_the_local_name() {
        let mut e =
            DiscoveryEngine::new([9u8; 16], Some("basecamp".into()), 45711, event_log());
        let frame = e.start_advertising(&GrantAll, &GrantAll);
        match frame {
            Some(Frame::Beacon { name, .. }) => assert_eq!(name.as_deref(), Some("basecamp")),
            other => panic!("expected Beacon, got {other:?}"),
        }
        match e.beacon_frame() {
            Some(Frame::Beacon { name, .. }) => assert_eq!(name.as_deref(), Some("basecamp")),
            other => panic!("expected Beacon, got {other:?}"),
        }
    }

    #[test]
    fn beacon_frame_follows_advertising_state() {
        let mut e = engine();
        assert!(e.beacon_frame().is_none());
        e.start_advertising(&GrantAll, &GrantAll);
        assert!(matches!(e.beacon_frame(), Some(Frame::Beacon { .. })));
        e.stop_advertising();
        assert!(e.beacon_frame().is_none());
    }

    #[test]
    fn results_ignored_while_not_scanning() {
        let mut e = engine();
        e.handle_scan_result(hit("AA:01", 1, None));
        assert!(e.peers().is_empty());
    }
}
