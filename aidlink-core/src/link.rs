//! Link protocol: beacon and write-endpoint frames, length-prefix framed
//! (4 bytes LE) with bincode payloads.

use serde::{Deserialize, Serialize};

/// Current link protocol version, carried in every beacon.
pub const PROTOCOL_VERSION: u8 = 1;

/// Well-known service identifier advertised in the primary beacon slot and
/// matched by scanners.
pub const SERVICE_ID: [u8; 16] = [
    0x8b, 0x2c, 0x79, 0xa1, 0x4c, 0x7e, 0x4c, 0x49, 0x8b, 0x73, 0x7b, 0x5e, 0x5d, 0x1f, 0x4c, 0x1a,
];

/// Write-only message characteristic under [`SERVICE_ID`].
pub const CHARACTERISTIC_MESSAGE_ID: [u8; 16] = [
    0xf6, 0xa2, 0xf5, 0xb1, 0x9a, 0x52, 0x4c, 0x8e, 0x9b, 0x5d, 0x2f, 0x4b, 0xb5, 0xa1, 0xe7, 0xa2,
];

/// Vendor tag for the identity digest in the scan-response slot.
pub const VENDOR_ID: u16 = 0x00E0;

const LEN_SIZE: usize = 4;
/// Payloads are short status messages; anything bigger than this is bogus.
pub const MAX_FRAME_LEN: u32 = 64 * 1024;

/// All link frame types. Beacons travel over the discovery channel; the rest
/// over a connection to the write endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Frame {
    /// Presence beacon. The identity digest rides in the scan-response slot
    /// under `vendor_id` to keep the primary packet inside size limits.
    Beacon {
        protocol_version: u8,
        service: [u8; 16],
        vendor_id: u16,
        digest: [u8; 16],
        name: Option<String>,
        listen_port: u16,
    },
    /// Best-effort payload budget negotiation.
    MtuRequest { mtu: u16 },
    MtuResponse { mtu: u16 },
    /// Ask the endpoint what it exposes.
    Discover,
    ServiceInfo {
        service: [u8; 16],
        characteristic: [u8; 16],
        supports_ack: bool,
        supports_unacked: bool,
    },
    /// One write: a complete payload (`fragment = false`) or a prepared
    /// chunk awaiting an explicit `Execute`. Fire-and-forget writes set
    /// `response_needed = false` and get no `Ack` back.
    Write {
        payload: Vec<u8>,
        fragment: bool,
        response_needed: bool,
    },
    /// Close an open prepared sequence: commit or abort.
    Execute { commit: bool },
    /// Write/execute acknowledgement.
    Ack { ok: bool },
}

/// Encode one frame: 4-byte LE length + bincode payload.
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, FrameEncodeError> {
    let payload = bincode::serialize(frame).map_err(FrameEncodeError::Encode)?;
    let len = payload.len() as u32;
    if len > MAX_FRAME_LEN {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[source] bincode::Error),
    #[error("frame too large")]
    TooLarge,
}

/// Decode one frame from the front of `bytes`, returning it and the number
/// of bytes consumed. `NeedMore` means the caller should retry with more
/// data appended.
pub fn decode_frame(bytes: &[u8]) -> Result<(Frame, usize), FrameDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if len > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge);
    }
    let len = len as usize;
    if bytes.len() < LEN_SIZE + len {
        return Err(FrameDecodeError::NeedMore);
    }
    let frame =
        bincode::deserialize(&bytes[LEN_SIZE..LEN_SIZE + len]).map_err(FrameDecodeError::Decode)?;
    Ok((frame, LEN_SIZE + len))
}

#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
    #[error("decode error: {0}")]
    Decode(#[source] bincode::Error),
}

/// Build this device's beacon frame.
pub fn beacon(digest: [u8; 16], name: Option<String>, listen_port: u16) -> Frame {
    Frame::Beacon {
        protocol_version: PROTOCOL_VERSION,
        service: SERVICE_ID,
        vendor_id: VENDOR_ID,
        digest,
        name,
        listen_port,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn beacon_roundtrip() {
        let frame = beacon([7u8; 16], Some("basecamp".into()), 45711);
        let bytes = encode_frame(&frame).unwrap();
        let (decoded, consumed) = decode_frame(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        match decoded {
            Frame::Beacon {
                protocol_version,
                service,
                vendor_id,
                digest,
                name,
                listen_port,
            } => {
                assert_eq!(protocol_version, PROTOCOL_VERSION);
                assert_eq!(service, SERVICE_ID);
                assert_eq!(vendor_id, VENDOR_ID);
                assert_eq!(digest, [7u8; 16]);
                assert_eq!(name.as_deref(), Some("basecamp"));
                assert_eq!(listen_port, 45711);
            }
            other => panic!("expected Beacon, got {other:?}"),
        }
    }

    #[test]
    fn partial_buffer_needs_more() {
        let bytes = encode_frame(&Frame::Discover).unwrap();
        assert!(matches!(
            decode_frame(&bytes[..2]),
            Err(FrameDecodeError::NeedMore)
        ));
        assert!(matches!(
            decode_frame(&bytes[..LEN_SIZE]),
            Err(FrameDecodeError::NeedMore)
        ));
    }

    #[test]
    fn two_frames_back_to_back() {
        let a = encode_frame(&Frame::Write {
            payload: b"abc".to_vec(),
            fragment: true,
            response_needed: true,
        })
        .unwrap();
        let b = encode_frame(&Frame::Execute { commit: true }).unwrap();
        let mut buf = a.clone();
        buf.extend_from_slice(&b);
        let (first, n1) = decode_frame(&buf).unwrap();
        let (second, n2) = decode_frame(&buf[n1..]).unwrap();
        assert_eq!(n1 + n2, buf.len());
        assert!(matches!(first, Frame::Write { fragment: true, .. }));
        assert!(matches!(second, Frame::Execute { commit: true }));
    }

    #[test]
    fn oversize_length_rejected() {
        let mut buf = (MAX_FRAME_LEN + 1).to_le_bytes().to_vec();
        buf.extend_from_slice(&[0u8; 8]);
        assert!(matches!(
            decode_frame(&buf),
            Err(FrameDecodeError::TooLarge)
        ));
    }
}
