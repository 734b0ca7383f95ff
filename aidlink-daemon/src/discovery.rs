//! LAN discovery: UDP multicast beacons in, beacons out. The engine decides
//! whether a beacon goes out at all (advertising armed) and what to do with
//! each beacon heard (peer list merge, own-echo rejection).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use aidlink_core::link::{decode_frame, encode_frame, Frame};
use aidlink_core::{Engine, ScanResult, PROTOCOL_VERSION, SERVICE_ID, VENDOR_ID};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;

const MULTICAST_GROUP: &str = "239.255.71.18";
const BEACON_INTERVAL: Duration = Duration::from_secs(4);

pub async fn run_discovery(
    engine: Arc<Mutex<Engine>>,
    discovery_port: u16,
) -> std::io::Result<()> {
    let socket = Arc::new(make_multicast_socket(discovery_port).await?);

    let send_socket = socket.clone();
    let send_engine = engine.clone();
    let beacon_task =
        tokio::spawn(async move { beacon_loop(send_socket, send_engine, discovery_port).await });
    let recv_task = tokio::spawn(async move { recv_loop(socket, engine).await });

    let _ = tokio::try_join!(beacon_task, recv_task);
    Ok(())
}

async fn make_multicast_socket(discovery_port: u16) -> std::io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind(("0.0.0.0", discovery_port))?;
    let multicast: std::net::Ipv4Addr =
        MULTICAST_GROUP
            .parse()
            .map_err(|e: std::net::AddrParseError| {
                std::io::Error::new(std::io::ErrorKind::InvalidInput, e)
            })?;
    std_sock.join_multicast_v4(&multicast, &"0.0.0.0".parse().unwrap())?;
    std_sock.set_multicast_ttl_v4(1)?;
    std_sock.set_nonblocking(true)?;
    tokio::net::UdpSocket::from_std(std_sock)
}

/// Re-read the beacon from the engine every tick so stop_advertising takes
/// effect without tearing the task down.
async fn beacon_loop(
    socket: Arc<UdpSocket>,
    engine: Arc<Mutex<Engine>>,
    discovery_port: u16,
) -> std::io::Result<()> {
    let dest: SocketAddr = format!("{}:{}", MULTICAST_GROUP, discovery_port)
        .parse()
        .map_err(|e: std::net::AddrParseError| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, e)
        })?;
    loop {
        let beacon = engine.lock().await.beacon_frame();
        if let Some(frame) = beacon {
            match encode_frame(&frame) {
                Ok(bytes) => {
                    let _ = socket.send_to(&bytes, dest).await;
                }
                Err(e) => tracing::warn!("beacon encode failed: {e}"),
            }
        }
        tokio::time::sleep(BEACON_INTERVAL).await;
    }
}

async fn recv_loop(socket: Arc<UdpSocket>, engine: Arc<Mutex<Engine>>) -> std::io::Result<()> {
    let mut buf = vec![0u8; 65536];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((n, from)) => {
                let Ok((frame, _)) = decode_frame(&buf[..n]) else {
                    continue;
                };
                let Frame::Beacon {
                    protocol_version,
                    service,
                    vendor_id,
                    digest,
                    name,
                    listen_port,
                } = frame
                else {
                    continue;
                };
                if protocol_version != PROTOCOL_VERSION
                    || service != SERVICE_ID
                    || vendor_id != VENDOR_ID
                {
                    continue;
                }
                let result = ScanResult {
                    address: format!("{}:{}", from.ip(), listen_port),
                    digest: Some(digest),
                    name,
                };
                engine.lock().await.discovery_mut().handle_scan_result(result);
            }
            Err(e) => return Err(e),
        }
    }
}
