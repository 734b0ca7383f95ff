//! Message transport over TCP: the inbound write endpoint, and the outbound
//! side that drives a core send pipeline across one connection per attempt.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use aidlink_core::{
    decode_frame, encode_frame, Engine, EndpointProps, Frame, GrantAll, NoLocation, SendAction,
    SendEvent, WriteKind, WriteStatus, BROADCAST_DELAY_MS, CHARACTERISTIC_MESSAGE_ID,
    MAX_FRAME_LEN, REQUESTED_MTU, SERVICE_ID,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const IO_TIMEOUT: Duration = Duration::from_secs(5);

/// Accept loop for the write endpoint. One task per connection; the session
/// key is the remote socket address.
pub async fn run_server(engine: Arc<Mutex<Engine>>, transport_port: u16) -> io::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", transport_port)).await?;
    tracing::info!("write endpoint listening on port {transport_port}");
    loop {
        let (stream, addr) = listener.accept().await?;
        let engine = engine.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_session(stream, addr, engine).await {
                tracing::debug!("session {addr} ended: {e}");
            }
        });
    }
}

async fn serve_session(
    mut stream: TcpStream,
    addr: SocketAddr,
    engine: Arc<Mutex<Engine>>,
) -> io::Result<()> {
    let session = addr.to_string();
    engine.lock().await.server_mut().on_connect(&session);
    let result = session_loop(&mut stream, &session, &engine).await;
    // Whatever ended the session, the prepared buffer must not linger.
    engine.lock().await.server_mut().on_disconnect(&session);
    result
}

async fn session_loop(
    stream: &mut TcpStream,
    session: &str,
    engine: &Arc<Mutex<Engine>>,
) -> io::Result<()> {
    loop {
        let Some(frame) = read_frame(stream).await? else {
            return Ok(());
        };
        match frame {
            Frame::MtuRequest { mtu } => {
                let granted = mtu.min(REQUESTED_MTU);
                write_frame(stream, &Frame::MtuResponse { mtu: granted }).await?;
            }
            Frame::Discover => {
                write_frame(
                    stream,
                    &Frame::ServiceInfo {
                        service: SERVICE_ID,
                        characteristic: CHARACTERISTIC_MESSAGE_ID,
                        supports_ack: true,
                        supports_unacked: true,
                    },
                )
                .await?;
            }
            Frame::Write {
                payload,
                fragment,
                response_needed,
            } => {
                let ok = engine
                    .lock()
                    .await
                    .server_mut()
                    .on_write(session, &payload, fragment);
                if response_needed {
                    write_frame(stream, &Frame::Ack { ok }).await?;
                }
            }
            Frame::Execute { commit } => {
                let ok = engine.lock().await.server_mut().on_execute(session, commit);
                write_frame(stream, &Frame::Ack { ok }).await?;
            }
            other => {
                tracing::debug!("ignoring unexpected frame from {session}: {other:?}");
            }
        }
    }
}

/// One complete send attempt: connect, then translate pipeline actions to
/// frames and radio outcomes back to pipeline events until it completes.
pub async fn run_send(engine: &Arc<Mutex<Engine>>, address: &str, text: &str) -> bool {
    let pipeline = engine
        .lock()
        .await
        .new_send(address, text, &GrantAll, &NoLocation);
    let Some(mut pipeline) = pipeline else {
        return false;
    };

    let mut stream = None;
    let first = match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(address)).await {
        Ok(Ok(s)) => {
            stream = Some(s);
            SendEvent::Connected
        }
        Ok(Err(e)) => SendEvent::ConnectFailed(e.to_string()),
        Err(_) => SendEvent::ConnectFailed("connect timed out".to_string()),
    };

    let mut actions: VecDeque<SendAction> = pipeline.on_event(first).into();
    let mut delivered = false;
    while let Some(action) = actions.pop_front() {
        match action {
            SendAction::Complete(ok) => delivered = ok,
            SendAction::Disconnect => {
                // Dropping the stream closes the connection.
                stream = None;
            }
            SendAction::NegotiateMtu(mtu) => {
                let event = match stream.as_mut() {
                    Some(s) => match exchange(s, &Frame::MtuRequest { mtu }).await {
                        Ok(Frame::MtuResponse { mtu }) => SendEvent::MtuChanged(mtu),
                        Ok(_) => SendEvent::MtuFailed,
                        Err(_) => SendEvent::Disconnected,
                    },
                    None => SendEvent::Disconnected,
                };
                actions.extend(pipeline.on_event(event));
            }
            SendAction::Discover => {
                let event = match stream.as_mut() {
                    Some(s) => match exchange(s, &Frame::Discover).await {
                        Ok(Frame::ServiceInfo {
                            service,
                            characteristic,
                            supports_ack,
                            supports_unacked,
                        }) if service == SERVICE_ID
                            && characteristic == CHARACTERISTIC_MESSAGE_ID =>
                        {
                            SendEvent::Discovered(EndpointProps {
                                supports_ack,
                                supports_unacked,
                            })
                        }
                        Ok(_) => SendEvent::ServiceNotFound,
                        Err(_) => SendEvent::Disconnected,
                    },
                    None => SendEvent::Disconnected,
                };
                actions.extend(pipeline.on_event(event));
            }
            SendAction::Write {
                payload,
                kind,
                fragment,
            } => {
                let response_needed = kind == WriteKind::Acknowledged;
                let frame = Frame::Write {
                    payload,
                    fragment,
                    response_needed,
                };
                let event = match stream.as_mut() {
                    Some(s) if response_needed => match exchange(s, &frame).await {
                        Ok(Frame::Ack { ok: true }) => SendEvent::WriteAck(WriteStatus::Success),
                        Ok(Frame::Ack { ok: false }) => {
                            SendEvent::WriteAck(WriteStatus::Rejected)
                        }
                        Ok(_) => SendEvent::WriteAck(WriteStatus::Rejected),
                        Err(_) => SendEvent::Disconnected,
                    },
                    Some(s) => match write_frame(s, &frame).await {
                        Ok(()) => SendEvent::WriteAck(WriteStatus::Success),
                        Err(_) => SendEvent::Disconnected,
                    },
                    None => SendEvent::Disconnected,
                };
                actions.extend(pipeline.on_event(event));
            }
            SendAction::Execute { commit } => {
                let event = match stream.as_mut() {
                    Some(s) => match exchange(s, &Frame::Execute { commit }).await {
                        Ok(Frame::Ack { ok: true }) => SendEvent::WriteAck(WriteStatus::Success),
                        Ok(_) => SendEvent::WriteAck(WriteStatus::Rejected),
                        Err(_) => SendEvent::Disconnected,
                    },
                    None => SendEvent::Disconnected,
                };
                actions.extend(pipeline.on_event(event));
            }
        }
    }
    delivered
}

/// Send to every known peer in turn, pausing between attempts so nearby
/// radios get air time. Returns `(delivered, attempted)`.
pub async fn run_broadcast(engine: &Arc<Mutex<Engine>>, text: &str) -> (usize, usize) {
    let mut plan = {
        let e = engine.lock().await;
        let addrs: Vec<String> = e.peers().into_iter().map(|p| p.address).collect();
        e.broadcast(addrs)
    };
    let total = plan.total();
    let mut delivered = 0usize;
    while let Some(addr) = plan.next_target().map(str::to_string) {
        if run_send(engine, &addr, text).await {
            delivered += 1;
        }
        let (done, total) = plan.record_attempt();
        tracing::info!("broadcast progress: {done}/{total}");
        if done < total {
            tokio::time::sleep(Duration::from_millis(BROADCAST_DELAY_MS)).await;
        }
    }
    (delivered, total)
}

async fn write_frame(stream: &mut TcpStream, frame: &Frame) -> io::Result<()> {
    let bytes =
        encode_frame(frame).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    stream.write_all(&bytes).await
}

/// Read one length-prefixed frame. `Ok(None)` on clean EOF before a frame.
async fn read_frame(stream: &mut TcpStream) -> io::Result<Option<Frame>> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_le_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "frame too large"));
    }
    let mut framed = vec![0u8; 4 + len as usize];
    framed[..4].copy_from_slice(&len_buf);
    stream.read_exact(&mut framed[4..]).await?;
    let (frame, _) =
        decode_frame(&framed).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(Some(frame))
}

async fn exchange(stream: &mut TcpStream, frame: &Frame) -> io::Result<Frame> {
    tokio::time::timeout(IO_TIMEOUT, write_frame(stream, frame))
        .await
        .map_err(|_| timed_out())??;
    match tokio::time::timeout(IO_TIMEOUT, read_frame(stream))
        .await
        .map_err(|_| timed_out())??
    {
        Some(f) => Ok(f),
        None => Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed mid-exchange",
        )),
    }
}

fn timed_out() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "frame exchange timed out")
}
