// Aidlink Linux daemon: multicast discovery, TCP write endpoint, durable
// message store with periodic retention, and a line-based control console.

mod config;
mod discovery;
mod transport;

use std::sync::Arc;
use std::time::Duration;

use aidlink_core::{Engine, GrantAll};
use anyhow::Context;
use tokio::io::AsyncBufReadExt;
use tokio::sync::Mutex;
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");
const RETENTION_SWEEP: Duration = Duration::from_secs(60 * 60);

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("aidlink-daemon {}", VERSION);
            return Ok(());
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cfg = config::load();
    std::fs::create_dir_all(&cfg.data_dir)
        .with_context(|| format!("creating data dir {}", cfg.data_dir.display()))?;

    let seed = machine_seed();
    let mut engine = Engine::new(
        &cfg.data_dir,
        seed,
        cfg.device_name.clone(),
        cfg.transport_port,
    );
    tracing::info!("device id {}", engine.local_id());
    let _ = engine.start(&GrantAll, &GrantAll);
    let engine = Arc::new(Mutex::new(engine));

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let disc_engine = engine.clone();
        let disc_port = cfg.discovery_port;
        let disc_task = tokio::spawn(async move {
            if let Err(e) = discovery::run_discovery(disc_engine, disc_port).await {
                tracing::error!("discovery stopped: {e}");
            }
        });
        let server_engine = engine.clone();
        let transport_port = cfg.transport_port;
        let server_task = tokio::spawn(async move {
            if let Err(e) = transport::run_server(server_engine, transport_port).await {
                tracing::error!("write endpoint stopped: {e}");
            }
        });
        let sweep_engine = engine.clone();
        let sweep_task = tokio::spawn(async move {
            retention_loop(sweep_engine).await;
        });
        let console_engine = engine.clone();
        let console_task = tokio::spawn(async move {
            console_loop(console_engine).await;
        });

        shutdown_signal().await?;
        tracing::info!("shutting down");
        disc_task.abort();
        server_task.abort();
        sweep_task.abort();
        console_task.abort();
        engine.lock().await.stop();
        Ok::<(), anyhow::Error>(())
    })?;
    Ok(())
}

/// Stable identity seed so the device id survives a wiped data dir.
fn machine_seed() -> Option<String> {
    std::fs::read_to_string("/etc/machine-id")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Hourly sweep: reading the store rewrites it without expired entries.
async fn retention_loop(engine: Arc<Mutex<Engine>>) {
    loop {
        tokio::time::sleep(RETENTION_SWEEP).await;
        engine.lock().await.prune_retained();
    }
}

/// Line commands on stdin: peers, messages, log,
/// send <addr> <text>, all <text>.
async fn console_loop(engine: Arc<Mutex<Engine>>) {
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        match line.split_once(' ') {
            None if line == "peers" => {
                for p in engine.lock().await.peers() {
                    let name = p.name.unwrap_or_default();
                    println!("{} {} {}", p.address, p.device_id_hex, name);
                }
            }
            None if line == "messages" => {
                for m in engine.lock().await.messages() {
                    println!("[{}] {}: {}", m.timestamp, m.from_id, m.text);
                }
            }
            None if line == "log" => {
                for e in engine.lock().await.events() {
                    println!("[{}] {:?}: {}", e.timestamp, e.event_type, e.message);
                }
            }
            Some(("send", rest)) => match rest.split_once(' ') {
                Some((addr, text)) if !text.trim().is_empty() => {
                    let ok = transport::run_send(&engine, addr, text.trim()).await;
                    println!("send to {addr}: {}", if ok { "ok" } else { "failed" });
                }
                _ => println!("usage: send <addr> <text>"),
            },
            Some(("all", text)) if !text.trim().is_empty() => {
                let (delivered, attempted) =
                    transport::run_broadcast(&engine, text.trim()).await;
                println!("broadcast: {delivered}/{attempted} delivered");
            }
            None if line.is_empty() => {}
            _ => println!("commands: peers | messages | log | send <addr> <text> | all <text>"),
        }
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
