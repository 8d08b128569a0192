//! ISP sidecar mock
//!
//! A minimal sidecar process speaking the protocol `IspClient` expects:
//! newline-delimited JSON envelopes, heartbeat echo, request/response
//! correlation by `id`, and a periodic stream of synthetic `data` frames.
//! Used by integration tests exercising the sidecar adapter end to end,
//! and by hand to poke at `IspClient`/`IspAdapterProxy` directly.
//!
//! # Usage
//! ```bash
//! ./isp-sidecar-mock --port 9400 --device d1 --key temperature
//! ```

use std::time::Duration;

use clap::Parser;
use rand::Rng;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "isp-sidecar-mock")]
#[command(about = "Minimal ISP sidecar for local testing")]
struct Args {
    /// TCP port to listen on.
    #[arg(long, default_value = "9400")]
    port: u16,

    /// Device id stamped on every generated data point.
    #[arg(long, default_value = "mock-device")]
    device: String,

    /// Point key stamped on every generated data point.
    #[arg(long, default_value = "value")]
    key: String,

    /// Milliseconds between generated data frames.
    #[arg(long, default_value = "500")]
    interval_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = Args::parse();
    let listener = TcpListener::bind(("127.0.0.1", args.port)).await?;
    info!(port = args.port, "isp-sidecar-mock listening");

    loop {
        let (socket, peer) = listener.accept().await?;
        info!(%peer, "accepted sidecar connection");
        let device = args.device.clone();
        let key = args.key.clone();
        let interval = Duration::from_millis(args.interval_ms);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(socket, device, key, interval).await {
                warn!(%peer, error = %e, "sidecar connection ended with error");
            }
        });
    }
}

async fn handle_connection(
    socket: TcpStream,
    device: String,
    key: String,
    interval: Duration,
) -> anyhow::Result<()> {
    use iot_gateway::isp::{IspMessage, MessageType};

    let (read_half, mut write_half) = tokio::io::split(socket);
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();

    let mut ticker = tokio::time::interval(interval);
    let mut rng = rand::thread_rng();

    loop {
        tokio::select! {
            read = reader.read_line(&mut line) => {
                let n = read?;
                if n == 0 {
                    info!("sidecar peer closed connection");
                    return Ok(());
                }
                let trimmed = line.trim().to_string();
                line.clear();
                if trimmed.is_empty() {
                    continue;
                }
                let incoming: IspMessage = match serde_json::from_str(&trimmed) {
                    Ok(m) => m,
                    Err(e) => {
                        warn!(error = %e, "malformed frame from peer, ignoring");
                        continue;
                    }
                };
                if let Some(reply) = respond_to(incoming) {
                    write_line(&mut write_half, &reply).await?;
                }
            }
            _ = ticker.tick() => {
                let point = serde_json::json!({
                    "points": [{
                        "key": key,
                        "source": device,
                        "value": rng.gen_range(0.0..100.0),
                        "type": "float",
                    }]
                });
                write_line(&mut write_half, &IspMessage::new(MessageType::Data, point)).await?;
            }
        }
    }
}

fn respond_to(msg: iot_gateway::isp::IspMessage) -> Option<iot_gateway::isp::IspMessage> {
    use iot_gateway::isp::{IspMessage, MessageType};

    match msg.kind {
        MessageType::Heartbeat => Some(IspMessage::heartbeat()),
        MessageType::Config | MessageType::MetricsRequest => msg
            .id
            .map(|id| IspMessage::response_to(id, serde_json::json!({"ok": true}))),
        MessageType::Response | MessageType::Data | MessageType::Status => None,
    }
}

async fn write_line<W: tokio::io::AsyncWrite + Unpin>(
    w: &mut W,
    msg: &iot_gateway::isp::IspMessage,
) -> anyhow::Result<()> {
    let mut out = serde_json::to_string(msg)?;
    out.push('\n');
    w.write_all(out.as_bytes()).await?;
    w.flush().await?;
    Ok(())
}
