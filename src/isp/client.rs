//! ISP client (§4.B): a long-lived TCP client speaking newline-delimited
//! JSON with a sidecar process.
//!
//! Mirrors the teacher's `WitsClient` (`acquisition/wits_parser.rs`): a
//! connect/reconnect state machine around a buffered `TcpStream`, except
//! here the framing is generic ISP envelopes rather than WITS Level 0
//! records, and replies are correlated by `id` rather than read as a single
//! blocking stream.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::oneshot;

use super::message::{IspMessage, MessageType};

#[derive(Error, Debug)]
pub enum IspError {
    #[error("not connected")]
    NotConnected,
    #[error("connect failed: {0}")]
    ConnectFailed(String),
    #[error("write failed: {0}")]
    WriteFailed(String),
    #[error("request timed out")]
    Timeout,
    #[error("client closed")]
    ClientClosed,
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const READ_TIMEOUT: Duration = Duration::from_secs(10);

type DataHandler = Arc<dyn Fn(IspMessage) + Send + Sync>;
type WriteHalf = tokio::io::WriteHalf<TcpStream>;

/// One-shot reply correlation table, keyed by request id.
type PendingTable = Arc<Mutex<HashMap<String, oneshot::Sender<IspMessage>>>>;

pub struct IspClient {
    host: String,
    port: u16,
    connected: Arc<AtomicBool>,
    writer: Arc<tokio::sync::Mutex<Option<WriteHalf>>>,
    pending: PendingTable,
    data_handler: Arc<Mutex<Option<DataHandler>>>,
    recv_task: Option<tokio::task::JoinHandle<()>>,
}

impl IspClient {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            connected: Arc::new(AtomicBool::new(false)),
            writer: Arc::new(tokio::sync::Mutex::new(None)),
            pending: Arc::new(Mutex::new(HashMap::new())),
            data_handler: Arc::new(Mutex::new(None)),
            recv_task: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn set_data_handler<F>(&self, handler: F)
    where
        F: Fn(IspMessage) + Send + Sync + 'static,
    {
        *self.data_handler.lock() = Some(Arc::new(handler));
    }

    /// Dials within 10s. Idempotent — calling while already connected is a
    /// no-op. Starts the receive loop.
    pub async fn connect(&mut self) -> Result<(), IspError> {
        if self.is_connected() {
            return Ok(());
        }

        let addr = format!("{}:{}", self.host, self.port);
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr))
            .await
            .map_err(|_| IspError::ConnectFailed("connect timed out".into()))?
            .map_err(|e| IspError::ConnectFailed(e.to_string()))?;

        let (read_half, write_half) = tokio::io::split(stream);
        *self.writer.lock().await = Some(write_half);
        self.connected.store(true, Ordering::Release);

        let connected = self.connected.clone();
        let pending = self.pending.clone();
        let data_handler = self.data_handler.clone();
        let writer = self.writer.clone();

        let handle = tokio::spawn(async move {
            run_receive_loop(read_half, connected, pending, data_handler, writer).await;
        });
        self.recv_task = Some(handle);

        tracing::info!(address = %addr, "ISP client connected");
        Ok(())
    }

    /// Closes the socket, fails in-flight requests with `ClientClosed`, and
    /// clears the response table.
    pub async fn disconnect(&mut self) {
        if let Some(task) = self.recv_task.take() {
            task.abort();
        }
        self.connected.store(false, Ordering::Release);
        if let Some(mut w) = self.writer.lock().await.take() {
            let _ = w.shutdown().await;
        }

        let mut pending = self.pending.lock();
        pending.clear(); // dropping senders fails receivers with RecvError
        tracing::info!("ISP client disconnected");
    }

    /// Serializes and writes one frame.
    pub async fn send_message(&self, msg: &IspMessage) -> Result<(), IspError> {
        if !self.is_connected() {
            return Err(IspError::NotConnected);
        }
        let mut line = serde_json::to_string(msg)?;
        line.push('\n');

        let mut guard = self.writer.lock().await;
        let Some(w) = guard.as_mut() else {
            return Err(IspError::NotConnected);
        };
        w.write_all(line.as_bytes())
            .await
            .map_err(|e| IspError::WriteFailed(e.to_string()))?;
        w.flush()
            .await
            .map_err(|e| IspError::WriteFailed(e.to_string()))?;
        Ok(())
    }

    /// Registers a one-shot reply channel keyed by `msg.id` (which must be
    /// non-empty), sends the message, and waits for the matching response,
    /// `timeout`, or client-closed.
    pub async fn send_request(
        &self,
        msg: IspMessage,
        timeout: Duration,
    ) -> Result<IspMessage, IspError> {
        let id = msg
            .id
            .clone()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| IspError::WriteFailed("request id must be non-empty".into()))?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id.clone(), tx);

        if let Err(e) = self.send_message(&msg).await {
            self.pending.lock().remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(IspError::ClientClosed),
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(IspError::Timeout)
            }
        }
    }
}

/// Reads frames with a 10s read deadline (timeouts loop without logging);
/// dispatches by `type`.
async fn run_receive_loop(
    read_half: tokio::io::ReadHalf<TcpStream>,
    connected: Arc<AtomicBool>,
    pending: PendingTable,
    data_handler: Arc<Mutex<Option<DataHandler>>>,
    writer: Arc<tokio::sync::Mutex<Option<WriteHalf>>>,
) {
    let mut reader = BufReader::new(read_half);
    let mut line = String::with_capacity(256);

    loop {
        line.clear();
        let read = tokio::time::timeout(READ_TIMEOUT, reader.read_line(&mut line)).await;

        let bytes = match read {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "ISP read error, marking connection down");
                connected.store(false, Ordering::Release);
                return;
            }
            Err(_) => {
                // Read timeout: loop without logging, per spec.
                continue;
            }
        };

        if bytes == 0 {
            tracing::info!("ISP connection closed by peer");
            connected.store(false, Ordering::Release);
            return;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let msg: IspMessage = match serde_json::from_str(trimmed) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(error = %e, "ISP malformed frame, dropping");
                continue;
            }
        };

        match msg.kind {
            MessageType::Response => {
                if let Some(id) = &msg.id {
                    if let Some(tx) = pending.lock().remove(id) {
                        let _ = tx.send(msg);
                    }
                    // else: no registrant, drop.
                }
            }
            MessageType::Data => {
                let handler = data_handler.lock().clone();
                if let Some(handler) = handler {
                    tokio::spawn(async move {
                        handler(msg);
                    });
                }
            }
            MessageType::Heartbeat => {
                let mut out = match serde_json::to_string(&IspMessage::heartbeat()) {
                    Ok(s) => s,
                    Err(_) => continue,
                };
                out.push('\n');
                let mut guard = writer.lock().await;
                if let Some(w) = guard.as_mut() {
                    // Heartbeat replies are silent even on failure; the next
                    // read on this connection will surface any real fault.
                    let _ = w.write_all(out.as_bytes()).await;
                    let _ = w.flush().await;
                }
            }
            _ => {
                tracing::warn!(kind = ?msg.kind, "ISP unknown/unsolicited message type");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::net::TcpListener;

    async fn spawn_echo_sidecar() -> (std::net::SocketAddr, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = tokio::io::split(socket);
            let mut reader = BufReader::new(read_half);
            let mut line = String::new();
            loop {
                line.clear();
                let n = reader.read_line(&mut line).await.unwrap_or(0);
                if n == 0 {
                    break;
                }
                let req: IspMessage = serde_json::from_str(line.trim()).unwrap();
                if req.kind == MessageType::Heartbeat {
                    continue;
                }
                let resp = IspMessage::response_to(
                    req.id.clone().unwrap_or_default(),
                    json!({"echo": req.payload}),
                );
                let mut out = serde_json::to_string(&resp).unwrap();
                out.push('\n');
                write_half.write_all(out.as_bytes()).await.unwrap();
            }
        });
        (addr, handle)
    }

    #[tokio::test]
    async fn request_response_correlation() {
        let (addr, _server) = spawn_echo_sidecar().await;
        let mut client = IspClient::new(addr.ip().to_string(), addr.port());
        client.connect().await.unwrap();

        let req = IspMessage::new(MessageType::Config, json!({"k": "v"})).with_id("req-1");
        let resp = client
            .send_request(req, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(resp.id.as_deref(), Some("req-1"));
        assert_eq!(resp.payload["echo"]["k"], "v");

        client.disconnect().await;
    }

    #[tokio::test]
    async fn request_without_id_rejected() {
        let client = IspClient::new("127.0.0.1", 1);
        let req = IspMessage::new(MessageType::Config, json!({}));
        let err = client
            .send_request(req, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, IspError::WriteFailed(_)));
    }

    #[tokio::test]
    async fn send_before_connect_fails() {
        let client = IspClient::new("127.0.0.1", 1);
        let msg = IspMessage::heartbeat();
        let err = client.send_message(&msg).await.unwrap_err();
        assert!(matches!(err, IspError::NotConnected));
    }
}
