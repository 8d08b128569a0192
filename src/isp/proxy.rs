//! ISP adapter/sink proxy: owns an [`IspClient`], polls `is_connected` every
//! 5s, and reconnects with a fresh client on failure, replaying the last
//! `config` message before re-registering the data handler. Back-off
//! between failed reconnects is 10s (§4.B).

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::client::{IspClient, IspError};
use super::message::IspMessage;

const POLL_INTERVAL: Duration = Duration::from_secs(5);
const RECONNECT_BACKOFF: Duration = Duration::from_secs(10);

pub struct IspAdapterProxy {
    host: String,
    port: u16,
    client: Arc<tokio::sync::Mutex<IspClient>>,
    last_config: Arc<Mutex<Option<IspMessage>>>,
    data_tx: mpsc::Sender<IspMessage>,
}

impl IspAdapterProxy {
    pub async fn connect(
        host: impl Into<String>,
        port: u16,
        data_tx: mpsc::Sender<IspMessage>,
    ) -> Result<Self, IspError> {
        let host = host.into();
        let mut client = IspClient::new(host.clone(), port);
        client.connect().await?;

        let proxy = Self {
            host,
            port,
            client: Arc::new(tokio::sync::Mutex::new(client)),
            last_config: Arc::new(Mutex::new(None)),
            data_tx,
        };
        proxy.install_handler().await;
        Ok(proxy)
    }

    async fn install_handler(&self) {
        let tx = self.data_tx.clone();
        let client = self.client.lock().await;
        client.set_data_handler(move |msg| {
            let tx = tx.clone();
            tokio::spawn(async move {
                let _ = tx.send(msg).await;
            });
        });
    }

    /// Send (and remember) a config message so it can be replayed after a
    /// reconnect.
    pub async fn send_config(&self, config: IspMessage) -> Result<(), IspError> {
        *self.last_config.lock() = Some(config.clone());
        self.client.lock().await.send_message(&config).await
    }

    pub async fn send_request(
        &self,
        msg: IspMessage,
        timeout: Duration,
    ) -> Result<IspMessage, IspError> {
        self.client.lock().await.send_request(msg, timeout).await
    }

    /// Spawn the supervision loop: polls connection health every 5s and
    /// reconnects with a fresh client on failure, replaying the last config
    /// message before re-registering the data handler.
    pub fn spawn_supervisor(self: &Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(POLL_INTERVAL) => {}
                }

                let connected = this.client.lock().await.is_connected();
                if connected {
                    continue;
                }

                tracing::warn!(host = %this.host, port = this.port, "ISP adapter proxy detected disconnect, reconnecting");
                loop {
                    if cancel.is_cancelled() {
                        return;
                    }
                    let mut fresh = IspClient::new(this.host.clone(), this.port);
                    match fresh.connect().await {
                        Ok(()) => {
                            *this.client.lock().await = fresh;
                            if let Some(cfg) = this.last_config.lock().clone() {
                                if let Err(e) = this.client.lock().await.send_message(&cfg).await {
                                    tracing::warn!(error = %e, "failed to replay config after reconnect");
                                }
                            }
                            this.install_handler().await;
                            tracing::info!(host = %this.host, port = this.port, "ISP adapter proxy reconnected");
                            break;
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "ISP reconnect attempt failed, backing off 10s");
                            tokio::select! {
                                _ = cancel.cancelled() => return,
                                _ = tokio::time::sleep(RECONNECT_BACKOFF) => {}
                            }
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isp::message::MessageType;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn proxy_connects_and_installs_handler() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = tokio::io::split(socket);
            let mut reader = BufReader::new(read_half);
            let mut line = String::new();
            let _ = reader.read_line(&mut line).await;
            let data = IspMessage::new(MessageType::Data, serde_json::json!({"points": []}));
            let mut out = serde_json::to_string(&data).unwrap();
            out.push('\n');
            let _ = write_half.write_all(out.as_bytes()).await;
        });

        let (tx, mut rx) = mpsc::channel(8);
        let proxy = IspAdapterProxy::connect(addr.ip().to_string(), addr.port(), tx)
            .await
            .unwrap();
        proxy
            .send_config(IspMessage::new(MessageType::Config, serde_json::json!({})))
            .await
            .unwrap();

        let received = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.kind, MessageType::Data);
    }
}
