//! Duplex WebSocket channel carrying binary audio frames and JSON text
//! frames between the client and the interview service.
//!
//! The link connects exactly once. There is no reconnection or backoff: a
//! transport failure surfaces as a single `Closed` event and the caller must
//! explicitly reconnect. The channel endpoint and bearer token are issued by
//! the platform before this engine is invoked.

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};

use crate::error::EngineError;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use url::Url;

/// Events the link delivers to the controller, in arrival order. The
/// transport guarantees ordered, reliable delivery; the playback path
/// depends on that.
#[derive(Debug)]
pub enum NetEvent {
    Opened,
    Text(String),
    Binary(Vec<u8>),
    Closed(String),
}

/// Commands the controller sends to the link.
#[derive(Debug)]
pub enum NetCommand {
    SendText(String),
    SendBinary(Vec<u8>),
    Close,
}

pub struct ChannelLink {
    url: String,
    token: Option<String>,
    tx: mpsc::Sender<NetEvent>,
    rx_cmd: mpsc::Receiver<NetCommand>,
}

impl ChannelLink {
    pub fn new(
        url: String,
        token: Option<String>,
        tx: mpsc::Sender<NetEvent>,
        rx_cmd: mpsc::Receiver<NetCommand>,
    ) -> Self {
        Self {
            url,
            token,
            tx,
            rx_cmd,
        }
    }

    /// Connect and pump the channel until it closes. Always ends with
    /// exactly one `Closed` event.
    pub async fn run(mut self) {
        let reason = match self.connect_and_loop().await {
            Ok(()) => "closed".to_string(),
            Err(e) => EngineError::Transport(e.to_string()).to_string(),
        };
        let _ = self.tx.send(NetEvent::Closed(reason)).await;
    }

    async fn connect_and_loop(&mut self) -> Result<()> {
        let url = Url::parse(&self.url)?;
        let host = url.host_str().unwrap_or_default().to_string();

        let mut request = tokio_tungstenite::tungstenite::http::Request::builder()
            .method("GET")
            .uri(self.url.as_str())
            .header("Host", host)
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .header("Sec-WebSocket-Version", "13")
            .header(
                "Sec-WebSocket-Key",
                tokio_tungstenite::tungstenite::handshake::client::generate_key(),
            );
        if let Some(token) = &self.token {
            request = request.header("Authorization", format!("Bearer {}", token));
        }
        let request = request.body(())?;

        log::info!("Connecting to {}...", self.url);
        let (ws_stream, _) = connect_async(request).await?;
        log::info!("Channel open");

        let (mut write, mut read) = ws_stream.split();

        self.tx.send(NetEvent::Opened).await?;

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            self.tx.send(NetEvent::Text(text.to_string())).await?;
                        }
                        Some(Ok(Message::Binary(data))) => {
                            self.tx.send(NetEvent::Binary(data.to_vec())).await?;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            log::info!("Server closed channel: {:?}", frame);
                            return Ok(());
                        }
                        Some(Ok(_)) => {} // Ping/Pong handled by tungstenite
                        Some(Err(e)) => return Err(e.into()),
                        None => return Ok(()),
                    }
                }
                cmd = self.rx_cmd.recv() => {
                    match cmd {
                        Some(NetCommand::SendText(text)) => {
                            write.send(Message::Text(text.into())).await?;
                        }
                        Some(NetCommand::SendBinary(data)) => {
                            write.send(Message::Binary(data.into())).await?;
                        }
                        Some(NetCommand::Close) | None => {
                            let _ = write.send(Message::Close(None)).await;
                            return Ok(());
                        }
                    }
                }
            }
        }
    }
}
