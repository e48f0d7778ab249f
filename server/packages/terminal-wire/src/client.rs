use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;

use crate::frame::{handshake_message, TerminalFrame, TerminalSize};
use crate::keys::key_bytes;

const DEFAULT_SUBPROTOCOL: &str = "tty";
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const OUTPUT_BUFFER: usize = 256;

#[derive(Debug, Clone)]
pub struct TerminalClientConfig {
    pub size: TerminalSize,
    pub auth_token: Option<String>,
    /// Sent as `Sec-WebSocket-Protocol`. `None` omits the header.
    pub subprotocol: Option<String>,
    pub send_handshake: bool,
    pub connect_timeout: Duration,
}

impl Default for TerminalClientConfig {
    fn default() -> Self {
        Self {
            size: TerminalSize::default(),
            auth_token: None,
            subprotocol: Some(DEFAULT_SUBPROTOCOL.to_string()),
            send_handshake: true,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("invalid terminal url `{url}`: {message}")]
    InvalidUrl { url: String, message: String },
    #[error("timed out connecting to {url}")]
    Timeout { url: String },
    #[error("websocket handshake failed: {0}")]
    Handshake(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Returned by send operations when the frame was not queued.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum SendError {
    #[error("terminal socket is not open")]
    NotOpen,
}

#[derive(Debug)]
enum Outbound {
    Frame(Vec<u8>),
    Close,
}

/// Inbound terminal output, handed off untouched.
///
/// Holds up to 256 chunks. Output arriving while the buffer is full is
/// dropped so the socket keeps being read and a remote close is noticed.
#[derive(Debug)]
pub struct TerminalOutput {
    rx: mpsc::Receiver<Bytes>,
}

impl TerminalOutput {
    /// Next chunk of output, or `None` once the socket has closed.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }
}

/// A persistent socket to one terminal session.
///
/// Sends never retry: a frame that cannot be queued is reported to the caller
/// and dropped, since replaying input can run a command twice.
#[derive(Debug)]
pub struct TerminalClient {
    outbound: mpsc::UnboundedSender<Outbound>,
    open: Arc<AtomicBool>,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
}

impl TerminalClient {
    pub async fn connect(
        url: &str,
        config: TerminalClientConfig,
    ) -> Result<(Self, TerminalOutput), ConnectError> {
        let mut request = url
            .into_client_request()
            .map_err(|err| ConnectError::InvalidUrl {
                url: url.to_string(),
                message: err.to_string(),
            })?;
        if let Some(protocol) = config.subprotocol.as_deref() {
            let value = HeaderValue::from_str(protocol).map_err(|err| ConnectError::InvalidUrl {
                url: url.to_string(),
                message: err.to_string(),
            })?;
            request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
        }

        let (stream, _response) =
            tokio::time::timeout(config.connect_timeout, tokio_tungstenite::connect_async(request))
                .await
                .map_err(|_| ConnectError::Timeout {
                    url: url.to_string(),
                })??;
        tracing::debug!(url, "terminal socket connected");

        let (mut sink, mut source) = stream.split();
        if config.send_handshake {
            let handshake = handshake_message(config.auth_token.as_deref(), config.size);
            sink.send(Message::Binary(handshake)).await?;
        }

        let open = Arc::new(AtomicBool::new(true));
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Outbound>();
        let (output_tx, output_rx) = mpsc::channel::<Bytes>(OUTPUT_BUFFER);

        let writer_open = open.clone();
        let writer = tokio::spawn(async move {
            while let Some(outbound) = outbound_rx.recv().await {
                match outbound {
                    Outbound::Frame(bytes) => {
                        if let Err(err) = sink.send(Message::Binary(bytes)).await {
                            tracing::warn!(error = %err, "terminal frame write failed");
                            break;
                        }
                    }
                    Outbound::Close => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            writer_open.store(false, Ordering::SeqCst);
        });

        let reader_open = open.clone();
        let reader = tokio::spawn(async move {
            let mut dropped = 0usize;
            while let Some(message) = source.next().await {
                let chunk = match message {
                    Ok(Message::Binary(bytes)) => Bytes::from(bytes),
                    Ok(Message::Text(text)) => Bytes::from(text.into_bytes()),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        tracing::debug!(error = %err, "terminal socket read ended");
                        break;
                    }
                };
                match output_tx.try_send(chunk) {
                    Ok(()) if dropped > 0 => {
                        tracing::debug!(dropped, "terminal output buffer drained");
                        dropped = 0;
                    }
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        if dropped == 0 {
                            tracing::warn!("terminal output buffer full; dropping output");
                        }
                        dropped += 1;
                    }
                    // Nobody is reading output; keep the socket open for input.
                    Err(TrySendError::Closed(_)) => {}
                }
            }
            reader_open.store(false, Ordering::SeqCst);
        });

        Ok((
            Self {
                outbound: outbound_tx,
                open,
                writer,
                reader,
            },
            TerminalOutput { rx: output_rx },
        ))
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.outbound.is_closed()
    }

    pub fn send_frame(&self, frame: &TerminalFrame) -> Result<(), SendError> {
        if !self.is_open() {
            return Err(SendError::NotOpen);
        }
        self.outbound
            .send(Outbound::Frame(frame.encode()))
            .map_err(|_| SendError::NotOpen)
    }

    /// Sends `text` as typed. Nothing is appended.
    pub fn send_text(&self, text: &str) -> Result<(), SendError> {
        self.send_frame(&TerminalFrame::input(text))
    }

    /// Types `command` followed by a carriage return.
    pub fn execute(&self, command: &str) -> Result<(), SendError> {
        let mut line = command.trim_end_matches(['\r', '\n']).to_string();
        line.push('\r');
        self.send_frame(&TerminalFrame::input(line))
    }

    /// Inserts `text` at the prompt without running it.
    pub fn paste(&self, text: &str) -> Result<(), SendError> {
        self.send_text(text.trim_end_matches(['\r', '\n']))
    }

    pub fn send_key(&self, name: &str) -> Result<(), SendError> {
        self.send_frame(&TerminalFrame::Input(key_bytes(name).into_owned()))
    }

    pub fn resize(&self, columns: u16, rows: u16) -> Result<(), SendError> {
        self.send_frame(&TerminalFrame::resize(columns, rows))
    }

    /// Sends a close frame and waits for the writer to finish.
    pub async fn close(mut self) {
        let _ = self.outbound.send(Outbound::Close);
        let _ = (&mut self.writer).await;
        self.reader.abort();
        self.open.store(false, Ordering::SeqCst);
    }
}

impl Drop for TerminalClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
