use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_GOING_AWAY: u16 = 1001;
pub const CLOSE_NO_STATUS: u16 = 1005;
pub const CLOSE_ABNORMAL: u16 = 1006;

/// How long the reader waits for the peer to echo our close frame.
const CLOSE_ECHO_GRACE: Duration = Duration::from_secs(2);

/// Normal closure and going-away are the only codes that suppress reconnection.
pub fn is_intentional_close(code: u16) -> bool {
    matches!(code, CLOSE_NORMAL | CLOSE_GOING_AWAY)
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("invalid channel url: {0}")]
    InvalidUrl(String),
    #[error("channel connect failed: {0}")]
    Connect(String),
    #[error("channel open timed out after {0:?}")]
    Timeout(Duration),
    #[error("channel is closed")]
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Message(String),
    Error(String),
    Closed { code: u16, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Close { code: u16, reason: String },
}

/// Write half of an open channel plus its transport ready-state.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    outbound: mpsc::UnboundedSender<Outbound>,
    open: Arc<AtomicBool>,
}

impl ChannelSink {
    pub fn new(outbound: mpsc::UnboundedSender<Outbound>, open: Arc<AtomicBool>) -> Self {
        Self { outbound, open }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.outbound.is_closed()
    }

    pub fn send_text(&self, text: String) -> Result<(), ChannelError> {
        if !self.is_open() {
            return Err(ChannelError::Closed);
        }
        self.outbound
            .send(Outbound::Text(text))
            .map_err(|_| ChannelError::Closed)
    }

    pub fn close(&self, code: u16, reason: &str) {
        self.open.store(false, Ordering::SeqCst);
        let _ = self.outbound.send(Outbound::Close {
            code,
            reason: reason.to_string(),
        });
    }
}

/// A freshly opened channel: the sink to write to and the ordered event feed.
#[derive(Debug)]
pub struct Channel {
    pub sink: ChannelSink,
    pub events: mpsc::UnboundedReceiver<ChannelEvent>,
}

/// Opens one duplex channel for a URL. The update client never touches a
/// socket directly, so tests substitute an in-memory implementation.
pub trait Connector: Send + Sync + 'static {
    fn open(&self, url: String) -> BoxFuture<'static, Result<Channel, ChannelError>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

impl Connector for WsConnector {
    fn open(&self, url: String) -> BoxFuture<'static, Result<Channel, ChannelError>> {
        Box::pin(async move {
            let (stream, _response) = tokio_tungstenite::connect_async(url.as_str())
                .await
                .map_err(|err| match err {
                    tungstenite::Error::Url(err) => ChannelError::InvalidUrl(err.to_string()),
                    tungstenite::Error::HttpFormat(err) => ChannelError::InvalidUrl(err.to_string()),
                    other => ChannelError::Connect(other.to_string()),
                })?;
            let (mut write, mut read) = stream.split();
            let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outbound>();
            let (evt_tx, evt_rx) = mpsc::unbounded_channel::<ChannelEvent>();
            let open = Arc::new(AtomicBool::new(true));
            let (writer_done_tx, mut writer_done) = oneshot::channel::<()>();

            let writer_open = open.clone();
            tokio::spawn(async move {
                while let Some(msg) = out_rx.recv().await {
                    match msg {
                        Outbound::Text(text) => {
                            if let Err(err) = write.send(Message::Text(text)).await {
                                tracing::debug!(error = %err, "channel write failed");
                                break;
                            }
                        }
                        Outbound::Close { code, reason } => {
                            let frame = CloseFrame {
                                code: CloseCode::from(code),
                                reason: reason.into(),
                            };
                            let _ = write.send(Message::Close(Some(frame))).await;
                            break;
                        }
                    }
                }
                writer_open.store(false, Ordering::SeqCst);
                let _ = writer_done_tx.send(());
            });

            let reader_open = open.clone();
            tokio::spawn(async move {
                let mut close = None;
                let mut echo_deadline: Option<Instant> = None;
                loop {
                    let item = tokio::select! {
                        item = read.next() => item,
                        _ = &mut writer_done, if echo_deadline.is_none() => {
                            echo_deadline = Some(Instant::now() + CLOSE_ECHO_GRACE);
                            continue;
                        }
                        _ = tokio::time::sleep_until(echo_deadline.unwrap_or_else(Instant::now)),
                            if echo_deadline.is_some() =>
                        {
                            tracing::debug!("peer never answered close");
                            break;
                        }
                        _ = evt_tx.closed() => break,
                    };
                    let Some(item) = item else { break };
                    match item {
                        Ok(Message::Text(text)) => {
                            if evt_tx.send(ChannelEvent::Message(text)).is_err() {
                                break;
                            }
                        }
                        Ok(Message::Close(frame)) => {
                            close = Some(match frame {
                                Some(frame) => (u16::from(frame.code), frame.reason.into_owned()),
                                None => (CLOSE_NO_STATUS, String::new()),
                            });
                            break;
                        }
                        Ok(Message::Binary(_)) => {
                            tracing::debug!("ignoring binary channel frame");
                        }
                        Ok(_) => {}
                        Err(err) => {
                            let _ = evt_tx.send(ChannelEvent::Error(err.to_string()));
                            break;
                        }
                    }
                }
                reader_open.store(false, Ordering::SeqCst);
                let (code, reason) = close.unwrap_or((CLOSE_ABNORMAL, String::new()));
                let _ = evt_tx.send(ChannelEvent::Closed { code, reason });
            });

            Ok(Channel {
                sink: ChannelSink::new(out_tx, open),
                events: evt_rx,
            })
        })
    }
}
