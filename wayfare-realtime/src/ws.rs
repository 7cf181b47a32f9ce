//! WebSocket change feed with reconnect backoff.
//!
//! Each channel runs one task that connects, subscribes to its table and
//! forwards `change` frames to the sink. Lost connections are retried with
//! jittered exponential backoff until the channel is closed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use wayfare_core::{ChannelError, LiveSettings, ReconnectConfig, Row};

use crate::feed::{ChangeFeed, ChannelHandle, EventSink, RowEvent, RowEventKind};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ClientFrame<'a> {
    Subscribe { table: &'a str },
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ServerFrame {
    Change {
        table: String,
        event: RowEventKind,
        #[serde(default)]
        new: Option<Row>,
        #[serde(default)]
        old: Option<Row>,
    },
    #[serde(other)]
    Other,
}

/// Decode one text frame. Frames other than `change` yield `None`.
pub fn decode_frame(text: &str) -> Result<Option<RowEvent>, ChannelError> {
    let frame: ServerFrame = serde_json::from_str(text).map_err(|e| ChannelError::Protocol {
        reason: e.to_string(),
    })?;
    Ok(match frame {
        ServerFrame::Change {
            table,
            event,
            new,
            old,
        } => Some(RowEvent {
            table,
            kind: event,
            new,
            old,
        }),
        ServerFrame::Other => None,
    })
}

/// Encode the subscribe frame for `table`.
pub fn subscribe_frame(table: &str) -> String {
    serde_json::to_string(&ClientFrame::Subscribe { table }).unwrap_or_default()
}

/// [`ChangeFeed`] over a realtime WebSocket endpoint.
#[derive(Debug, Clone)]
pub struct WsChangeFeed {
    endpoint: String,
    api_key: Option<String>,
    reconnect: ReconnectConfig,
}

impl WsChangeFeed {
    pub fn new(settings: &LiveSettings, api_key: Option<String>) -> Self {
        Self {
            endpoint: settings.ws_endpoint.clone(),
            api_key,
            reconnect: settings.reconnect.clone(),
        }
    }

    pub fn reconnect_config(&self) -> &ReconnectConfig {
        &self.reconnect
    }

    async fn connect(&self, table: &str) -> Result<WsStream, ChannelError> {
        let connect_err = |reason: String| ChannelError::Connect {
            table: table.to_string(),
            reason,
        };

        // Carries the upgrade headers and a fresh Sec-WebSocket-Key.
        let mut request = self
            .endpoint
            .as_str()
            .into_client_request()
            .map_err(|e| connect_err(e.to_string()))?;
        if let Some(api_key) = &self.api_key {
            let value = HeaderValue::from_str(api_key).map_err(|e| connect_err(e.to_string()))?;
            request.headers_mut().insert("apikey", value);
        }
        let (mut stream, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| connect_err(e.to_string()))?;
        stream
            .send(Message::Text(subscribe_frame(table)))
            .await
            .map_err(|e| connect_err(e.to_string()))?;
        Ok(stream)
    }
}

impl ChangeFeed for WsChangeFeed {
    fn open(&self, table: &str, sink: EventSink) -> Box<dyn ChannelHandle> {
        let connected = Arc::new(AtomicBool::new(false));
        let task = match Handle::try_current() {
            Ok(handle) => Some(handle.spawn(run_channel(
                self.clone(),
                table.to_string(),
                sink,
                Arc::clone(&connected),
            ))),
            Err(_) => {
                warn!(table = %table, error = %ChannelError::NoRuntime, "Live channel not started");
                None
            }
        };
        Box::new(WsChannelHandle {
            connected,
            task: Mutex::new(task),
        })
    }
}

async fn run_channel(
    feed: WsChangeFeed,
    table: String,
    sink: EventSink,
    connected: Arc<AtomicBool>,
) {
    let mut backoff = feed.reconnect.initial_ms;
    loop {
        match feed.connect(&table).await {
            Ok(mut stream) => {
                connected.store(true, Ordering::SeqCst);
                info!(table = %table, "Live channel connected");
                backoff = feed.reconnect.initial_ms;

                while let Some(message) = stream.next().await {
                    match message {
                        Ok(Message::Text(text)) => match decode_frame(&text) {
                            Ok(Some(event)) if event.table == table => sink(event),
                            Ok(Some(event)) => {
                                debug!(
                                    table = %table,
                                    other = %event.table,
                                    "Ignoring change for another table"
                                );
                            }
                            Ok(None) => {}
                            Err(e) => warn!(table = %table, error = %e, "Undecodable live frame"),
                        },
                        Ok(Message::Close(_)) => break,
                        Ok(_) => {}
                        Err(e) => {
                            warn!(table = %table, error = %e, "Live channel error");
                            break;
                        }
                    }
                }

                connected.store(false, Ordering::SeqCst);
                info!(table = %table, "Live channel disconnected");
            }
            Err(e) => {
                debug!(table = %table, error = %e, "Live channel connect failed");
            }
        }

        let delay = jittered_backoff(backoff, feed.reconnect.jitter_ms);
        tokio::time::sleep(Duration::from_millis(delay)).await;

        let next = (backoff as f64 * feed.reconnect.multiplier) as u64;
        backoff = next.min(feed.reconnect.max_ms);
    }
}

fn jittered_backoff(base_ms: u64, jitter_ms: u64) -> u64 {
    if jitter_ms == 0 {
        return base_ms;
    }
    let jitter = rand::rng().random_range(0..jitter_ms);
    base_ms.saturating_add(jitter)
}

struct WsChannelHandle {
    connected: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ChannelHandle for WsChannelHandle {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn close(&self) {
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }
        self.connected.store(false, Ordering::SeqCst);
    }
}

impl Drop for WsChannelHandle {
    fn drop(&mut self) {
        self.close();
    }
}
