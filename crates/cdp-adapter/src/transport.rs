//! Websocket transport for one CDP peer.
//!
//! Each connection owns exactly one websocket. A spawned demux loop holds the
//! socket and multiplexes concurrent callers: commands arrive over an mpsc
//! channel, responses are matched back to callers by sequence id, and
//! unsolicited events fan out to method-pattern subscribers in arrival order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::error::TransportError;

/// Buffered events per subscriber before the demux loop starts dropping.
const EVENT_BUFFER: usize = 256;
/// Queued outbound commands before senders are backpressured.
const COMMAND_BUFFER: usize = 64;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Responder = oneshot::Sender<Result<Value, TransportError>>;

/// Unsolicited CDP notification.
#[derive(Clone, Debug)]
pub struct CdpEvent {
    pub method: String,
    pub params: Value,
}

enum ControlMessage {
    Call {
        id: u64,
        method: String,
        params: Value,
        responder: Responder,
    },
    Subscribe {
        pattern: String,
        sender: mpsc::Sender<CdpEvent>,
    },
}

/// One multiplexed CDP websocket connection.
///
/// Dropping the connection closes the command channel, which terminates the
/// demux loop and the socket with it.
pub struct CdpConnection {
    cmd_tx: mpsc::Sender<ControlMessage>,
    alive: Arc<AtomicBool>,
    next_id: AtomicU64,
    loop_task: JoinHandle<()>,
}

impl CdpConnection {
    pub async fn connect(ws_url: &str) -> Result<Self, TransportError> {
        let (socket, _) = connect_async(ws_url)
            .await
            .map_err(|err| TransportError::Connect(err.to_string()))?;
        debug!(target: "cdp-transport", url = %ws_url, "cdp socket established");
        Ok(Self::from_socket(socket))
    }

    fn from_socket(socket: Socket) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
        let alive = Arc::new(AtomicBool::new(true));
        let loop_alive = alive.clone();
        let loop_task = tokio::spawn(async move {
            run_loop(socket, cmd_rx).await;
            loop_alive.store(false, Ordering::Relaxed);
        });

        Self {
            cmd_tx,
            alive,
            next_id: AtomicU64::new(0),
            loop_task,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    /// Send one CDP command and await its response. Concurrent calls are
    /// multiplexed; responses may arrive in any order and are matched by id.
    pub async fn call(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, TransportError> {
        if !self.is_alive() {
            return Err(TransportError::Closed);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (resp_tx, resp_rx) = oneshot::channel();
        let message = ControlMessage::Call {
            id,
            method: method.to_string(),
            params,
            responder: resp_tx,
        };

        self.cmd_tx
            .send(message)
            .await
            .map_err(|_| TransportError::Closed)?;

        match tokio::time::timeout(timeout, resp_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => Err(TransportError::CallTimeout {
                method: method.to_string(),
            }),
        }
    }

    /// Subscribe to events whose method matches `pattern`: either an exact
    /// method name (`"Page.loadEventFired"`) or a domain wildcard
    /// (`"Network.*"`). Events for one subscriber are delivered in receive
    /// order; dropping the stream ends the subscription.
    pub async fn subscribe(&self, pattern: &str) -> Result<EventStream, TransportError> {
        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
        self.cmd_tx
            .send(ControlMessage::Subscribe {
                pattern: pattern.to_string(),
                sender: event_tx,
            })
            .await
            .map_err(|_| TransportError::Closed)?;
        Ok(EventStream { rx: event_rx })
    }
}

impl Drop for CdpConnection {
    fn drop(&mut self) {
        self.alive.store(false, Ordering::Relaxed);
        self.loop_task.abort();
    }
}

/// Lazy sequence of CDP events for one subscription.
pub struct EventStream {
    rx: mpsc::Receiver<CdpEvent>,
}

impl EventStream {
    /// Next matching event; `None` once the connection is gone.
    pub async fn next(&mut self) -> Option<CdpEvent> {
        self.rx.recv().await
    }

    /// Non-blocking variant used by polling loops.
    pub fn try_next(&mut self) -> Option<CdpEvent> {
        self.rx.try_recv().ok()
    }
}

struct Subscription {
    pattern: String,
    sender: mpsc::Sender<CdpEvent>,
}

async fn run_loop(mut socket: Socket, mut cmd_rx: mpsc::Receiver<ControlMessage>) {
    let mut inflight: HashMap<u64, Responder> = HashMap::new();
    let mut subscribers: Vec<Subscription> = Vec::new();

    loop {
        tokio::select! {
            maybe_cmd = cmd_rx.recv() => {
                match maybe_cmd {
                    Some(ControlMessage::Call { id, method, params, responder }) => {
                        let frame = json!({ "id": id, "method": method, "params": params });
                        match socket.send(Message::Text(frame.to_string())).await {
                            Ok(()) => {
                                inflight.insert(id, responder);
                            }
                            Err(err) => {
                                let failure = TransportError::Socket(err.to_string());
                                let _ = responder.send(Err(failure.clone()));
                                fail_all(&mut inflight, failure);
                                return;
                            }
                        }
                    }
                    Some(ControlMessage::Subscribe { pattern, sender }) => {
                        subscribers.push(Subscription { pattern, sender });
                    }
                    None => {
                        // Connection handle dropped; close the socket politely.
                        let _ = socket.close(None).await;
                        fail_all(&mut inflight, TransportError::Closed);
                        return;
                    }
                }
            }
            frame = socket.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        dispatch_frame(&text, &mut inflight, &mut subscribers);
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        fail_all(&mut inflight, TransportError::Closed);
                        return;
                    }
                    Some(Ok(_)) => {
                        // Ping/pong and binary frames carry no CDP payload.
                    }
                    Some(Err(err)) => {
                        fail_all(&mut inflight, TransportError::Socket(err.to_string()));
                        return;
                    }
                }
            }
        }
    }
}

fn dispatch_frame(
    text: &str,
    inflight: &mut HashMap<u64, Responder>,
    subscribers: &mut Vec<Subscription>,
) {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(err) => {
            warn!(target: "cdp-transport", %err, "discarding malformed cdp frame");
            return;
        }
    };

    if let Some(id) = value.get("id").and_then(Value::as_u64) {
        let result = extract_payload(&value);
        match inflight.remove(&id) {
            Some(responder) => {
                let _ = responder.send(result);
            }
            None => {
                // Caller timed out before the browser answered.
                debug!(target: "cdp-transport", id, "response for abandoned call");
            }
        }
        return;
    }

    if let Some(method) = value.get("method").and_then(Value::as_str) {
        let event = CdpEvent {
            method: method.to_string(),
            params: value.get("params").cloned().unwrap_or(Value::Null),
        };
        subscribers.retain(|sub| {
            if !method_matches(&sub.pattern, method) {
                return !sub.sender.is_closed();
            }
            match sub.sender.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!(
                        target: "cdp-transport",
                        method, "subscriber lagging, event dropped"
                    );
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }
}

fn extract_payload(value: &Value) -> Result<Value, TransportError> {
    if let Some(error) = value.get("error") {
        let code = error.get("code").and_then(Value::as_i64).unwrap_or(-1);
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown cdp error")
            .to_string();
        return Err(TransportError::Command { code, message });
    }
    Ok(value.get("result").cloned().unwrap_or(Value::Null))
}

fn fail_all(inflight: &mut HashMap<u64, Responder>, error: TransportError) {
    for (_, responder) in inflight.drain() {
        let _ = responder.send(Err(error.clone()));
    }
}

pub(crate) fn method_matches(pattern: &str, method: &str) -> bool {
    match pattern.strip_suffix(".*") {
        Some(domain) => method
            .strip_prefix(domain)
            .map(|rest| rest.starts_with('.'))
            .unwrap_or(false),
        None => pattern == method,
    }
}
