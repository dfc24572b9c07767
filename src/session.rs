//! Push transport session.
//!
//! One websocket per session. Inbound frames are fanned out to listeners held
//! in a registry that outlives any single socket, so a reconnect picks up the
//! existing subscriptions without re-registering them.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

use futures_util::{SinkExt, Stream, StreamExt};
use log::{debug, info, warn};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use url::Url;

use crate::api::events::EventFrame;
use crate::error::{ConnectionError, SyncError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub url: String,
    pub device_type: String,
    pub device_id: String,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

type Listener = (u64, mpsc::UnboundedSender<Value>);

#[derive(Default)]
struct Registry {
    next_id: AtomicU64,
    listeners: Mutex<HashMap<String, Vec<Listener>>>,
}

impl Registry {
    fn register(self: &Arc<Self>, event: &str) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.listeners)
            .entry(event.to_string())
            .or_default()
            .push((id, tx));
        debug!("listener {id} registered for {event}");
        Subscription {
            event: event.to_string(),
            id,
            rx,
            registry: Arc::clone(self),
        }
    }

    fn unregister(&self, event: &str, id: u64) {
        let mut listeners = lock(&self.listeners);
        if let Some(list) = listeners.get_mut(event) {
            list.retain(|(lid, _)| *lid != id);
            if list.is_empty() {
                listeners.remove(event);
            }
        }
        debug!("listener {id} released for {event}");
    }

    /// Deliver a payload to every listener of `event`; returns the delivery count.
    fn dispatch(&self, event: &str, payload: Value) -> usize {
        let listeners = lock(&self.listeners);
        let Some(list) = listeners.get(event) else {
            debug!("no listener for {event}");
            return 0;
        };
        list.iter()
            .filter(|(_, tx)| tx.send(payload.clone()).is_ok())
            .count()
    }

    fn listener_count(&self, event: &str) -> usize {
        lock(&self.listeners).get(event).map_or(0, Vec::len)
    }

    fn close_all(&self) {
        lock(&self.listeners).clear();
    }
}

/// Lazy stream of payloads for one event name.
///
/// Dropping it releases the listener, whatever the reason the consumer stopped.
pub struct Subscription {
    event: String,
    id: u64,
    rx: mpsc::UnboundedReceiver<Value>,
    registry: Arc<Registry>,
}

impl Stream for Subscription {
    type Item = Value;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Value>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.registry.unregister(&self.event, self.id);
    }
}

struct Link {
    outbound: mpsc::UnboundedSender<WsMessage>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

pub struct PushSession {
    config: SessionConfig,
    registry: Arc<Registry>,
    state: Arc<watch::Sender<ConnectionState>>,
    generation: Arc<AtomicU64>,
    link: Mutex<Option<Link>>,
}

impl PushSession {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            registry: Arc::new(Registry::default()),
            state: Arc::new(watch::Sender::new(ConnectionState::Disconnected)),
            generation: Arc::new(AtomicU64::new(0)),
            link: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    fn request_url(&self, token: &str) -> Result<Url, ConnectionError> {
        let mut url = Url::parse(&self.config.url)
            .map_err(|e| ConnectionError::InvalidUrl(format!("{}: {}", self.config.url, e)))?;
        url.query_pairs_mut()
            .append_pair("token", token)
            .append_pair("device_type", &self.config.device_type)
            .append_pair("device_id", &self.config.device_id);
        Ok(url)
    }

    /// Open an authenticated session, replacing any existing one.
    pub async fn connect(&self, token: Option<&str>) -> Result<(), SyncError> {
        let token = token
            .filter(|t| !t.is_empty())
            .ok_or(ConnectionError::MissingToken)?;
        self.disconnect();

        let url = self.request_url(token)?;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| ConnectionError::InvalidUrl(e.to_string()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|e| ConnectionError::InvalidUrl(e.to_string()))?;
        request.headers_mut().insert("Authorization", bearer);

        self.state.send_replace(ConnectionState::Connecting);
        let (ws_stream, _) = match connect_async(request).await {
            Ok(conn) => conn,
            Err(e) => {
                self.state.send_replace(ConnectionState::Disconnected);
                return Err(ConnectionError::Unreachable(e.to_string()).into());
            }
        };
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (mut sink, mut stream) = ws_stream.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<WsMessage>();

        let writer = tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                let closing = matches!(msg, WsMessage::Close(_));
                if let Err(e) = sink.send(msg).await {
                    warn!("push write failed: {e}");
                    break;
                }
                if closing {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let registry = Arc::clone(&self.registry);
        let state = Arc::clone(&self.state);
        let current = Arc::clone(&self.generation);
        let reader = tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(WsMessage::Text(text)) => match serde_json::from_str::<EventFrame>(&text) {
                        Ok(frame) => {
                            registry.dispatch(&frame.event, frame.data);
                        }
                        Err(e) => warn!("dropping undecodable push frame: {e}"),
                    },
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!("push connection failed: {e}");
                        break;
                    }
                }
            }
            // A newer connect or an explicit disconnect owns the state now.
            if current.load(Ordering::SeqCst) == generation {
                info!("push session closed");
                state.send_replace(ConnectionState::Disconnected);
            }
        });

        *lock(&self.link) = Some(Link { outbound, reader, writer });
        self.state.send_replace(ConnectionState::Connected);
        info!("push session connected to {}", self.config.url);
        Ok(())
    }

    /// Tear down the session. Calling it while disconnected does nothing.
    pub fn disconnect(&self) {
        let Some(link) = lock(&self.link).take() else {
            return;
        };
        self.generation.fetch_add(1, Ordering::SeqCst);
        let _ = link.outbound.send(WsMessage::Close(None));
        link.reader.abort();
        drop(link.writer);
        self.state.send_replace(ConnectionState::Disconnected);
        info!("push session disconnected");
    }

    /// Register a new listener for `event`.
    pub fn subscribe(&self, event: &str) -> Subscription {
        self.registry.register(event)
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.registry.listener_count(event)
    }

    /// Fire-and-forget send. Without an active session the frame is dropped.
    pub fn emit<T: Serialize>(&self, event: &str, payload: &T) {
        let data = match serde_json::to_value(payload) {
            Ok(v) => v,
            Err(e) => {
                warn!("emit {event}: unserializable payload: {e}");
                return;
            }
        };
        let frame = EventFrame { event: event.to_string(), data };
        let text = match serde_json::to_string(&frame) {
            Ok(t) => t,
            Err(e) => {
                warn!("emit {event}: {e}");
                return;
            }
        };
        let link = lock(&self.link);
        match link.as_ref() {
            Some(link) if self.is_connected() => {
                if link.outbound.send(WsMessage::Text(text)).is_err() {
                    warn!("emit {event} dropped: writer gone");
                }
            }
            _ => warn!("emit {event} dropped: {}", ConnectionError::NotConnected),
        }
    }
}

impl Drop for PushSession {
    fn drop(&mut self) {
        self.disconnect();
        self.registry.close_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn session() -> PushSession {
        PushSession::new(SessionConfig {
            url: "ws://127.0.0.1:1/ws".into(),
            device_type: "test".into(),
            device_id: "dev-1".into(),
        })
    }

    #[tokio::test]
    async fn subscriptions_receive_dispatched_payloads() {
        let s = session();
        let mut a = s.subscribe("new_message");
        let mut b = s.subscribe("new_message");
        assert_eq!(s.registry.dispatch("new_message", json!({"n": 1})), 2);
        assert_eq!(a.next().await, Some(json!({"n": 1})));
        assert_eq!(b.next().await, Some(json!({"n": 1})));
    }

    #[test]
    fn dropping_subscription_releases_listener() {
        let s = session();
        let a = s.subscribe("user_typing");
        let b = s.subscribe("user_typing");
        assert_eq!(s.listener_count("user_typing"), 2);
        drop(a);
        assert_eq!(s.listener_count("user_typing"), 1);
        drop(b);
        assert_eq!(s.listener_count("user_typing"), 0);
    }

    #[test]
    fn listener_released_on_panic_unwind() {
        let s = session();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _sub = s.subscribe("presence_updated");
            panic!("consumer failed");
        }));
        assert!(result.is_err());
        assert_eq!(s.listener_count("presence_updated"), 0);
    }

    #[tokio::test]
    async fn connect_without_token_is_a_configuration_error() {
        let s = session();
        let err = s.connect(None).await.unwrap_err();
        assert!(matches!(err, SyncError::Connection(ConnectionError::MissingToken)));
        let err = s.connect(Some("")).await.unwrap_err();
        assert!(matches!(err, SyncError::Connection(ConnectionError::MissingToken)));
        assert_eq!(s.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn emit_and_disconnect_without_session_are_no_ops() {
        let s = session();
        s.emit("send_message", &json!({"conversation_id": "c1", "text_content": "x"}));
        s.disconnect();
        s.disconnect();
        assert_eq!(s.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn request_url_carries_auth_triple() {
        let url = session().request_url("tok en").unwrap();
        let pairs: HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(pairs["token"], "tok en");
        assert_eq!(pairs["device_type"], "test");
        assert_eq!(pairs["device_id"], "dev-1");
    }
}
