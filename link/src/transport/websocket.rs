//! WebSocket transport over tokio-tungstenite.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream};
use url::Url;

use crate::encoder::WireData;
use crate::error::{CableError, Result};
use crate::event_handlers::DisconnectReason;
use crate::events::EventBus;
use crate::sync::lock;
use crate::timeouts::CableTimeouts;

use super::{Transport, TransportEvent};

type WebSocketStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Handshake settings for [`WebSocketTransport`].
#[derive(Debug, Clone)]
pub struct WebSocketOptions {
    /// Offered via `Sec-WebSocket-Protocol`, e.g. `actioncable-v1-json`.
    pub subprotocols: Vec<String>,
    /// Extra request headers (cookies, authorization, origin...).
    pub headers: Vec<(String, String)>,
    pub connection_timeout: Duration,
}

impl Default for WebSocketOptions {
    fn default() -> Self {
        Self {
            subprotocols: Vec::new(),
            headers: Vec::new(),
            connection_timeout: Duration::from_secs(10),
        }
    }
}

impl WebSocketOptions {
    pub fn with_subprotocol(mut self, protocol: impl Into<String>) -> Self {
        self.subprotocols.push(protocol.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }
}

enum WsCommand {
    Frame(WireData),
    Close,
}

#[derive(Default)]
struct ConnState {
    /// Bumped by every `open()` and `close()`; a connection task only reports
    /// while its generation is current.
    generation: u64,
    outbound: Option<mpsc::UnboundedSender<WsCommand>>,
}

pub struct WebSocketTransport {
    url: RwLock<Url>,
    params: Mutex<BTreeMap<String, String>>,
    options: WebSocketOptions,
    events: EventBus<TransportEvent>,
    state: Arc<Mutex<ConnState>>,
}

impl WebSocketTransport {
    /// Create a transport for `url`. `http(s)` URLs are mapped to `ws(s)`.
    pub fn new(url: &str, options: WebSocketOptions) -> Result<Self> {
        Ok(Self {
            url: RwLock::new(resolve_ws_url(url)?),
            params: Mutex::new(BTreeMap::new()),
            options,
            events: EventBus::new(),
            state: Arc::new(Mutex::new(ConnState::default())),
        })
    }

    /// URL of the next connection, including parameters set via `set_param`.
    pub fn request_url(&self) -> Url {
        let mut url = self.url.read().unwrap_or_else(PoisonError::into_inner).clone();
        let params = lock(&self.params);
        if !params.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in params.iter() {
                pairs.append_pair(key, value);
            }
        }
        url
    }

    pub fn is_open(&self) -> bool {
        lock(&self.state).outbound.is_some()
    }

    fn build_request(&self) -> Result<tokio_tungstenite::tungstenite::http::Request<()>> {
        let url = self.request_url();
        let mut request = url.as_str().into_client_request().map_err(|e| {
            CableError::TransportError(format!("Failed to build WebSocket request: {}", e))
        })?;

        if !self.options.subprotocols.is_empty() {
            let value = HeaderValue::from_str(&self.options.subprotocols.join(", ")).map_err(|e| {
                CableError::ConfigurationError(format!("Invalid WebSocket subprotocol: {}", e))
            })?;
            request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
        }

        for (name, value) in &self.options.headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                CableError::ConfigurationError(format!("Invalid header name '{}': {}", name, e))
            })?;
            let value = HeaderValue::from_str(value).map_err(|e| {
                CableError::ConfigurationError(format!("Invalid header value for '{}': {}", name, e))
            })?;
            request.headers_mut().insert(name, value);
        }

        Ok(request)
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn display_name(&self) -> String {
        format!("WebSocket({})", self.url.read().unwrap_or_else(PoisonError::into_inner))
    }

    async fn open(&self) -> Result<()> {
        let generation = {
            let mut state = lock(&self.state);
            if state.outbound.is_some() {
                return Err(CableError::InvalidState("WebSocket is already open".to_string()));
            }
            state.generation += 1;
            state.generation
        };

        let request = self.build_request()?;
        log::debug!("[cable-link] Opening {}", self.display_name());

        let timeout = self.options.connection_timeout;
        let connect_result = if !CableTimeouts::is_unbounded(timeout) {
            tokio::time::timeout(timeout, connect_async(request)).await
        } else {
            Ok(connect_async(request).await)
        };

        let ws_stream = match connect_result {
            Ok(Ok((stream, _))) => stream,
            Ok(Err(tokio_tungstenite::tungstenite::error::Error::Http(response))) => {
                let status = response.status();
                let body_text = response
                    .into_body()
                    .as_ref()
                    .and_then(|b| {
                        if b.is_empty() { None } else { Some(String::from_utf8_lossy(b).into_owned()) }
                    })
                    .unwrap_or_default();
                let message = match status.as_u16() {
                    401 => "Unauthorized: WebSocket upgrade requires valid credentials".to_string(),
                    403 => "Forbidden: WebSocket upgrade denied".to_string(),
                    code => {
                        if body_text.is_empty() {
                            format!("WebSocket HTTP error: {}", code)
                        } else {
                            format!("WebSocket HTTP error {}: {}", code, body_text)
                        }
                    },
                };
                return Err(CableError::TransportError(message));
            },
            Ok(Err(e)) => {
                return Err(CableError::TransportError(format!("Connection failed: {}", e)));
            },
            Err(_) => {
                return Err(CableError::TimeoutError(format!("Connection timeout ({:?})", timeout)));
            },
        };

        let outbound_rx = {
            let mut state = lock(&self.state);
            if state.generation != generation {
                return Err(CableError::TransportError(
                    "WebSocket closed while connecting".to_string(),
                ));
            }
            let (tx, rx) = mpsc::unbounded_channel();
            state.outbound = Some(tx);
            rx
        };

        tokio::spawn(connection_task(
            ws_stream,
            outbound_rx,
            self.events.clone(),
            self.state.clone(),
            generation,
        ));

        log::debug!("[cable-link] WebSocket open (generation={})", generation);
        self.events.emit(&TransportEvent::Open);
        Ok(())
    }

    fn send(&self, data: WireData) -> Result<()> {
        let state = lock(&self.state);
        let outbound = state
            .outbound
            .as_ref()
            .ok_or_else(|| CableError::TransportError("WebSocket is not open".to_string()))?;
        outbound
            .send(WsCommand::Frame(data))
            .map_err(|_| CableError::TransportError("WebSocket writer has stopped".to_string()))
    }

    fn close(&self) -> Result<()> {
        let outbound = {
            let mut state = lock(&self.state);
            state.generation += 1;
            state.outbound.take()
        };
        if let Some(outbound) = outbound {
            log::debug!("[cable-link] Closing {}", self.display_name());
            let _ = outbound.send(WsCommand::Close);
        }
        Ok(())
    }

    fn set_url(&self, url: &str) -> Result<()> {
        let resolved = resolve_ws_url(url)?;
        *self.url.write().unwrap_or_else(PoisonError::into_inner) = resolved;
        Ok(())
    }

    fn set_param(&self, key: &str, value: &str) {
        lock(&self.params).insert(key.to_string(), value.to_string());
    }

    fn events(&self) -> &EventBus<TransportEvent> {
        &self.events
    }
}

fn is_current(state: &Mutex<ConnState>, generation: u64) -> bool {
    lock(state).generation == generation
}

/// Pumps one WebSocket connection: writes queued frames, emits inbound
/// frames, answers pings and reports how the connection ended.
async fn connection_task(
    mut ws: WebSocketStream,
    mut outbound: mpsc::UnboundedReceiver<WsCommand>,
    events: EventBus<TransportEvent>,
    state: Arc<Mutex<ConnState>>,
    generation: u64,
) {
    let close_reason: Option<CableError> = loop {
        tokio::select! {
            cmd = outbound.recv() => match cmd {
                Some(WsCommand::Frame(data)) => {
                    let message = match data {
                        WireData::Text(text) => Message::Text(text.into()),
                        WireData::Binary(bytes) => Message::Binary(bytes),
                    };
                    if let Err(e) = ws.send(message).await {
                        log::warn!("[cable-link] WebSocket send failed: {}", e);
                        break Some(CableError::disconnected(format!("send failed: {}", e)));
                    }
                },
                Some(WsCommand::Close) | None => {
                    let _ = ws.close(None).await;
                    log::debug!("[cable-link] WebSocket closed locally (generation={})", generation);
                    return;
                },
            },
            frame = ws.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if is_current(&state, generation) {
                        events.emit(&TransportEvent::Data(WireData::Text(text.as_str().to_owned())));
                    }
                },
                Some(Ok(Message::Binary(bytes))) => {
                    if is_current(&state, generation) {
                        events.emit(&TransportEvent::Data(WireData::Binary(bytes)));
                    }
                },
                Some(Ok(Message::Ping(payload))) => {
                    if let Err(e) = ws.send(Message::Pong(payload)).await {
                        log::debug!("[cable-link] WebSocket pong failed: {}", e);
                    }
                },
                Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {},
                Some(Ok(Message::Close(frame))) => {
                    break close_frame_reason(frame);
                },
                Some(Err(e)) => {
                    let err = CableError::TransportError(e.to_string());
                    if is_current(&state, generation) {
                        events.emit(&TransportEvent::Error(err));
                    }
                    break Some(CableError::disconnected(format!("connection error: {}", e)));
                },
                None => {
                    break Some(CableError::disconnected("connection ended"));
                },
            },
        }
    };

    let current = {
        let mut state = lock(&state);
        if state.generation == generation {
            state.outbound = None;
            true
        } else {
            false
        }
    };
    if current {
        log::debug!("[cable-link] WebSocket closed by peer: {:?}", close_reason);
        events.emit(&TransportEvent::Close(close_reason));
    }
}

fn close_frame_reason(frame: Option<CloseFrame>) -> Option<CableError> {
    let frame = frame?;
    let code = u16::from(frame.code);
    let reason = frame.reason.as_str();
    if code == 1000 && reason.is_empty() {
        return None;
    }
    let message = if reason.is_empty() { "closed by server" } else { reason };
    Some(CableError::Disconnected(DisconnectReason::with_code(message, code)))
}

/// Parse and normalize a cable URL: `http` becomes `ws`, `https` becomes `wss`.
fn resolve_ws_url(raw: &str) -> Result<Url> {
    let mut url = Url::parse(raw.trim()).map_err(|e| {
        CableError::ConfigurationError(format!("Invalid cable URL '{}': {}", raw, e))
    })?;

    if url.host_str().is_none() {
        return Err(CableError::ConfigurationError("Cable URL must include a host".to_string()));
    }

    if !url.username().is_empty() || url.password().is_some() {
        return Err(CableError::ConfigurationError(
            "Cable URL must not include username/password credentials".to_string(),
        ));
    }

    let ws_scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(CableError::ConfigurationError(format!(
                "Unsupported cable URL scheme '{}'; expected ws(s) or http(s)",
                other
            )));
        },
    };
    url.set_scheme(ws_scheme).map_err(|_| {
        CableError::ConfigurationError(format!("Cannot use scheme '{}' for {}", ws_scheme, raw))
    })?;
    url.set_fragment(None);
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_ws_url_maps_http_schemes() {
        assert_eq!(resolve_ws_url("http://localhost:3000/cable").unwrap().as_str(), "ws://localhost:3000/cable");
        assert_eq!(resolve_ws_url("https://example.com/cable").unwrap().as_str(), "wss://example.com/cable");
        assert_eq!(resolve_ws_url("wss://example.com/cable").unwrap().scheme(), "wss");
    }

    #[test]
    fn test_resolve_ws_url_rejects_bad_urls() {
        assert!(resolve_ws_url("ftp://example.com").is_err());
        assert!(resolve_ws_url("ws://user:pass@example.com/cable").is_err());
        assert!(resolve_ws_url("not a url").is_err());
    }

    #[test]
    fn test_params_are_appended_to_request_url() {
        let transport =
            WebSocketTransport::new("ws://localhost:8080/cable?token=abc", WebSocketOptions::default())
                .unwrap();
        transport.set_param("sid", "s-1");

        let url = transport.request_url();
        assert_eq!(url.as_str(), "ws://localhost:8080/cable?token=abc&sid=s-1");
    }

    #[test]
    fn test_request_carries_subprotocol() {
        let transport = WebSocketTransport::new(
            "ws://localhost:8080/cable",
            WebSocketOptions::default().with_subprotocol("actioncable-v1-json"),
        )
        .unwrap();

        let request = transport.build_request().unwrap();
        assert_eq!(
            request.headers().get(SEC_WEBSOCKET_PROTOCOL).unwrap(),
            "actioncable-v1-json"
        );
    }

    #[test]
    fn test_send_without_connection_fails() {
        let transport =
            WebSocketTransport::new("ws://localhost:8080/cable", WebSocketOptions::default()).unwrap();
        assert!(!transport.is_open());
        assert!(transport.send(WireData::Text("{}".to_string())).is_err());
        assert!(transport.close().is_ok());
    }

    #[test]
    fn test_close_frame_reason() {
        assert_eq!(close_frame_reason(None), None);
        let err = close_frame_reason(Some(CloseFrame {
            code: 1012u16.into(),
            reason: "server_restart".into(),
        }))
        .unwrap();
        assert_eq!(
            err,
            CableError::Disconnected(DisconnectReason::with_code("server_restart", 1012))
        );
    }

    #[tokio::test]
    async fn test_server_ping_is_answered_with_pong() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.send(Message::Ping(bytes::Bytes::from_static(b"hb"))).await.unwrap();
            loop {
                match ws.next().await {
                    Some(Ok(Message::Pong(payload))) => return payload,
                    Some(Ok(_)) => continue,
                    other => panic!("connection ended without a pong: {:?}", other),
                }
            }
        });

        let transport = WebSocketTransport::new(
            &format!("ws://{}/cable", addr),
            WebSocketOptions::default(),
        )
        .unwrap();
        transport.open().await.unwrap();

        let payload = tokio::time::timeout(Duration::from_secs(2), server)
            .await
            .expect("no pong in time")
            .unwrap();
        assert_eq!(&payload[..], b"hb");
        transport.close().unwrap();
    }
}
