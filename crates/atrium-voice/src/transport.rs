//! **Session Transport** — lifecycle of the bidirectional realtime
//! connection.
//!
//! One physical connection serves one logical turn exchange: the engine
//! opens a fresh session right before capturing a turn (per-turn contextual
//! configuration) and closes it after `response.done`. Opening is
//! asynchronous — callers wait for readiness, bounded by a hard timeout,
//! and fail the turn with a recoverable error when it elapses.
//!
//! Connection anatomy: an ephemeral client secret is minted over REST,
//! the socket is opened with the realtime subprotocols, a `session.update`
//! negotiation frame is sent, and a spawned task pumps outbound messages
//! while dispatching inbound events by kind onto an event channel.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::codec::{WireFrame, WireKind};
use crate::error::{VoiceError, VoiceResult};
use crate::protocol::{ClientEvent, ServerEvent, SessionSettings};

/// Transport configuration for the realtime endpoint.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// REST/WebSocket API base, e.g. `https://api.openai.com`.
    pub api_base: String,
    /// Realtime model requested when minting the session secret.
    pub model: String,
    /// Long-lived API key used only for the REST mint step.
    pub api_key: String,
    /// Pre-minted ephemeral secret; when set, the REST step is skipped.
    pub client_secret: Option<String>,
    /// Hard ceiling on connect-and-negotiate (default 10s).
    pub open_timeout: Duration,
    /// Session negotiation sent after the socket opens.
    pub session: SessionSettings,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.openai.com".to_string(),
            model: "gpt-4o-mini-realtime-preview-2024-12-17".to_string(),
            api_key: String::new(),
            client_secret: None,
            open_timeout: Duration::from_secs(10),
            session: SessionSettings::default(),
        }
    }
}

impl TransportConfig {
    /// Build from environment: `REALTIME_API_URL`, `REALTIME_API_KEY`
    /// (or `OPENAI_API_KEY`), `REALTIME_MODEL`.
    pub fn from_env() -> VoiceResult<Self> {
        let api_base = std::env::var("REALTIME_API_URL")
            .unwrap_or_else(|_| "https://api.openai.com".to_string());
        let api_key = std::env::var("REALTIME_API_KEY")
            .or_else(|_| std::env::var("OPENAI_API_KEY"))
            .map_err(|_| {
                VoiceError::Config(
                    "realtime transport requires REALTIME_API_KEY or OPENAI_API_KEY".to_string(),
                )
            })?;
        let model = std::env::var("REALTIME_MODEL")
            .unwrap_or_else(|_| "gpt-4o-mini-realtime-preview-2024-12-17".to_string());

        Ok(Self {
            api_base,
            api_key,
            model,
            ..Self::default()
        })
    }
}

/// Connection lifecycle, observed by the readiness wait.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ConnectionState {
    Connecting,
    Ready,
    Closed,
    Error(String),
}

#[derive(Debug, Deserialize)]
struct MintedSecret {
    client_secret: SecretValue,
}

#[derive(Debug, Deserialize)]
struct SecretValue {
    value: String,
}

/// Derive the WebSocket endpoint from the REST base.
fn websocket_url(api_base: &str) -> VoiceResult<String> {
    let mut url = Url::parse(api_base)
        .map_err(|e| VoiceError::Config(format!("invalid API base `{api_base}`: {e}")))?;

    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => {
            return Err(VoiceError::Config(format!(
                "unsupported API scheme `{other}`"
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| VoiceError::Config("cannot derive WebSocket scheme".to_string()))?;
    url.set_path("/v1/realtime");
    url.set_query(Some("intent=transcription"));
    Ok(url.to_string())
}

/// Subprotocol list carrying the ephemeral credential.
fn subprotocols(secret: &str) -> String {
    format!("realtime, openai-insecure-api-key.{secret}, openai-beta.realtime-v1")
}

/// Map an engine wire frame to its protocol event.
fn frame_to_event(frame: &WireFrame) -> VoiceResult<ClientEvent> {
    match frame.kind {
        WireKind::Append => {
            let audio = String::from_utf8(frame.payload.clone())
                .map_err(|e| VoiceError::Codec(format!("append payload is not base64 text: {e}")))?;
            Ok(ClientEvent::InputAudioBufferAppend { audio })
        }
        WireKind::Commit => Ok(ClientEvent::InputAudioBufferCommit),
        WireKind::Clear => Ok(ClientEvent::InputAudioBufferClear),
        WireKind::Control => {
            let session: SessionSettings = serde_json::from_slice(&frame.payload)
                .map_err(|e| VoiceError::Protocol(format!("invalid control payload: {e}")))?;
            Ok(ClientEvent::SessionUpdate { session })
        }
    }
}

/// Poll the connection state until ready, bounded by `limit`.
async fn await_ready(state: &Arc<RwLock<ConnectionState>>, limit: Duration) -> VoiceResult<()> {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        {
            let state = state.read().await;
            match &*state {
                ConnectionState::Ready => return Ok(()),
                ConnectionState::Error(msg) => {
                    return Err(VoiceError::Transport(msg.clone()));
                }
                ConnectionState::Closed => {
                    return Err(VoiceError::Transport(
                        "connection closed before becoming ready".to_string(),
                    ));
                }
                ConnectionState::Connecting => {}
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(VoiceError::Transport(format!(
                "connection not ready within {limit:?}"
            )));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// An open realtime session. Dropping it (or calling `close`) tears the
/// connection down.
pub struct RealtimeSession {
    outbound: mpsc::UnboundedSender<Message>,
    shutdown_tx: broadcast::Sender<()>,
    state: Arc<RwLock<ConnectionState>>,
    events_rx: Option<mpsc::UnboundedReceiver<ServerEvent>>,
    connection_handle: Option<tokio::task::JoinHandle<()>>,
}

impl RealtimeSession {
    /// Connect and negotiate a session. Returns once the connection is
    /// ready, or with a recoverable `Transport` error if the handshake
    /// fails or the open timeout elapses.
    pub async fn open(config: TransportConfig) -> VoiceResult<Self> {
        let secret = match &config.client_secret {
            Some(secret) => secret.clone(),
            None => mint_client_secret(&config).await?,
        };

        let ws_url = websocket_url(&config.api_base)?;
        let open_timeout = config.open_timeout;
        let mut session = Self::spawn_connection(ws_url, secret, config.session.clone())?;

        if let Err(e) = session.wait_ready(open_timeout).await {
            session.close().await;
            return Err(e);
        }
        Ok(session)
    }

    fn spawn_connection(
        ws_url: String,
        secret: String,
        settings: SessionSettings,
    ) -> VoiceResult<Self> {
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(1);
        let (events_tx, events_rx) = mpsc::unbounded_channel::<ServerEvent>();
        let state = Arc::new(RwLock::new(ConnectionState::Connecting));

        let request = tokio_tungstenite::tungstenite::http::Request::builder()
            .uri(&ws_url)
            .header("Sec-WebSocket-Protocol", subprotocols(&secret))
            .body(())
            .map_err(|e| VoiceError::Transport(format!("invalid connect request: {e}")))?;

        let task_state = Arc::clone(&state);
        let connection_handle = tokio::spawn(async move {
            let (ws_stream, _) = match connect_async(request).await {
                Ok(ok) => ok,
                Err(e) => {
                    error!("realtime connect failed: {e}");
                    *task_state.write().await =
                        ConnectionState::Error(format!("connection failed: {e}"));
                    return;
                }
            };

            let (mut ws_sink, mut ws_stream) = ws_stream.split();

            // Negotiate before reporting ready: per-turn contextual
            // configuration rides on this session.update.
            let hello = match serde_json::to_string(&ClientEvent::SessionUpdate {
                session: settings,
            }) {
                Ok(json) => json,
                Err(e) => {
                    *task_state.write().await =
                        ConnectionState::Error(format!("cannot encode negotiation: {e}"));
                    return;
                }
            };
            if let Err(e) = ws_sink.send(Message::Text(hello.into())).await {
                *task_state.write().await =
                    ConnectionState::Error(format!("negotiation send failed: {e}"));
                return;
            }

            info!("realtime session connected");
            *task_state.write().await = ConnectionState::Ready;

            loop {
                tokio::select! {
                    Some(message) = out_rx.recv() => {
                        if let Err(e) = ws_sink.send(message).await {
                            error!("realtime send failed: {e}");
                            *task_state.write().await =
                                ConnectionState::Error(format!("send failed: {e}"));
                            break;
                        }
                    }

                    message = ws_stream.next() => {
                        match message {
                            Some(Ok(Message::Text(text))) => {
                                match serde_json::from_str::<ServerEvent>(&text) {
                                    Ok(ServerEvent::Unknown) => {
                                        debug!("ignoring unknown realtime event");
                                    }
                                    Ok(event) => {
                                        if events_tx.send(event).is_err() {
                                            debug!("event receiver dropped, closing session");
                                            break;
                                        }
                                    }
                                    Err(e) => {
                                        warn!("undecodable realtime event, skipping: {e}");
                                    }
                                }
                            }
                            Some(Ok(Message::Close(frame))) => {
                                info!("realtime connection closed by remote: {frame:?}");
                                break;
                            }
                            Some(Ok(_)) => {
                                // Ping/pong are handled by the library;
                                // the endpoint does not send binary frames.
                            }
                            Some(Err(e)) => {
                                error!("realtime stream error: {e}");
                                *task_state.write().await =
                                    ConnectionState::Error(format!("stream error: {e}"));
                                break;
                            }
                            None => {
                                info!("realtime stream ended");
                                break;
                            }
                        }
                    }

                    _ = shutdown_rx.recv() => {
                        debug!("realtime session shutdown requested");
                        let _ = ws_sink.send(Message::Close(None)).await;
                        break;
                    }
                }
            }

            let mut state = task_state.write().await;
            if !matches!(*state, ConnectionState::Error(_)) {
                *state = ConnectionState::Closed;
            }
        });

        Ok(Self {
            outbound: out_tx,
            shutdown_tx,
            state,
            events_rx: Some(events_rx),
            connection_handle: Some(connection_handle),
        })
    }

    /// Wait for the connection to become ready, bounded by `limit`.
    pub async fn wait_ready(&self, limit: Duration) -> VoiceResult<()> {
        await_ready(&self.state, limit).await
    }

    /// Whether the connection is currently ready for data.
    pub async fn is_ready(&self) -> bool {
        *self.state.read().await == ConnectionState::Ready
    }

    /// Send a protocol event.
    pub fn send(&self, event: &ClientEvent) -> VoiceResult<()> {
        let json = serde_json::to_string(event)
            .map_err(|e| VoiceError::Protocol(format!("cannot encode event: {e}")))?;
        self.outbound
            .send(Message::Text(json.into()))
            .map_err(|e| VoiceError::ChannelSend(format!("connection task gone: {e}")))
    }

    /// Send an engine wire frame.
    pub fn send_frame(&self, frame: &WireFrame) -> VoiceResult<()> {
        self.send(&frame_to_event(frame)?)
    }

    /// Take the inbound event stream (single consumer).
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<ServerEvent>> {
        self.events_rx.take()
    }

    /// Close the session and wait briefly for the connection task to exit.
    pub async fn close(&mut self) {
        let _ = self.shutdown_tx.send(());
        if let Some(handle) = self.connection_handle.take() {
            let _ = timeout(Duration::from_secs(5), handle).await;
        }
        debug!("realtime session closed");
    }
}

impl Drop for RealtimeSession {
    fn drop(&mut self) {
        // Signal the connection task even when close() was never awaited.
        let _ = self.shutdown_tx.send(());
    }
}

/// Mint an ephemeral client secret over REST. The long-lived API key never
/// rides on the socket itself.
async fn mint_client_secret(config: &TransportConfig) -> VoiceResult<String> {
    if config.api_key.is_empty() {
        return Err(VoiceError::Config(
            "transport requires an API key or a pre-minted client secret".to_string(),
        ));
    }

    let url = format!(
        "{}/v1/realtime/sessions",
        config.api_base.trim_end_matches('/')
    );
    let body = serde_json::json!({ "model": config.model });

    let client = reqwest::Client::builder()
        .timeout(config.open_timeout)
        .build()
        .map_err(|e| VoiceError::Transport(e.to_string()))?;

    let response = client
        .post(&url)
        .bearer_auth(&config.api_key)
        .json(&body)
        .send()
        .await
        .map_err(|e| VoiceError::Transport(format!("session mint failed: {e}")))?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(VoiceError::Transport(format!(
            "session mint rejected ({status}): {body}"
        )));
    }

    let minted: MintedSecret = response
        .json()
        .await
        .map_err(|e| VoiceError::Protocol(format!("malformed session mint response: {e}")))?;

    debug!("ephemeral client secret minted");
    Ok(minted.client_secret.value)
}
