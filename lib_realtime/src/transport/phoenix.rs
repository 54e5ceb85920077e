//! # Phoenix Transport
//!
//! Supabase Realtime over one WebSocket, speaking the Phoenix channels
//! protocol (v1 JSON frames).
//!
//! A supervisor task owns the socket. It keeps it alive with heartbeats on the
//! `phoenix` topic, turns replies and pushes into channel signals, and on
//! socket loss reports `CHANNEL_ERROR` on every channel, waits, reconnects and
//! rejoins whatever channels are registered by then. Channel-level recovery
//! stays with the caller's backoff logic; the supervisor only restores the
//! socket.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::core::channel::ChannelIntent;
use crate::core::error::TransportError;
use crate::transport::{ChannelSink, ChannelStatus, RealtimeTransport, RowChange, TransportChannel};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const PHOENIX_TOPIC: &str = "phoenix";
const TOPIC_PREFIX: &str = "realtime:";
const PROTOCOL_VERSION: &str = "1.0.0";
const JOIN_CHECK_PERIOD: Duration = Duration::from_millis(250);

/// # Phoenix Configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhoenixConfig {
    /// Realtime endpoint, e.g. `wss://<project>.supabase.co/realtime/v1`.
    pub endpoint: String,
    pub api_key: String,
    pub heartbeat_interval: Duration,
    /// How long a join may stay unanswered before `TIMED_OUT` is reported.
    pub join_timeout: Duration,
    /// Pause between socket reconnect attempts.
    pub reconnect_delay: Duration,
    pub connect_timeout: Duration,
}

impl PhoenixConfig {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            heartbeat_interval: Duration::from_secs(25),
            join_timeout: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// The socket URL: endpoint path plus `/websocket`, with the API key and
    /// protocol version in the query.
    pub fn socket_url(&self) -> Result<Url, TransportError> {
        let mut url = Url::parse(&self.endpoint)
            .map_err(|e| TransportError::Connect(format!("invalid endpoint {}: {}", self.endpoint, e)))?;
        match url.scheme() {
            "ws" | "wss" => {}
            "http" => url
                .set_scheme("ws")
                .map_err(|_| TransportError::Connect("cannot switch to ws://".into()))?,
            "https" => url
                .set_scheme("wss")
                .map_err(|_| TransportError::Connect("cannot switch to wss://".into()))?,
            other => return Err(TransportError::Connect(format!("unsupported scheme {}", other))),
        }
        if !url.path().ends_with("/websocket") {
            let path = format!("{}/websocket", url.path().trim_end_matches('/'));
            url.set_path(&path);
        }
        url.query_pairs_mut()
            .append_pair("apikey", &self.api_key)
            .append_pair("vsn", PROTOCOL_VERSION);
        Ok(url)
    }
}

/// One Phoenix v1 frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Frame {
    topic: String,
    event: String,
    #[serde(default)]
    payload: Value,
    #[serde(rename = "ref", default)]
    reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    join_ref: Option<String>,
}

impl Frame {
    fn to_message(&self) -> Option<WsMessage> {
        match serde_json::to_string(self) {
            Ok(text) => Some(WsMessage::Text(text.into())),
            Err(e) => {
                log::error!("Failed to encode frame for {}: {}", self.topic, e);
                None
            }
        }
    }
}

#[derive(Debug)]
enum Command {
    Join { topic: String, id: u64 },
    Leave { topic: String, join_ref: Option<String> },
}

struct ChannelSlot {
    id: u64,
    intent: ChannelIntent,
    sink: ChannelSink,
    join_ref: Option<String>,
    join_deadline: Option<Instant>,
    /// Session the join was last sent on.
    session: u64,
}

#[derive(Default)]
struct PhoenixState {
    channels: HashMap<String, ChannelSlot>,
    next_id: u64,
    commands: Option<mpsc::UnboundedSender<Command>>,
    token: Option<CancellationToken>,
    supervisor: Option<JoinHandle<()>>,
}

struct Shared {
    config: PhoenixConfig,
    state: Mutex<PhoenixState>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, PhoenixState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Socket lost: every channel is reported failed and forgets its join.
    fn fail_all_channels(&self) {
        let mut state = self.lock();
        for slot in state.channels.values_mut() {
            slot.join_ref = None;
            slot.join_deadline = None;
            slot.sink.status(ChannelStatus::ChannelError);
        }
    }
}

/// # Phoenix Transport
pub struct PhoenixTransport {
    shared: Arc<Shared>,
}

impl PhoenixTransport {
    pub fn new(config: PhoenixConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(PhoenixState::default()),
            }),
        }
    }

    pub fn config(&self) -> &PhoenixConfig {
        &self.shared.config
    }

    async fn dial(config: &PhoenixConfig) -> Result<WsStream, TransportError> {
        let url = config.socket_url()?;
        log::info!("Connecting to realtime endpoint {}{}", url.host_str().unwrap_or(""), url.path());
        match time::timeout(config.connect_timeout, connect_async(url.as_str())).await {
            Ok(Ok((ws_stream, _))) => Ok(ws_stream),
            Ok(Err(e)) => Err(TransportError::Connect(e.to_string())),
            Err(_) => Err(TransportError::Connect(format!(
                "no handshake within {} ms",
                config.connect_timeout.as_millis()
            ))),
        }
    }
}

impl Drop for PhoenixTransport {
    fn drop(&mut self) {
        if let Some(token) = self.shared.lock().token.take() {
            token.cancel();
        }
    }
}

impl RealtimeTransport for PhoenixTransport {
    fn connect(&self) -> BoxFuture<'_, Result<(), TransportError>> {
        async move {
            let running = self.shared.lock().token.is_some();
            if running {
                return Ok(());
            }

            let ws_stream = Self::dial(&self.shared.config).await?;
            log::info!("Realtime socket connected.");

            let (tx, rx) = mpsc::unbounded_channel();
            let token = CancellationToken::new();
            let mut state = self.shared.lock();
            if state.token.is_some() {
                // Lost a race with a concurrent connect; keep the first socket.
                return Ok(());
            }
            state.commands = Some(tx);
            state.token = Some(token.clone());
            state.supervisor = Some(tokio::spawn(supervise(Arc::clone(&self.shared), ws_stream, rx, token)));
            Ok(())
        }
        .boxed()
    }

    fn open(&self, intent: &ChannelIntent, sink: ChannelSink) -> Result<Box<dyn TransportChannel>, TransportError> {
        let mut state = self.shared.lock();
        let commands = state.commands.clone().ok_or(TransportError::NotConnected)?;

        state.next_id += 1;
        let id = state.next_id;
        let topic = format!("{}{}", TOPIC_PREFIX, intent.channel_name());
        state.channels.insert(
            topic.clone(),
            ChannelSlot {
                id,
                intent: intent.clone(),
                sink,
                join_ref: None,
                join_deadline: None,
                session: 0,
            },
        );
        commands
            .send(Command::Join { topic: topic.clone(), id })
            .map_err(|_| TransportError::Closed)?;

        Ok(Box::new(PhoenixChannel {
            shared: Arc::clone(&self.shared),
            topic,
            id,
        }))
    }

    fn disconnect(&self) -> BoxFuture<'_, ()> {
        async move {
            let supervisor = {
                let mut state = self.shared.lock();
                if let Some(token) = state.token.take() {
                    token.cancel();
                }
                state.commands = None;
                state.channels.clear();
                state.supervisor.take()
            };
            if let Some(supervisor) = supervisor {
                if let Err(e) = supervisor.await {
                    log::warn!("Realtime supervisor ended abnormally: {}", e);
                }
            }
            log::info!("Realtime socket disconnected.");
        }
        .boxed()
    }
}

struct PhoenixChannel {
    shared: Arc<Shared>,
    topic: String,
    id: u64,
}

impl TransportChannel for PhoenixChannel {
    fn unsubscribe(&self) {
        let mut state = self.shared.lock();
        if state.channels.get(&self.topic).map(|slot| slot.id) != Some(self.id) {
            return;
        }
        let join_ref = state.channels.remove(&self.topic).and_then(|slot| slot.join_ref);
        if let Some(commands) = &state.commands {
            let _ = commands.send(Command::Leave {
                topic: self.topic.clone(),
                join_ref,
            });
        }
    }
}

enum SessionEnd {
    Cancelled,
    Lost(String),
}

async fn supervise(
    shared: Arc<Shared>,
    first: WsStream,
    mut commands: mpsc::UnboundedReceiver<Command>,
    token: CancellationToken,
) {
    let mut next = Some(first);
    let mut session_id = 0u64;

    loop {
        let ws_stream = match next.take() {
            Some(ws_stream) => ws_stream,
            None => {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = time::sleep(shared.config.reconnect_delay) => {}
                }
                match PhoenixTransport::dial(&shared.config).await {
                    Ok(ws_stream) => {
                        log::info!("Realtime socket reconnected.");
                        ws_stream
                    }
                    Err(e) => {
                        log::error!("Realtime socket reconnect failed: {}", e);
                        continue;
                    }
                }
            }
        };

        session_id += 1;
        match run_session(&shared, ws_stream, &mut commands, &token, session_id).await {
            SessionEnd::Cancelled => break,
            SessionEnd::Lost(reason) => {
                log::warn!("Realtime socket lost: {}", reason);
                shared.fail_all_channels();
            }
        }
    }
    log::debug!("Realtime supervisor stopped.");
}

/// Per-socket reference counter for `ref` / `join_ref`.
struct Refs(u64);

impl Refs {
    fn next(&mut self) -> String {
        self.0 += 1;
        self.0.to_string()
    }
}

fn join_frame(topic: &str, intent: &ChannelIntent, api_key: &str, join_ref: &str) -> Frame {
    Frame {
        topic: topic.to_string(),
        event: "phx_join".to_string(),
        payload: json!({
            "config": {
                "broadcast": { "ack": false, "self": false },
                "presence": { "key": "" },
                "postgres_changes": [intent.changes()],
                "private": false
            },
            "access_token": api_key
        }),
        reference: Some(join_ref.to_string()),
        join_ref: Some(join_ref.to_string()),
    }
}

/// Builds the join for `topic` and records it on the slot.
fn prepare_join(
    state: &mut PhoenixState,
    topic: &str,
    config: &PhoenixConfig,
    refs: &mut Refs,
    session: u64,
) -> Option<Frame> {
    let slot = state.channels.get_mut(topic)?;
    let join_ref = refs.next();
    slot.join_ref = Some(join_ref.clone());
    slot.join_deadline = Some(Instant::now() + config.join_timeout);
    slot.session = session;
    Some(join_frame(topic, &slot.intent, &config.api_key, &join_ref))
}

async fn run_session(
    shared: &Arc<Shared>,
    ws_stream: WsStream,
    commands: &mut mpsc::UnboundedReceiver<Command>,
    token: &CancellationToken,
    session: u64,
) -> SessionEnd {
    let config = &shared.config;
    let (mut write, mut read) = ws_stream.split();
    let mut refs = Refs(0);
    let mut pending_heartbeat: Option<String> = None;

    // Anything queued while the socket was down is covered by the rejoin.
    while commands.try_recv().is_ok() {}

    let joins: Vec<Frame> = {
        let mut state = shared.lock();
        let topics: Vec<String> = state.channels.keys().cloned().collect();
        topics
            .iter()
            .filter_map(|topic| prepare_join(&mut state, topic, config, &mut refs, session))
            .collect()
    };
    for frame in joins {
        log::debug!("Joining {}", frame.topic);
        if let Some(message) = frame.to_message() {
            if let Err(e) = write.send(message).await {
                return SessionEnd::Lost(format!("join send failed: {}", e));
            }
        }
    }

    let mut heartbeat = time::interval_at(Instant::now() + config.heartbeat_interval, config.heartbeat_interval);
    let mut join_check = time::interval(JOIN_CHECK_PERIOD);

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                let _ = write.close().await;
                return SessionEnd::Cancelled;
            }
            command = commands.recv() => {
                let frame = match command {
                    None => {
                        let _ = write.close().await;
                        return SessionEnd::Cancelled;
                    }
                    Some(Command::Join { topic, id }) => {
                        let mut state = shared.lock();
                        let pending = state
                            .channels
                            .get(&topic)
                            .is_some_and(|slot| slot.id == id && slot.session != session);
                        if pending {
                            prepare_join(&mut state, &topic, config, &mut refs, session)
                        } else {
                            None
                        }
                    }
                    Some(Command::Leave { topic, join_ref }) => {
                        join_ref.map(|join_ref| Frame {
                            topic,
                            event: "phx_leave".to_string(),
                            payload: json!({}),
                            reference: Some(refs.next()),
                            join_ref: Some(join_ref),
                        })
                    }
                };
                if let Some(message) = frame.as_ref().and_then(Frame::to_message) {
                    if let Err(e) = write.send(message).await {
                        return SessionEnd::Lost(format!("send failed: {}", e));
                    }
                }
            }
            _ = heartbeat.tick() => {
                if pending_heartbeat.is_some() {
                    return SessionEnd::Lost("heartbeat not acknowledged".to_string());
                }
                let reference = refs.next();
                let frame = Frame {
                    topic: PHOENIX_TOPIC.to_string(),
                    event: "heartbeat".to_string(),
                    payload: json!({}),
                    reference: Some(reference.clone()),
                    join_ref: None,
                };
                pending_heartbeat = Some(reference);
                if let Some(message) = frame.to_message() {
                    if let Err(e) = write.send(message).await {
                        return SessionEnd::Lost(format!("heartbeat send failed: {}", e));
                    }
                }
            }
            _ = join_check.tick() => {
                let now = Instant::now();
                let mut state = shared.lock();
                for (topic, slot) in state.channels.iter_mut() {
                    if slot.join_deadline.is_some_and(|deadline| deadline <= now) {
                        log::warn!("Join of {} timed out.", topic);
                        slot.join_deadline = None;
                        slot.sink.status(ChannelStatus::TimedOut);
                    }
                }
            }
            message = read.next() => match message {
                Some(Ok(WsMessage::Text(text))) => {
                    log::trace!("Received: {}", text.as_str());
                    match serde_json::from_str::<Frame>(text.as_str()) {
                        Ok(frame) => route(shared, frame, &mut pending_heartbeat),
                        Err(e) => log::warn!("Unparseable realtime frame: {}", e),
                    }
                }
                Some(Ok(WsMessage::Close(reason))) => {
                    return SessionEnd::Lost(format!("closed by server: {:?}", reason));
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return SessionEnd::Lost(e.to_string()),
                None => return SessionEnd::Lost("stream ended".to_string()),
            },
        }
    }
}

/// Turns one inbound frame into a channel signal.
fn route(shared: &Shared, frame: Frame, pending_heartbeat: &mut Option<String>) {
    if frame.topic == PHOENIX_TOPIC {
        if frame.event == "phx_reply" && frame.reference.is_some() && frame.reference == *pending_heartbeat {
            *pending_heartbeat = None;
        }
        return;
    }

    let mut state = shared.lock();
    let Some(slot) = state.channels.get_mut(&frame.topic) else {
        log::trace!("Frame {} for unknown topic {}", frame.event, frame.topic);
        return;
    };

    match frame.event.as_str() {
        "phx_reply" => {
            if frame.reference.is_none() || frame.reference != slot.join_ref || slot.join_deadline.is_none() {
                return;
            }
            slot.join_deadline = None;
            match frame.payload.get("status").and_then(Value::as_str) {
                Some("ok") => slot.sink.status(ChannelStatus::Subscribed),
                _ => {
                    log::warn!("Join of {} refused: {}", frame.topic, frame.payload.get("response").unwrap_or(&Value::Null));
                    slot.sink.status(ChannelStatus::ChannelError);
                }
            }
        }
        "phx_error" => slot.sink.status(ChannelStatus::ChannelError),
        "phx_close" => slot.sink.status(ChannelStatus::Closed),
        "system" => {
            if frame.payload.get("status").and_then(Value::as_str) == Some("error") {
                log::warn!("System error on {}: {}", frame.topic, frame.payload.get("message").unwrap_or(&Value::Null));
                slot.sink.status(ChannelStatus::ChannelError);
            }
        }
        "postgres_changes" => match frame.payload.get("data").map(RowChange::deserialize) {
            Some(Ok(change)) => slot.sink.event(change),
            Some(Err(e)) => log::warn!("Malformed change on {}: {}", frame.topic, e),
            None => log::warn!("Change on {} without data", frame.topic),
        },
        other => log::trace!("Ignoring {} on {}", other, frame.topic),
    }
}
