use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;

use lib_realtime::transport::{ChannelSignal, ChannelSink, PhoenixConfig, PhoenixTransport, SignalKind};
use lib_realtime::{
    CarStatus, CarStatusChange, ChannelIntent, ChannelName, ChannelStatus, NotificationService, RealtimeConfig,
    RealtimeTransport, TransportError,
};

const WAIT: Duration = Duration::from_secs(5);

/// One accepted socket, seen from the server side.
struct ServerConn {
    inbound: UnboundedReceiver<Value>,
    // `None` drops the socket without a close frame.
    outbound: UnboundedSender<Option<Value>>,
}

impl ServerConn {
    /// Next client frame with the given event, skipping heartbeats.
    async fn expect(&mut self, event: &str) -> Value {
        timeout(WAIT, async {
            loop {
                let frame = self.inbound.recv().await.expect("client socket closed");
                if frame["event"] == event {
                    return frame;
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("no {} frame from client", event))
    }

    fn push(&self, frame: Value) {
        self.outbound.send(Some(frame)).unwrap();
    }

    fn reply(&self, join: &Value, status: &str) {
        self.push(json!({
            "topic": join["topic"],
            "event": "phx_reply",
            "payload": {"status": status, "response": {}},
            "ref": join["ref"],
            "join_ref": join["join_ref"],
        }));
    }

    fn drop_socket(&self) {
        let _ = self.outbound.send(None);
    }
}

/// A minimal Phoenix endpoint on loopback that hands every accepted socket to the test.
struct FakeRealtime {
    port: u16,
    connections: UnboundedReceiver<ServerConn>,
}

impl FakeRealtime {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (conn_tx, connections) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let Ok(ws_stream) = tokio_tungstenite::accept_async(stream).await else {
                    continue;
                };
                let (in_tx, inbound) = mpsc::unbounded_channel();
                let (outbound, mut out_rx) = mpsc::unbounded_channel::<Option<Value>>();
                if conn_tx.send(ServerConn { inbound, outbound }).is_err() {
                    break;
                }

                tokio::spawn(async move {
                    let (mut write, mut read) = ws_stream.split();
                    loop {
                        tokio::select! {
                            message = read.next() => match message {
                                Some(Ok(Message::Text(text))) => {
                                    if let Ok(frame) = serde_json::from_str::<Value>(text.as_str()) {
                                        let _ = in_tx.send(frame);
                                    }
                                }
                                Some(Ok(_)) => {}
                                _ => break,
                            },
                            frame = out_rx.recv() => match frame {
                                Some(Some(frame)) => {
                                    if write.send(Message::Text(frame.to_string().into())).await.is_err() {
                                        break;
                                    }
                                }
                                _ => break,
                            },
                        }
                    }
                });
            }
        });

        Self { port, connections }
    }

    fn config(&self) -> PhoenixConfig {
        let mut config = PhoenixConfig::new(format!("ws://127.0.0.1:{}", self.port), "test-key");
        config.heartbeat_interval = Duration::from_secs(60);
        config.join_timeout = Duration::from_millis(300);
        config.reconnect_delay = Duration::from_millis(100);
        config.connect_timeout = Duration::from_secs(2);
        config
    }

    async fn accepted(&mut self) -> ServerConn {
        timeout(WAIT, self.connections.recv())
            .await
            .expect("client never connected")
            .expect("listener stopped")
    }
}

fn sink_for(channel: &str) -> (ChannelSink, UnboundedReceiver<ChannelSignal>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ChannelSink::new(ChannelName::from(channel), 1, tx), rx)
}

async fn next_signal(signals: &mut UnboundedReceiver<ChannelSignal>) -> SignalKind {
    timeout(WAIT, signals.recv())
        .await
        .expect("no signal from transport")
        .expect("sink dropped")
        .kind
}

fn car_update(topic: &Value) -> Value {
    json!({
        "topic": topic,
        "event": "postgres_changes",
        "ref": null,
        "payload": {
            "ids": [42],
            "data": {
                "schema": "public",
                "table": "cars",
                "commit_timestamp": "2024-05-01T10:00:00Z",
                "type": "UPDATE",
                "record": {"id": "car1", "status": "ACTIVE", "host_id": "host9", "make": "Toyota"},
                "old_record": {"id": "car1", "status": "PENDING_APPROVAL"},
                "columns": [],
                "errors": null
            }
        }
    })
}

#[tokio::test]
async fn test_join_reply_and_change_push() {
    let mut server = FakeRealtime::start().await;
    let transport = PhoenixTransport::new(server.config());
    transport.connect().await.unwrap();
    let mut conn = server.accepted().await;

    let (sink, mut signals) = sink_for("car_status_changes");
    let _channel = transport.open(&ChannelIntent::CarStatusChanges, sink).unwrap();

    let join = conn.expect("phx_join").await;
    assert_eq!(join["topic"], "realtime:car_status_changes");
    assert_eq!(join["payload"]["access_token"], "test-key");
    assert_eq!(join["payload"]["config"]["postgres_changes"][0]["table"], "cars");
    assert_eq!(join["ref"], join["join_ref"]);

    conn.reply(&join, "ok");
    assert_eq!(next_signal(&mut signals).await, SignalKind::Status(ChannelStatus::Subscribed));

    conn.push(car_update(&join["topic"]));
    match next_signal(&mut signals).await {
        SignalKind::Event(change) => {
            assert_eq!(change.table, "cars");
            assert_eq!(change.record["status"], "ACTIVE");
        }
        other => panic!("expected a change, got {:?}", other),
    }

    transport.disconnect().await;
}

#[tokio::test]
async fn test_refused_join_reports_channel_error() {
    let mut server = FakeRealtime::start().await;
    let transport = PhoenixTransport::new(server.config());
    transport.connect().await.unwrap();
    let mut conn = server.accepted().await;

    let (sink, mut signals) = sink_for("admin_notifications_admin-7");
    let intent = ChannelIntent::AdminNotifications {
        admin_user_id: "admin-7".into(),
    };
    let _channel = transport.open(&intent, sink).unwrap();

    let join = conn.expect("phx_join").await;
    assert_eq!(
        join["payload"]["config"]["postgres_changes"][0]["filter"],
        "admin_id=eq.admin-7"
    );
    conn.reply(&join, "error");
    assert_eq!(next_signal(&mut signals).await, SignalKind::Status(ChannelStatus::ChannelError));

    transport.disconnect().await;
}

#[tokio::test]
async fn test_unanswered_join_times_out() {
    let mut server = FakeRealtime::start().await;
    let transport = PhoenixTransport::new(server.config());
    transport.connect().await.unwrap();
    let mut conn = server.accepted().await;

    let (sink, mut signals) = sink_for("car_status_changes");
    let _channel = transport.open(&ChannelIntent::CarStatusChanges, sink).unwrap();
    let join = conn.expect("phx_join").await;

    assert_eq!(next_signal(&mut signals).await, SignalKind::Status(ChannelStatus::TimedOut));

    // A reply arriving after the deadline is ignored.
    conn.reply(&join, "ok");
    assert!(timeout(Duration::from_millis(300), signals.recv()).await.is_err());

    transport.disconnect().await;
}

#[tokio::test]
async fn test_socket_loss_fails_channels_and_rejoins() {
    let mut server = FakeRealtime::start().await;
    let transport = PhoenixTransport::new(server.config());
    transport.connect().await.unwrap();
    let mut first = server.accepted().await;

    let (sink, mut signals) = sink_for("car_status_changes");
    let _channel = transport.open(&ChannelIntent::CarStatusChanges, sink).unwrap();
    let join = first.expect("phx_join").await;
    first.reply(&join, "ok");
    assert_eq!(next_signal(&mut signals).await, SignalKind::Status(ChannelStatus::Subscribed));

    first.drop_socket();
    assert_eq!(next_signal(&mut signals).await, SignalKind::Status(ChannelStatus::ChannelError));

    let mut second = server.accepted().await;
    let rejoin = second.expect("phx_join").await;
    assert_eq!(rejoin["topic"], "realtime:car_status_changes");
    second.reply(&rejoin, "ok");
    assert_eq!(next_signal(&mut signals).await, SignalKind::Status(ChannelStatus::Subscribed));

    transport.disconnect().await;
}

#[tokio::test]
async fn test_unsubscribe_sends_leave() {
    let mut server = FakeRealtime::start().await;
    let transport = PhoenixTransport::new(server.config());
    transport.connect().await.unwrap();
    let mut conn = server.accepted().await;

    let (sink, mut signals) = sink_for("car_status_changes");
    let channel = transport.open(&ChannelIntent::CarStatusChanges, sink).unwrap();
    let join = conn.expect("phx_join").await;
    conn.reply(&join, "ok");
    assert_eq!(next_signal(&mut signals).await, SignalKind::Status(ChannelStatus::Subscribed));

    channel.unsubscribe();
    channel.unsubscribe();
    let leave = conn.expect("phx_leave").await;
    assert_eq!(leave["topic"], "realtime:car_status_changes");
    assert_eq!(leave["join_ref"], join["join_ref"]);

    // Pushes for a topic that was left are dropped.
    conn.push(car_update(&join["topic"]));
    assert!(timeout(Duration::from_millis(300), signals.recv()).await.is_err());

    transport.disconnect().await;
}

#[tokio::test]
async fn test_open_requires_connection() {
    let server = FakeRealtime::start().await;
    let transport = PhoenixTransport::new(server.config());
    let (sink, _signals) = sink_for("car_status_changes");

    assert!(matches!(
        transport.open(&ChannelIntent::CarStatusChanges, sink),
        Err(TransportError::NotConnected)
    ));
}

#[tokio::test]
async fn test_service_delivers_typed_changes_over_socket() {
    let mut server = FakeRealtime::start().await;
    let transport = Arc::new(PhoenixTransport::new(server.config()));
    let service = NotificationService::new(RealtimeConfig::default(), transport);
    service.init().await.unwrap();
    let mut conn = server.accepted().await;

    let (tx, mut changes) = mpsc::unbounded_channel::<CarStatusChange>();
    let _handle = service
        .subscribe_to_car_status_changes(move |change| {
            let _ = tx.send(change);
        })
        .unwrap();

    let join = conn.expect("phx_join").await;
    conn.reply(&join, "ok");
    conn.push(car_update(&join["topic"]));

    let change = timeout(WAIT, changes.recv()).await.unwrap().unwrap();
    assert_eq!(change.id, "car1");
    assert_eq!(change.old_status, Some(CarStatus::PendingApproval));
    assert_eq!(change.new_status, CarStatus::Active);
    assert_eq!(change.host_id.as_deref(), Some("host9"));

    let stats = service.get_service_stats();
    assert_eq!(stats.active_connections, 1);
    assert_eq!(stats.total_subscriptions, 1);

    service.shutdown().await;
}
