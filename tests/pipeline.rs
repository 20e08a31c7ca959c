use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use payment_watch::feed::{Dialer, Endpoint, FeedError, TRANSFER_TOPIC, Transport};
use payment_watch::gateway::NewPayment;
use payment_watch::notify::{ClientSink, ClientStream, NotifyError};
use payment_watch::store::{MemoryStore, PaymentStatus, PaymentStore};
use payment_watch::{Address, Config, PaymentGateway, server};
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_util::sync::CancellationToken;

const RECEIVER: &str = "0x00000000000000000000000000000000000000ab";
const SENDER: &str = "0x00000000000000000000000000000000000000cd";
const USDT: &str = "0x55d398326f99059ff775485246999027b3197955";
const WAIT: Duration = Duration::from_secs(5);

// test utils

struct Upstream {
    to_gateway: mpsc::UnboundedSender<Result<String, FeedError>>,
    from_gateway: mpsc::UnboundedReceiver<String>,
}

impl Upstream {
    async fn next_request(&mut self) -> Value {
        let text = timeout(WAIT, self.from_gateway.next())
            .await
            .expect("no request from gateway")
            .unwrap();
        serde_json::from_str(&text).unwrap()
    }

    async fn assert_quiet(&mut self) {
        if let Ok(Some(text)) = timeout(Duration::from_millis(200), self.from_gateway.next()).await {
            panic!("unexpected request {text}");
        }
    }

    fn push(&self, frame: Value) {
        self.to_gateway.unbounded_send(Ok(frame.to_string())).unwrap();
    }

    /// Acknowledge subscriptions until the keep-alive probe that ends the
    /// connect sequence. Returns the acknowledged subscribe requests.
    async fn accept_connect_sequence(&mut self) -> Vec<Value> {
        let mut subscribes = Vec::new();
        loop {
            let request = self.next_request().await;
            match request["method"].as_str() {
                Some("eth_subscribe") => {
                    self.push(json!({
                        "jsonrpc": "2.0",
                        "id": request["id"],
                        "result": format!("0xsub{}", request["id"]),
                    }));
                    subscribes.push(request);
                }
                Some("net_version") => return subscribes,
                other => panic!("unexpected request {other:?}"),
            }
        }
    }

    fn transfer(&self, to: &str, base_units: u128) {
        let padded = |addr: &str| format!("0x{:0>64}", addr.trim_start_matches("0x"));
        self.push(json!({
            "jsonrpc": "2.0",
            "method": "eth_subscription",
            "params": {
                "subscription": "0xsub1",
                "result": {
                    "address": USDT,
                    "topics": [TRANSFER_TOPIC, padded(SENDER), padded(to)],
                    "data": format!("0x{base_units:064x}"),
                    "transactionHash": format!("0x{}", "ab".repeat(32)),
                    "blockNumber": "0x100",
                    "logIndex": "0x0",
                }
            }
        }));
    }
}

/// Hands out one in-memory transport, then refuses.
#[derive(Default)]
struct OneShotDialer {
    transport: Mutex<Option<Transport>>,
}

impl OneShotDialer {
    fn with_upstream() -> (Arc<Self>, Upstream) {
        let (out_tx, out_rx) = mpsc::unbounded::<String>();
        let (in_tx, in_rx) = mpsc::unbounded::<Result<String, FeedError>>();
        let transport = Transport {
            sink: Box::pin(out_tx.sink_map_err(|e| FeedError::Transport(e.to_string()))),
            stream: Box::pin(in_rx),
        };
        let dialer = Arc::new(Self {
            transport: Mutex::new(Some(transport)),
        });
        let upstream = Upstream {
            to_gateway: in_tx,
            from_gateway: out_rx,
        };
        (dialer, upstream)
    }
}

#[async_trait]
impl Dialer for OneShotDialer {
    async fn dial(&self, url: &str) -> Result<Transport, FeedError> {
        self.transport.lock().take().ok_or_else(|| FeedError::Dial {
            endpoint: url.to_string(),
            reason: "refused".to_string(),
        })
    }
}

struct Client {
    from_server: mpsc::UnboundedReceiver<String>,
    _to_server: mpsc::UnboundedSender<Result<String, NotifyError>>,
}

impl Client {
    async fn next_of_type(&mut self, kind: &str) -> Value {
        loop {
            let text = timeout(WAIT, self.from_server.next())
                .await
                .expect("no frame from gateway")
                .unwrap();
            let frame: Value = serde_json::from_str(&text).unwrap();
            if frame["type"] == kind {
                return frame;
            }
        }
    }
}

fn client() -> (ClientSink, ClientStream, Client) {
    let (out_tx, out_rx) = mpsc::unbounded::<String>();
    let (in_tx, in_rx) = mpsc::unbounded::<Result<String, NotifyError>>();
    let sink: ClientSink = Box::pin(out_tx.sink_map_err(|e| NotifyError::SendFailed(e.to_string())));
    (
        sink,
        Box::pin(in_rx),
        Client {
            from_server: out_rx,
            _to_server: in_tx,
        },
    )
}

fn config() -> Config {
    Config {
        receivers: vec![RECEIVER.parse().unwrap()],
        endpoints: vec![Endpoint {
            name: "scripted".to_string(),
            url: "ws://upstream.test".to_string(),
            priority: 1,
            handshake_timeout_ms: 1000,
            requires_api_key: false,
        }],
        ..Config::default()
    }
}

fn ten_usdt() -> NewPayment {
    NewPayment {
        token: "USDT".to_string(),
        amount: "10".to_string(),
        receiver: None,
        timeout_secs: Some(600),
    }
}

async fn wait_for_status(store: &MemoryStore, payment_id: &str, status: PaymentStatus) {
    timeout(WAIT, async {
        while store.get_payment_by_id(payment_id).await.unwrap().status != status {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("payment status never changed");
}

async fn serve(gateway: Arc<PaymentGateway>, shutdown: CancellationToken) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(server::serve(listener, gateway, shutdown));
    addr
}

/// Minimal HTTP/1.1 exchange. Returns the status code and body.
async fn http(addr: SocketAddr, method: &str, path: &str, body: Option<Value>) -> (u16, String) {
    let body = body.map(|b| b.to_string()).unwrap_or_default();
    let request = format!(
        "{method} {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\
         Content-Type: application/json\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    );
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut raw = String::new();
    timeout(WAIT, stream.read_to_string(&mut raw)).await.unwrap().unwrap();

    let status = raw
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .unwrap();
    let body = raw.split_once("\r\n\r\n").map(|(_, b)| b.to_string()).unwrap_or_default();
    (status, body)
}

// Upstream to client

#[tokio::test]
async fn transfer_notification_settles_payment_end_to_end() {
    let (dialer, mut upstream) = OneShotDialer::with_upstream();
    let store = Arc::new(MemoryStore::new());
    let shutdown = CancellationToken::new();
    let (gateway, results) = PaymentGateway::new(
        &config(),
        dialer,
        Arc::clone(&store) as Arc<dyn PaymentStore>,
        shutdown.clone(),
    );
    gateway.start(results);

    // one subscription per configured token, filtered on the receiver
    let subscribes = upstream.accept_connect_sequence().await;
    assert_eq!(subscribes.len(), 3);
    let receiver_topic = format!("0x{:0>64}", RECEIVER.trim_start_matches("0x"));
    assert!(subscribes.iter().all(|s| s["params"][1]["topics"][2] == receiver_topic));
    assert!(gateway.is_upstream_connected());

    // the configured receiver is already in the filter: no new subscriptions
    let record = gateway.create_payment(ten_usdt()).await.unwrap();
    gateway
        .create_payment(NewPayment {
            amount: "25".to_string(),
            ..ten_usdt()
        })
        .await
        .unwrap();
    upstream.assert_quiet().await;

    let (sink, stream, mut client) = client();
    gateway.attach_client(&record.payment_id, sink, stream).await;
    client.next_of_type("connection_ack").await;

    // wrong amount first: ignored
    upstream.transfer(RECEIVER, 9_000_000_000_000_000_000);
    upstream.transfer(RECEIVER, 10_000_000_000_000_000_000);

    let update = client.next_of_type("payment_status_update").await;
    assert_eq!(update["paymentId"], record.payment_id);
    assert_eq!(update["data"]["status"], "paid");
    assert_eq!(update["data"]["amount"], "10.000000");
    assert_eq!(update["data"]["token"], "USDT");
    assert_eq!(update["data"]["blockNumber"], 256);
    assert_eq!(update["data"]["confirmations"], 1);

    wait_for_status(&store, &record.payment_id, PaymentStatus::Paid).await;
    let stored = store.get_payment_by_id(&record.payment_id).await.unwrap();
    assert_eq!(stored.sender, Some(SENDER.parse::<Address>().unwrap()));
    assert_eq!(stored.block_number, Some(256));

    let stats = gateway.connection_stats();
    assert!(stats.upstream.connected);
    assert_eq!(stats.upstream.total_connections, 1);
    assert_eq!(stats.upstream.subscriptions.len(), 3);
    assert_eq!(stats.pending_payments, 1);

    gateway.shutdown().await;
}

// HTTP surface

#[tokio::test]
async fn http_and_websocket_surface() {
    let (dialer, _upstream) = OneShotDialer::with_upstream();
    let store = Arc::new(MemoryStore::new());
    let shutdown = CancellationToken::new();
    let (gateway, results) = PaymentGateway::new(
        &config(),
        dialer,
        Arc::clone(&store) as Arc<dyn PaymentStore>,
        shutdown.clone(),
    );
    gateway.start(results);
    let addr = serve(Arc::clone(&gateway), shutdown.clone()).await;

    let (status, body) = http(addr, "GET", "/health", None).await;
    assert_eq!(status, 200);
    assert_eq!(serde_json::from_str::<Value>(&body).unwrap()["status"], "ok");

    let (status, body) = http(
        addr,
        "POST",
        "/api/v1/payments",
        Some(json!({ "token": "USDT", "amount": "1.5", "timeoutSecs": 600 })),
    )
    .await;
    assert_eq!(status, 201);
    let created: Value = serde_json::from_str(&body).unwrap();
    let payment_id = created["paymentId"].as_str().unwrap().to_string();
    assert_eq!(created["status"], "pending");
    assert_eq!(created["amount"], "1500000000000000000");

    let (status, _) = http(
        addr,
        "POST",
        "/api/v1/payments",
        Some(json!({ "token": "DOGE", "amount": "1" })),
    )
    .await;
    assert_eq!(status, 400);

    // unknown payments are refused before the upgrade
    match connect_async(format!("ws://{addr}/ws/payments/pay_missing")).await {
        Err(WsError::Http(response)) => assert_eq!(response.status(), 404),
        other => panic!("expected 404, got {:?}", other.map(|_| ())),
    }

    let (mut ws, _) = connect_async(format!("ws://{addr}/ws/payments/{payment_id}"))
        .await
        .unwrap();
    let next_text = |frame: Option<Result<Message, WsError>>| -> Value {
        match frame {
            Some(Ok(Message::Text(text))) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected text frame, got {other:?}"),
        }
    };

    let ack = next_text(timeout(WAIT, ws.next()).await.unwrap());
    assert_eq!(ack["type"], "connection_ack");
    assert!(ack["data"]["sessionId"].as_str().unwrap().starts_with("sess_"));

    ws.send(Message::Text(r#"{"type":"ping"}"#.to_string())).await.unwrap();
    let pong = next_text(timeout(WAIT, ws.next()).await.unwrap());
    assert_eq!(pong["type"], "pong");

    let (status, body) = http(addr, "GET", "/api/v1/stats/websocket", None).await;
    assert_eq!(status, 200);
    let stats: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(stats["frontend"]["activeConnections"], 1);
    assert_eq!(stats["pendingPayments"], 1);

    let (status, _) = http(addr, "DELETE", &format!("/api/v1/payments/{payment_id}"), None).await;
    assert_eq!(status, 204);
    let update = next_text(timeout(WAIT, ws.next()).await.unwrap());
    assert_eq!(update["type"], "payment_status_update");
    assert_eq!(update["data"]["status"], "failed");
    wait_for_status(&store, &payment_id, PaymentStatus::Failed).await;

    let (status, body) = http(addr, "GET", "/api/v1/stats/websocket/messages?limit=2", None).await;
    assert_eq!(status, 200);
    let messages: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(messages["count"], 2);
    assert_eq!(messages["messages"][0]["source"], "frontend");

    shutdown.cancel();
    gateway.shutdown().await;
}
