//! Integration tests for the queued-request flow: submit a request, stream
//! agent chunks at it, and assert on debounced finalization and delivery.

use async_trait::async_trait;
use lib::client::SessionClient;
use lib::config::Config;
use lib::crypto::{Keyring, SessionCrypto};
use lib::delivery::{ChannelContext, OutboundDelivery};
use lib::protocol::{EncryptedContent, FrameBody, RelayFrame, WireMessage};
use lib::queue::QueueError;
use lib::transport::{memory_pair, MemoryHarness, TransportEvent};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

const SESSION_ID: &str = "sess-assembly";

/// Delivery adapter that records every finalized response.
struct RecordingDelivery {
    sent: Mutex<Vec<String>>,
}

impl RecordingDelivery {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl OutboundDelivery for RecordingDelivery {
    async fn deliver(&self, _context: &ChannelContext, text: &str) -> Result<(), String> {
        self.sent.lock().await.push(text.to_string());
        Ok(())
    }
}

struct TestSession {
    client: SessionClient,
    crypto: SessionCrypto,
    harness: MemoryHarness,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

async fn setup(debounce_ms: u64) -> TestSession {
    let secret = Keyring::generate_secret().expect("generate secret");
    let mut config = Config::default();
    config.session.id = Some(SESSION_ID.to_string());
    config.session.secret = Some(secret.clone());
    config.timing.debounce_ms = debounce_ms;
    let (transport, inbound_rx, harness) = memory_pair();
    let client = SessionClient::start(&config, transport, inbound_rx)
        .await
        .expect("start client");
    let crypto = Keyring::from_secret(&secret)
        .expect("keyring")
        .for_session(SESSION_ID);
    TestSession {
        client,
        crypto,
        harness,
    }
}

fn agent_frame(crypto: &SessionCrypto, content: serde_json::Value) -> RelayFrame {
    let envelope = json!({ "role": "agent", "content": content });
    let sealed = crypto.encrypt(&envelope).expect("encrypt");
    RelayFrame {
        body: FrameBody {
            t: "new-message".to_string(),
            sid: Some(SESSION_ID.to_string()),
            message: Some(WireMessage {
                id: format!("msg-{}", uuid::Uuid::new_v4()),
                created_at: now_ms(),
                content: EncryptedContent::new(sealed),
            }),
        },
    }
}

async fn inject(session: &TestSession, frame: RelayFrame) {
    session
        .harness
        .inbound_tx
        .send(TransportEvent::Frame(frame))
        .await
        .expect("inject frame");
}

/// The forwarded request shows up as an outbound frame; consuming it guarantees
/// the request was promoted to current before chunks are injected.
async fn await_forwarded(session: &mut TestSession) {
    tokio::time::timeout(Duration::from_secs(2), session.harness.outbound_rx.recv())
        .await
        .expect("request forwarded within 2s")
        .expect("outbound channel open");
}

#[tokio::test]
async fn rapid_chunks_coalesce_into_one_delivered_response() {
    let mut session = setup(400).await;
    let delivery = RecordingDelivery::new();
    let pending = session
        .client
        .submit(ChannelContext::new("say hello"), delivery.clone())
        .await;
    await_forwarded(&mut session).await;

    for chunk in ["Hel", "lo ", "world"] {
        inject(&session, agent_frame(&session.crypto, json!(chunk))).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(session.client.assembler().is_streaming().await);

    let result = tokio::time::timeout(Duration::from_secs(3), pending)
        .await
        .expect("finalized within 3s")
        .expect("hook")
        .expect("ok");
    assert_eq!(result, "Hello world");
    assert!(!session.client.assembler().is_streaming().await);

    // Exactly one delivery, equal to the concatenation.
    for _ in 0..100 {
        if !delivery.sent.lock().await.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(*delivery.sent.lock().await, vec!["Hello world".to_string()]);
}

#[tokio::test]
async fn ready_event_finalizes_before_the_debounce_window() {
    let mut session = setup(10_000).await;
    let delivery = RecordingDelivery::new();
    let pending = session
        .client
        .submit(ChannelContext::new("quick"), delivery.clone())
        .await;
    await_forwarded(&mut session).await;

    inject(&session, agent_frame(&session.crypto, json!("done"))).await;
    inject(
        &session,
        agent_frame(&session.crypto, json!({ "type": "event", "data": { "type": "ready" } })),
    )
    .await;

    // A ten-second debounce would stall this without the explicit ready.
    let result = tokio::time::timeout(Duration::from_secs(2), pending)
        .await
        .expect("ready short-circuits the debounce")
        .expect("hook")
        .expect("ok");
    assert_eq!(result, "done");
}

#[tokio::test]
async fn assistant_output_payloads_contribute_only_text_parts() {
    let mut session = setup(200).await;
    let delivery = RecordingDelivery::new();
    let pending = session
        .client
        .submit(ChannelContext::new("explain"), delivery.clone())
        .await;
    await_forwarded(&mut session).await;

    let output = json!({
        "type": "output",
        "data": {
            "type": "assistant",
            "message": {
                "content": [
                    { "type": "text", "text": "part one " },
                    { "type": "tool_use", "name": "bash", "input": {} },
                    { "type": "text", "text": "part two" },
                ]
            }
        }
    });
    inject(&session, agent_frame(&session.crypto, output)).await;

    let result = tokio::time::timeout(Duration::from_secs(3), pending)
        .await
        .expect("finalized")
        .expect("hook")
        .expect("ok");
    assert_eq!(result, "part one part two");
}

#[tokio::test]
async fn empty_final_buffer_fails_the_request() {
    let mut session = setup(10_000).await;
    let delivery = RecordingDelivery::new();
    let pending = session
        .client
        .submit(ChannelContext::new("anything"), delivery.clone())
        .await;
    await_forwarded(&mut session).await;

    // Ready with nothing buffered: the service produced no answer.
    inject(
        &session,
        agent_frame(&session.crypto, json!({ "type": "event", "data": { "type": "ready" } })),
    )
    .await;

    let err = tokio::time::timeout(Duration::from_secs(2), pending)
        .await
        .expect("resolved")
        .expect("hook")
        .expect_err("empty response fails");
    assert!(matches!(err, QueueError::Failed(ref r) if r == "empty response"));
    assert!(delivery.sent.lock().await.is_empty());
}

#[tokio::test]
async fn disconnect_fails_the_outstanding_request() {
    let mut session = setup(10_000).await;
    let delivery = RecordingDelivery::new();
    let pending = session
        .client
        .submit(ChannelContext::new("doomed"), delivery.clone())
        .await;
    await_forwarded(&mut session).await;

    // Partial content arrives, then the connection drops: no salvage.
    inject(&session, agent_frame(&session.crypto, json!("half"))).await;
    session
        .harness
        .inbound_tx
        .send(TransportEvent::Disconnected {
            reason: "socket closed".to_string(),
        })
        .await
        .expect("inject disconnect");

    let err = tokio::time::timeout(Duration::from_secs(2), pending)
        .await
        .expect("resolved")
        .expect("hook")
        .expect_err("disconnect fails the request");
    assert!(matches!(err, QueueError::Failed(ref r) if r == "socket closed"));
    assert!(delivery.sent.lock().await.is_empty());
}

#[tokio::test]
async fn queued_requests_run_strictly_one_at_a_time() {
    let mut session = setup(200).await;
    let delivery = RecordingDelivery::new();

    let first = session
        .client
        .submit(ChannelContext::new("first"), delivery.clone())
        .await;
    let second = session
        .client
        .submit(ChannelContext::new("second"), delivery.clone())
        .await;

    // Only the first request is forwarded until it finalizes.
    await_forwarded(&mut session).await;
    assert!(session.harness.outbound_rx.try_recv().is_err());

    inject(&session, agent_frame(&session.crypto, json!("answer one"))).await;
    let result = tokio::time::timeout(Duration::from_secs(3), first)
        .await
        .expect("first finalized")
        .expect("hook")
        .expect("ok");
    assert_eq!(result, "answer one");

    // The second request is promoted and forwarded only now.
    await_forwarded(&mut session).await;
    inject(&session, agent_frame(&session.crypto, json!("answer two"))).await;
    let result = tokio::time::timeout(Duration::from_secs(3), second)
        .await
        .expect("second finalized")
        .expect("hook")
        .expect("ok");
    assert_eq!(result, "answer two");

    for _ in 0..100 {
        if delivery.sent.lock().await.len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(
        *delivery.sent.lock().await,
        vec!["answer one".to_string(), "answer two".to_string()]
    );
}
