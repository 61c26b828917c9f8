//! Callback delivery tests against a local HTTP receiver: signatures,
//! bounded retries, and one-delivery-per-terminal-transition.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use shepherd_core::callback::{
    self, CallbackConfig, CallbackDelivery, CallbackDispatcher, CallbackEvent, CallbackPayload,
};
use shepherd_core::completion::{CompletionPipeline, TerminalOutcome};
use shepherd_core::events::EventLog;
use shepherd_test_utils::{memory_store, new_task};

const SECRET: &[u8] = b"callback-integration-secret";

struct Receiver {
    tx: mpsc::UnboundedSender<(String, Bytes)>,
    /// Number of requests to reject with 500 before accepting.
    fail_first: AtomicUsize,
}

async fn receive(
    State(state): State<Arc<Receiver>>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let signature = headers
        .get(callback::SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let _ = state.tx.send((signature, body));

    if state
        .fail_first
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
    {
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        StatusCode::OK
    }
}

/// Start a callback receiver; returns its URL and the request stream.
async fn start_receiver(
    fail_first: usize,
) -> (String, mpsc::UnboundedReceiver<(String, Bytes)>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let state = Arc::new(Receiver {
        tx,
        fail_first: AtomicUsize::new(fail_first),
    });
    let app = Router::new()
        .route("/hook", post(receive))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    (format!("http://{addr}/hook"), rx)
}

fn quick_config() -> CallbackConfig {
    CallbackConfig {
        attempts: 5,
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(50),
        request_timeout: Duration::from_secs(5),
    }
}

fn payload(event: CallbackEvent) -> CallbackPayload {
    CallbackPayload {
        task_id: uuid::Uuid::new_v4(),
        event,
        message: "pull request opened".to_string(),
        details: serde_json::json!({"prURL": "https://github.com/org/repo/pull/7"}),
    }
}

#[tokio::test]
async fn delivery_is_signed_and_verifiable() {
    let (url, mut rx) = start_receiver(0).await;
    let cancel = CancellationToken::new();
    let dispatcher = CallbackDispatcher::spawn(SECRET.to_vec(), quick_config(), cancel.clone());

    dispatcher.enqueue(CallbackDelivery {
        url,
        payload: payload(CallbackEvent::Completed),
    });

    let (signature, body) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("delivery within deadline")
        .expect("one delivery");

    assert!(
        callback::verify(SECRET, &body, &signature),
        "receiver-side constant-time verification must pass"
    );
    assert!(
        !callback::verify(b"wrong-secret", &body, &signature),
        "wrong secret must fail verification"
    );

    let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed["event"], "completed");
    assert_eq!(parsed["details"]["prURL"], "https://github.com/org/repo/pull/7");
    cancel.cancel();
}

#[tokio::test]
async fn failed_deliveries_retry_until_accepted() {
    let (url, mut rx) = start_receiver(2).await;
    let cancel = CancellationToken::new();
    let dispatcher = CallbackDispatcher::spawn(SECRET.to_vec(), quick_config(), cancel.clone());

    dispatcher.enqueue(CallbackDelivery {
        url,
        payload: payload(CallbackEvent::Failed),
    });

    // Two rejected attempts plus the accepted third, identical bodies.
    let mut bodies = Vec::new();
    for _ in 0..3 {
        let (_, body) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("attempt within deadline")
            .expect("attempt");
        bodies.push(body);
    }
    assert_eq!(bodies[0], bodies[1]);
    assert_eq!(bodies[1], bodies[2]);

    // Accepted: no further attempts.
    assert!(
        tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .is_err(),
        "no retries after a 2xx"
    );
    cancel.cancel();
}

#[tokio::test]
async fn retries_are_bounded() {
    let (url, mut rx) = start_receiver(usize::MAX).await;
    let cancel = CancellationToken::new();
    let config = CallbackConfig {
        attempts: 3,
        ..quick_config()
    };
    let dispatcher = CallbackDispatcher::spawn(SECRET.to_vec(), config, cancel.clone());

    dispatcher.enqueue(CallbackDelivery {
        url,
        payload: payload(CallbackEvent::Failed),
    });

    for _ in 0..3 {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("attempt within deadline")
            .expect("attempt");
    }
    assert!(
        tokio::time::timeout(Duration::from_millis(300), rx.recv())
            .await
            .is_err(),
        "delivery abandoned after the attempt cap"
    );
    cancel.cancel();
}

#[tokio::test]
async fn one_callback_per_terminal_transition() {
    let (url, mut rx) = start_receiver(0).await;
    let store = memory_store().await;
    let cancel = CancellationToken::new();
    let dispatcher = CallbackDispatcher::spawn(SECRET.to_vec(), quick_config(), cancel.clone());
    let pipeline = CompletionPipeline::new(store.clone(), Arc::new(EventLog::default()), dispatcher);

    let mut spec = new_task("default");
    spec.callback_url = Some(url);
    let task = store.create(&spec).await.unwrap();

    // Duplicate status reports race in from the runner.
    pipeline
        .complete(
            task.id,
            TerminalOutcome::succeeded(
                "pull request opened",
                Some("https://github.com/org/repo/pull/7".to_string()),
                serde_json::json!({"prURL": "https://github.com/org/repo/pull/7"}),
            ),
        )
        .await
        .unwrap();
    pipeline
        .complete(
            task.id,
            TerminalOutcome::succeeded(
                "pull request opened",
                Some("https://github.com/org/repo/pull/7".to_string()),
                serde_json::json!({"prURL": "https://github.com/org/repo/pull/7"}),
            ),
        )
        .await
        .unwrap();

    let (signature, body) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("delivery within deadline")
        .expect("one delivery");
    assert!(callback::verify(SECRET, &body, &signature));

    let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed["taskID"], task.id.to_string());
    assert_eq!(parsed["event"], "completed");

    assert!(
        tokio::time::timeout(Duration::from_millis(300), rx.recv())
            .await
            .is_err(),
        "the duplicate completion must not enqueue a second delivery"
    );
    cancel.cancel();
}
