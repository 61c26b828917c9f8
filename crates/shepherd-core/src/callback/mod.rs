//! Signed terminal-transition callbacks.
//!
//! One delivery is enqueued per terminal transition. Delivery is
//! best-effort: a bounded number of attempts with exponential backoff,
//! after which the delivery is logged and dropped. Receivers verify the
//! `X-Shepherd-Signature` header in constant time and deduplicate by
//! (task id, event).

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the payload signature.
pub const SIGNATURE_HEADER: &str = "X-Shepherd-Signature";

/// Terminal event reported to the callback receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallbackEvent {
    Completed,
    Failed,
}

impl fmt::Display for CallbackEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => f.write_str("completed"),
            Self::Failed => f.write_str("failed"),
        }
    }
}

/// Callback request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackPayload {
    #[serde(rename = "taskID")]
    pub task_id: Uuid,
    pub event: CallbackEvent,
    pub message: String,
    pub details: serde_json::Value,
}

/// One delivery waiting in the retry queue.
#[derive(Debug, Clone)]
pub struct CallbackDelivery {
    pub url: String,
    pub payload: CallbackPayload,
}

/// Delivery policy.
#[derive(Debug, Clone)]
pub struct CallbackConfig {
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub request_timeout: Duration,
}

impl Default for CallbackConfig {
    fn default() -> Self {
        Self {
            attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30),
        }
    }
}

// ---------------------------------------------------------------------------
// Signing
// ---------------------------------------------------------------------------

/// Sign a callback body: `sha256=<hex(hmac-sha256(secret, body))>`.
pub fn sign(secret: &[u8], body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC can take key of any size");
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Verify a signature header against a body in constant time.
///
/// Receivers call this before trusting a delivery; malformed headers
/// verify false rather than erroring.
pub fn verify(secret: &[u8], body: &[u8], header: &str) -> bool {
    let Some(hex_mac) = header.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_mac) else {
        return false;
    };
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC can take key of any size");
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Handle for enqueueing callback deliveries.
///
/// Cloneable and cheap; the worker task it feeds lives until the
/// cancellation token fires and the queue drains.
#[derive(Clone)]
pub struct CallbackDispatcher {
    tx: mpsc::Sender<CallbackDelivery>,
}

impl CallbackDispatcher {
    /// Spawn the dispatcher worker and return the enqueue handle.
    pub fn spawn(secret: Vec<u8>, config: CallbackConfig, cancel: CancellationToken) -> Self {
        let (tx, rx) = mpsc::channel::<CallbackDelivery>(256);
        tokio::spawn(run_dispatcher(secret, config, rx, cancel));
        Self { tx }
    }

    /// Queue one delivery. Dropping on a full queue is acceptable:
    /// callbacks are best-effort and receivers reconcile via the task API.
    pub fn enqueue(&self, delivery: CallbackDelivery) {
        if let Err(e) = self.tx.try_send(delivery) {
            tracing::warn!(error = %e, "callback queue full, dropping delivery");
        }
    }
}

async fn run_dispatcher(
    secret: Vec<u8>,
    config: CallbackConfig,
    mut rx: mpsc::Receiver<CallbackDelivery>,
    cancel: CancellationToken,
) {
    let client = match reqwest::Client::builder()
        .timeout(config.request_timeout)
        .build()
    {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "failed to build callback HTTP client");
            return;
        }
    };
    let secret = Arc::new(secret);
    let config = Arc::new(config);
    // Bound concurrent deliveries so one slow receiver cannot starve the rest.
    let permits = Arc::new(Semaphore::new(4));

    loop {
        let delivery = tokio::select! {
            d = rx.recv() => match d {
                Some(d) => d,
                None => break,
            },
            _ = cancel.cancelled() => break,
        };

        let permit = match permits.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => break,
        };
        let client = client.clone();
        let secret = Arc::clone(&secret);
        let config = Arc::clone(&config);
        let cancel = cancel.clone();

        tokio::spawn(async move {
            deliver_with_retries(&client, &secret, &config, &delivery, &cancel).await;
            drop(permit);
        });
    }
}

/// Attempt one delivery with exponential backoff.
async fn deliver_with_retries(
    client: &reqwest::Client,
    secret: &[u8],
    config: &CallbackConfig,
    delivery: &CallbackDelivery,
    cancel: &CancellationToken,
) {
    let body = match serde_json::to_vec(&delivery.payload) {
        Ok(b) => b,
        Err(e) => {
            tracing::error!(error = %e, "unserializable callback payload");
            return;
        }
    };
    let signature = sign(secret, &body);

    let mut delay = config.base_delay;
    for attempt in 1..=config.attempts {
        match client
            .post(&delivery.url)
            .header("Content-Type", "application/json")
            .header(SIGNATURE_HEADER, &signature)
            .body(body.clone())
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => {
                tracing::info!(
                    task_id = %delivery.payload.task_id,
                    event = %delivery.payload.event,
                    attempt,
                    "callback delivered"
                );
                return;
            }
            Ok(resp) => {
                tracing::warn!(
                    task_id = %delivery.payload.task_id,
                    status = %resp.status(),
                    attempt,
                    "callback rejected"
                );
            }
            Err(e) => {
                tracing::warn!(
                    task_id = %delivery.payload.task_id,
                    error = %e,
                    attempt,
                    "callback transport error"
                );
            }
        }

        if attempt == config.attempts {
            break;
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => return,
        }
        delay = (delay * 2).min(config.max_delay);
    }

    tracing::error!(
        task_id = %delivery.payload.task_id,
        event = %delivery.payload.event,
        url = %delivery.url,
        attempts = config.attempts,
        "callback delivery abandoned"
    );
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify_roundtrip() {
        let secret = b"callback-test-secret";
        let body = br#"{"taskID":"x","event":"completed"}"#;

        let header = sign(secret, body);
        assert!(header.starts_with("sha256="));
        assert_eq!(header.len(), "sha256=".len() + 64);
        assert!(verify(secret, body, &header));
    }

    #[test]
    fn verify_rejects_tampered_body() {
        let secret = b"callback-test-secret";
        let header = sign(secret, b"original body");
        assert!(!verify(secret, b"tampered body", &header));
    }

    #[test]
    fn verify_rejects_wrong_secret() {
        let header = sign(b"secret-a", b"body");
        assert!(!verify(b"secret-b", b"body", &header));
    }

    #[test]
    fn verify_rejects_malformed_headers() {
        let secret = b"callback-test-secret";
        assert!(!verify(secret, b"body", ""));
        assert!(!verify(secret, b"body", "md5=abcd"));
        assert!(!verify(secret, b"body", "sha256=not-hex!"));
        assert!(!verify(secret, b"body", "sha256="));
    }

    #[test]
    fn signature_is_deterministic() {
        let secret = b"callback-test-secret";
        assert_eq!(sign(secret, b"body"), sign(secret, b"body"));
        assert_ne!(sign(secret, b"body"), sign(secret, b"other"));
    }

    #[test]
    fn payload_wire_format() {
        let payload = CallbackPayload {
            task_id: Uuid::nil(),
            event: CallbackEvent::Completed,
            message: "pull request opened".to_string(),
            details: serde_json::json!({"prURL": "https://example.com/pull/7"}),
        };
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["taskID"], Uuid::nil().to_string());
        assert_eq!(value["event"], "completed");
        assert_eq!(value["details"]["prURL"], "https://example.com/pull/7");
    }
}
