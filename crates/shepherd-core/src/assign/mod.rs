//! Sandbox assignment client.
//!
//! Once a claim is Ready, the reconciler posts the task id and the API
//! base URL to the runner waiting inside the sandbox. The runner answers
//! 200 on first acceptance and 409 when it already holds an assignment;
//! the reconciler treats both as success, which makes assignment
//! idempotent across reconciler crashes.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Port the runner's assignment endpoint listens on inside the sandbox.
pub const ASSIGNMENT_PORT: u16 = 8888;

/// Deadline for one assignment request.
pub const ASSIGNMENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Body posted to the runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignmentRequest {
    #[serde(rename = "taskID")]
    pub task_id: Uuid,
    #[serde(rename = "apiURL")]
    pub api_url: String,
}

/// Successful assignment outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOutcome {
    /// 200: the runner accepted the assignment now.
    Accepted,
    /// 409: the runner already holds this assignment.
    AlreadyAssigned,
}

/// Assignment failures, split by whether a retry can help.
#[derive(Debug, thiserror::Error)]
pub enum AssignError {
    /// Transport failure or a retriable status; requeue with backoff.
    #[error("assignment not delivered: {0}")]
    Retriable(String),

    /// The runner refused in a way a retry will not fix.
    #[error("assignment permanently refused: status {0}")]
    Refused(u16),
}

/// Delivers assignments to runners. The reconciler only sees this trait;
/// tests script it.
#[async_trait]
pub trait AssignmentClient: Send + Sync {
    async fn assign(
        &self,
        service_fqdn: &str,
        request: &AssignmentRequest,
    ) -> Result<AssignOutcome, AssignError>;
}

/// Production client speaking HTTP to the sandbox service address.
pub struct HttpAssignmentClient {
    client: reqwest::Client,
    port: u16,
}

impl HttpAssignmentClient {
    pub fn new() -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(ASSIGNMENT_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            port: ASSIGNMENT_PORT,
        })
    }

    /// Override the runner port (tests bind ephemeral ports).
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }
}

#[async_trait]
impl AssignmentClient for HttpAssignmentClient {
    async fn assign(
        &self,
        service_fqdn: &str,
        request: &AssignmentRequest,
    ) -> Result<AssignOutcome, AssignError> {
        let url = format!("http://{}:{}/task", service_fqdn, self.port);

        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| AssignError::Retriable(e.to_string()))?;

        match response.status().as_u16() {
            200 => Ok(AssignOutcome::Accepted),
            409 => Ok(AssignOutcome::AlreadyAssigned),
            // The runner may not be listening yet, or is shedding load.
            408 | 429 | 500..=599 => {
                Err(AssignError::Retriable(format!("status {}", response.status())))
            }
            other => Err(AssignError::Refused(other)),
        }
    }
}
