//! Domain types stored by shepherd: tasks, conditions, sandbox claims.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Condition type carried by every task. A task is terminal iff this
/// condition's status is no longer `Unknown`.
pub const CONDITION_SUCCEEDED: &str = "Succeeded";

/// Fallback task timeout when the spec does not set one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Claim termination reasons that classify as a timeout rather than a
/// failure when a grace window expires.
pub mod claim_reasons {
    /// The sandbox hit its own lifetime limit.
    pub const SANDBOX_EXPIRED: &str = "SandboxExpired";
    /// The claim hit its lifetime limit before or after fulfillment.
    pub const CLAIM_EXPIRED: &str = "ClaimExpired";
    /// The sandbox pod disappeared underneath the claim.
    pub const SANDBOX_NOT_FOUND: &str = "SandboxNotFound";
    /// The node running the sandbox evicted it.
    pub const NODE_EVICTED: &str = "NodeEvicted";
    /// The sandbox never scheduled.
    pub const UNSCHEDULABLE: &str = "Unschedulable";

    /// Reasons that map to a `TimedOut` terminal phase.
    pub const EXPIRY_REASONS: [&str; 2] = [SANDBOX_EXPIRED, CLAIM_EXPIRED];
    /// Reasons eligible for sandbox reincarnation below the retry cap.
    pub const INFRA_REASONS: [&str; 3] = [SANDBOX_NOT_FOUND, NODE_EVICTED, UNSCHEDULABLE];
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Coarse phase of a task, mirroring the `Succeeded` condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

impl TaskPhase {
    /// Terminal phases are absorbing: no transition leaves them.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::TimedOut | Self::Cancelled
        )
    }
}

impl fmt::Display for TaskPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskPhase {
    type Err = TaskPhaseParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "timed_out" => Ok(Self::TimedOut),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(TaskPhaseParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskPhase`] string.
#[derive(Debug, Clone)]
pub struct TaskPhaseParseError(pub String);

impl fmt::Display for TaskPhaseParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task phase: {:?}", self.0)
    }
}

impl std::error::Error for TaskPhaseParseError {}

// ---------------------------------------------------------------------------

/// Tri-state status of a condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::True => "True",
            Self::False => "False",
            Self::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

impl FromStr for ConditionStatus {
    type Err = ConditionStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "True" => Ok(Self::True),
            "False" => Ok(Self::False),
            "Unknown" => Ok(Self::Unknown),
            other => Err(ConditionStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`ConditionStatus`] string.
#[derive(Debug, Clone)]
pub struct ConditionStatusParseError(pub String);

impl fmt::Display for ConditionStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid condition status: {:?}", self.0)
    }
}

impl std::error::Error for ConditionStatusParseError {}

// ---------------------------------------------------------------------------

/// Encoding of the stored task context bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextEncoding {
    Plain,
    Gzip,
}

impl fmt::Display for ContextEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Plain => "plain",
            Self::Gzip => "gzip",
        };
        f.write_str(s)
    }
}

impl FromStr for ContextEncoding {
    type Err = ContextEncodingParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plain" => Ok(Self::Plain),
            "gzip" => Ok(Self::Gzip),
            other => Err(ContextEncodingParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`ContextEncoding`] string.
#[derive(Debug, Clone)]
pub struct ContextEncodingParseError(pub String);

impl fmt::Display for ContextEncodingParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid context encoding: {:?}", self.0)
    }
}

impl std::error::Error for ContextEncodingParseError {}

// ---------------------------------------------------------------------------
// Conditions
// ---------------------------------------------------------------------------

/// An observed condition on a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: ConditionStatus,
    pub reason: String,
    pub message: String,
    pub observed_generation: i64,
    pub last_transition_time: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// The declarative record of one unit of background work.
///
/// Spec fields are written once at creation (plus the cancel flag); status
/// fields are owned by the reconciler and the runner status pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub namespace: String,
    pub generation: i64,
    pub resource_version: i64,

    // Spec.
    pub repo_url: String,
    pub repo_ref: String,
    pub description: String,
    /// Raw context bytes, possibly gzip-compressed. Served decompressed on
    /// the runner surface only, so it is not part of the task JSON.
    #[serde(skip)]
    pub context: Vec<u8>,
    pub context_encoding: ContextEncoding,
    pub source_url: Option<String>,
    pub source_type: Option<String>,
    pub source_id: Option<String>,
    pub callback_url: Option<String>,
    pub sandbox_template: String,
    pub timeout_secs: Option<i64>,
    pub labels: BTreeMap<String, String>,
    pub cancel_requested: bool,

    // Status.
    pub phase: TaskPhase,
    pub conditions: Vec<Condition>,
    pub sandbox_claim_name: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub completion_time: Option<DateTime<Utc>>,
    pub grace_deadline: Option<DateTime<Utc>>,
    pub result_error: Option<String>,
    pub result_pr_url: Option<String>,
    pub retry_count: i64,
    pub token_generation: Option<i64>,

    pub created_at: DateTime<Utc>,
}

impl Task {
    /// The `Succeeded` condition, if recorded.
    pub fn succeeded_condition(&self) -> Option<&Condition> {
        self.conditions
            .iter()
            .find(|c| c.condition_type == CONDITION_SUCCEEDED)
    }

    /// A task is terminal iff its `Succeeded` condition is True or False.
    pub fn is_terminal(&self) -> bool {
        self.succeeded_condition()
            .map(|c| c.status != ConditionStatus::Unknown)
            .unwrap_or(false)
    }

    /// Record the `Succeeded` condition, updating in place or appending.
    ///
    /// `last_transition_time` only moves when the status value changes, so
    /// repeated writes of the same status keep the original transition time.
    pub fn set_succeeded_condition(
        &mut self,
        status: ConditionStatus,
        reason: &str,
        message: &str,
    ) {
        let now = Utc::now();
        match self
            .conditions
            .iter_mut()
            .find(|c| c.condition_type == CONDITION_SUCCEEDED)
        {
            Some(existing) => {
                if existing.status != status {
                    existing.last_transition_time = now;
                }
                existing.status = status;
                existing.reason = reason.to_owned();
                existing.message = message.to_owned();
                existing.observed_generation = self.generation;
            }
            None => self.conditions.push(Condition {
                condition_type: CONDITION_SUCCEEDED.to_owned(),
                status,
                reason: reason.to_owned(),
                message: message.to_owned(),
                observed_generation: self.generation,
                last_transition_time: now,
            }),
        }
    }

    /// Effective run timeout for this task.
    pub fn timeout(&self) -> Duration {
        match self.timeout_secs {
            Some(secs) if secs > 0 => Duration::from_secs(secs as u64),
            _ => DEFAULT_TIMEOUT,
        }
    }
}

/// Spec fields for creating a task. Everything status-side starts empty.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub namespace: String,
    pub repo_url: String,
    pub repo_ref: String,
    pub description: String,
    pub context: Vec<u8>,
    pub context_encoding: ContextEncoding,
    pub source_url: Option<String>,
    pub source_type: Option<String>,
    pub source_id: Option<String>,
    pub callback_url: Option<String>,
    pub sandbox_template: String,
    pub timeout_secs: Option<i64>,
    pub labels: BTreeMap<String, String>,
}

// ---------------------------------------------------------------------------
// Sandbox claim
// ---------------------------------------------------------------------------

/// A request for one sandbox instance, owned by exactly one task.
///
/// The claim's status side (`ready`, `sandbox_name`, `service_fqdn`) is
/// written by the external provisioner; shepherd only creates and deletes
/// claims and reads their status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxClaim {
    pub name: String,
    pub namespace: String,
    pub task_id: Uuid,
    pub template: String,
    pub ready: ConditionStatus,
    pub reason: Option<String>,
    pub message: Option<String>,
    pub sandbox_name: Option<String>,
    pub service_fqdn: Option<String>,
    pub resource_version: i64,
    pub created_at: DateTime<Utc>,
}

impl SandboxClaim {
    /// True when the provisioner has published a reachable sandbox.
    pub fn is_ready(&self) -> bool {
        self.ready == ConditionStatus::True && self.service_fqdn.is_some()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_phase_display_roundtrip() {
        let variants = [
            TaskPhase::Pending,
            TaskPhase::Running,
            TaskPhase::Succeeded,
            TaskPhase::Failed,
            TaskPhase::TimedOut,
            TaskPhase::Cancelled,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: TaskPhase = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn task_phase_invalid() {
        assert!("bogus".parse::<TaskPhase>().is_err());
    }

    #[test]
    fn task_phase_terminality() {
        assert!(!TaskPhase::Pending.is_terminal());
        assert!(!TaskPhase::Running.is_terminal());
        assert!(TaskPhase::Succeeded.is_terminal());
        assert!(TaskPhase::Failed.is_terminal());
        assert!(TaskPhase::TimedOut.is_terminal());
        assert!(TaskPhase::Cancelled.is_terminal());
    }

    #[test]
    fn condition_status_display_roundtrip() {
        for v in &[
            ConditionStatus::True,
            ConditionStatus::False,
            ConditionStatus::Unknown,
        ] {
            let parsed: ConditionStatus = v.to_string().parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn context_encoding_display_roundtrip() {
        for v in &[ContextEncoding::Plain, ContextEncoding::Gzip] {
            let parsed: ContextEncoding = v.to_string().parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
        assert!("zstd".parse::<ContextEncoding>().is_err());
    }

    fn bare_task() -> Task {
        Task {
            id: Uuid::new_v4(),
            namespace: "default".to_string(),
            generation: 1,
            resource_version: 1,
            repo_url: "https://example.com/org/repo".to_string(),
            repo_ref: "main".to_string(),
            description: "fix the widget".to_string(),
            context: Vec::new(),
            context_encoding: ContextEncoding::Plain,
            source_url: None,
            source_type: None,
            source_id: None,
            callback_url: None,
            sandbox_template: "default".to_string(),
            timeout_secs: None,
            labels: BTreeMap::new(),
            cancel_requested: false,
            phase: TaskPhase::Pending,
            conditions: Vec::new(),
            sandbox_claim_name: None,
            start_time: None,
            completion_time: None,
            grace_deadline: None,
            result_error: None,
            result_pr_url: None,
            retry_count: 0,
            token_generation: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn terminality_follows_succeeded_condition() {
        let mut task = bare_task();
        assert!(!task.is_terminal(), "no condition means non-terminal");

        task.set_succeeded_condition(ConditionStatus::Unknown, "Pending", "waiting");
        assert!(!task.is_terminal());

        task.set_succeeded_condition(ConditionStatus::False, "Failed", "runner reported failure");
        assert!(task.is_terminal());

        task.set_succeeded_condition(ConditionStatus::True, "Completed", "done");
        assert!(task.is_terminal());
    }

    #[test]
    fn set_condition_updates_in_place() {
        let mut task = bare_task();
        task.set_succeeded_condition(ConditionStatus::Unknown, "Pending", "waiting");
        task.set_succeeded_condition(ConditionStatus::Unknown, "Running", "assigned");
        assert_eq!(task.conditions.len(), 1);
        assert_eq!(task.conditions[0].reason, "Running");
    }

    #[test]
    fn transition_time_moves_only_on_status_change() {
        let mut task = bare_task();
        task.set_succeeded_condition(ConditionStatus::Unknown, "Pending", "waiting");
        let first = task.conditions[0].last_transition_time;

        task.set_succeeded_condition(ConditionStatus::Unknown, "Running", "assigned");
        assert_eq!(task.conditions[0].last_transition_time, first);

        task.set_succeeded_condition(ConditionStatus::True, "Completed", "done");
        assert!(task.conditions[0].last_transition_time >= first);
    }

    #[test]
    fn timeout_defaults_to_thirty_minutes() {
        let mut task = bare_task();
        assert_eq!(task.timeout(), DEFAULT_TIMEOUT);
        task.timeout_secs = Some(300);
        assert_eq!(task.timeout(), Duration::from_secs(300));
        task.timeout_secs = Some(0);
        assert_eq!(task.timeout(), DEFAULT_TIMEOUT);
    }

    #[test]
    fn claim_readiness_requires_address() {
        let mut claim = SandboxClaim {
            name: "sbx-1".to_string(),
            namespace: "default".to_string(),
            task_id: Uuid::new_v4(),
            template: "default".to_string(),
            ready: ConditionStatus::True,
            reason: None,
            message: None,
            sandbox_name: None,
            service_fqdn: None,
            resource_version: 1,
            created_at: Utc::now(),
        };
        assert!(!claim.is_ready(), "ready without an address is not ready");
        claim.service_fqdn = Some("sbx-1.default.svc".to_string());
        assert!(claim.is_ready());
    }
}
