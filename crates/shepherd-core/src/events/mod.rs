//! In-memory event log and streaming fan-out.
//!
//! Each task gets a bounded ring of runner-reported activity events plus a
//! broadcast channel for live observers. Appends accept only strictly
//! increasing sequence numbers; duplicates are dropped silently. Observers
//! subscribe with an `after` cursor: retained events past the cursor are
//! replayed first, then the subscription goes live, all under one short
//! per-log lock so nothing falls between replay and live.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use shepherd_store::models::TaskPhase;

/// Default per-task ring capacity.
pub const DEFAULT_RING_CAPACITY: usize = 4096;

/// Per-subscriber live buffer. A subscriber that falls this far behind is
/// dropped and must reconnect with an `after` cursor.
const SUBSCRIBER_BUFFER: usize = 64;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// Kind of runner activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskEventType {
    Thinking,
    ToolCall,
    ToolResult,
    Error,
}

/// One runner-reported activity record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEvent {
    /// Monotonic per task, starting at 1, assigned by the runner.
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: TaskEventType,
    pub summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
}

/// Final stream sentinel carrying the task outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCompletion {
    #[serde(rename = "taskID")]
    pub task_id: Uuid,
    pub status: TaskPhase,
    #[serde(rename = "prURL", skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A message on the observer stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum StreamMessage {
    TaskEvent(TaskEvent),
    TaskComplete(TaskCompletion),
}

// ---------------------------------------------------------------------------
// Event log
// ---------------------------------------------------------------------------

/// Outcome of a batched append.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppendStats {
    pub accepted: usize,
    pub dropped: usize,
}

/// Raised when a live subscriber falls behind its buffer and is dropped.
#[derive(Debug, thiserror::Error)]
#[error("subscriber lagged by {0} events; reconnect with an after cursor")]
pub struct Lagged(pub u64);

struct TaskLog {
    ring: VecDeque<TaskEvent>,
    last_seq: u64,
    tx: broadcast::Sender<StreamMessage>,
    completion: Option<TaskCompletion>,
}

impl TaskLog {
    fn new() -> Self {
        let (tx, _) = broadcast::channel(SUBSCRIBER_BUFFER);
        Self {
            ring: VecDeque::new(),
            last_seq: 0,
            tx,
            completion: None,
        }
    }
}

/// Per-process event log: one bounded ring plus fan-out per task.
pub struct EventLog {
    ring_capacity: usize,
    logs: Mutex<HashMap<Uuid, TaskLog>>,
}

impl EventLog {
    pub fn new(ring_capacity: usize) -> Self {
        Self {
            ring_capacity: ring_capacity.max(1),
            logs: Mutex::new(HashMap::new()),
        }
    }

    /// Append a batch of events for a task.
    ///
    /// Events with `sequence <= last accepted` are duplicates and dropped
    /// silently; so is anything arriving after completion. Gaps are not an
    /// error, the stream protocol surfaces them to observers.
    pub fn append(&self, task_id: Uuid, events: Vec<TaskEvent>) -> AppendStats {
        let mut logs = self.logs.lock().expect("event log lock poisoned");
        let log = logs.entry(task_id).or_insert_with(TaskLog::new);

        let mut stats = AppendStats::default();
        for event in events {
            if log.completion.is_some() {
                stats.dropped += 1;
                continue;
            }
            if event.sequence <= log.last_seq {
                tracing::warn!(
                    task_id = %task_id,
                    sequence = event.sequence,
                    last_seq = log.last_seq,
                    "dropping stale or duplicate task event"
                );
                stats.dropped += 1;
                continue;
            }

            log.last_seq = event.sequence;
            if log.ring.len() == self.ring_capacity {
                log.ring.pop_front();
            }
            log.ring.push_back(event.clone());
            // Send fails only when no observer is connected.
            let _ = log.tx.send(StreamMessage::TaskEvent(event));
            stats.accepted += 1;
        }

        stats
    }

    /// Highest accepted sequence for a task (0 when none).
    pub fn last_seq(&self, task_id: Uuid) -> u64 {
        let logs = self.logs.lock().expect("event log lock poisoned");
        logs.get(&task_id).map(|l| l.last_seq).unwrap_or(0)
    }

    /// Record the terminal outcome: broadcasts one `task_complete` sentinel
    /// and freezes the log. Idempotent.
    pub fn complete(&self, completion: TaskCompletion) {
        let mut logs = self.logs.lock().expect("event log lock poisoned");
        let log = logs.entry(completion.task_id).or_insert_with(TaskLog::new);
        if log.completion.is_some() {
            return;
        }
        log.completion = Some(completion.clone());
        let _ = log.tx.send(StreamMessage::TaskComplete(completion));
    }

    /// Drop all state for a task (after task deletion). Live subscribers
    /// observe end-of-stream.
    pub fn remove(&self, task_id: Uuid) {
        let mut logs = self.logs.lock().expect("event log lock poisoned");
        logs.remove(&task_id);
    }

    /// Subscribe to a task's stream, resuming after sequence `after`.
    ///
    /// Retained events with `sequence > after` are replayed first, then the
    /// subscription turns live. If the ring has rolled past the cursor the
    /// replay starts at the oldest retained event; the resulting gap is
    /// permanent and observers accept it.
    pub fn subscribe(&self, task_id: Uuid, after: u64) -> Subscription {
        let mut logs = self.logs.lock().expect("event log lock poisoned");
        let log = logs.entry(task_id).or_insert_with(TaskLog::new);

        let mut backlog: VecDeque<StreamMessage> = log
            .ring
            .iter()
            .filter(|e| e.sequence > after)
            .cloned()
            .map(StreamMessage::TaskEvent)
            .collect();

        let live = if let Some(completion) = &log.completion {
            backlog.push_back(StreamMessage::TaskComplete(completion.clone()));
            None
        } else {
            Some(log.tx.subscribe())
        };

        Subscription {
            backlog,
            live,
            done: false,
        }
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new(DEFAULT_RING_CAPACITY)
    }
}

/// One observer's view of a task stream: replay backlog, then live.
pub struct Subscription {
    backlog: VecDeque<StreamMessage>,
    live: Option<broadcast::Receiver<StreamMessage>>,
    done: bool,
}

impl Subscription {
    /// Next message, `Ok(None)` at end of stream (completion delivered or
    /// log removed), `Err(Lagged)` when this subscriber fell too far behind
    /// and must reconnect.
    pub async fn next(&mut self) -> Result<Option<StreamMessage>, Lagged> {
        if self.done {
            return Ok(None);
        }

        if let Some(msg) = self.backlog.pop_front() {
            if matches!(msg, StreamMessage::TaskComplete(_)) {
                self.done = true;
            }
            return Ok(Some(msg));
        }

        let Some(rx) = self.live.as_mut() else {
            self.done = true;
            return Ok(None);
        };

        loop {
            match rx.recv().await {
                Ok(msg) => {
                    if matches!(msg, StreamMessage::TaskComplete(_)) {
                        self.done = true;
                    }
                    return Ok(Some(msg));
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.done = true;
                    return Ok(None);
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    return Err(Lagged(n));
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn event(seq: u64) -> TaskEvent {
        TaskEvent {
            sequence: seq,
            timestamp: Utc::now(),
            event_type: TaskEventType::Thinking,
            summary: format!("step {seq}"),
            tool: None,
            input: None,
            output: None,
        }
    }

    fn events(range: std::ops::RangeInclusive<u64>) -> Vec<TaskEvent> {
        range.map(event).collect()
    }

    #[tokio::test]
    async fn append_accepts_strictly_increasing_sequences() {
        let log = EventLog::default();
        let id = Uuid::new_v4();

        let stats = log.append(id, events(1..=5));
        assert_eq!(stats, AppendStats { accepted: 5, dropped: 0 });
        assert_eq!(log.last_seq(id), 5);

        // Duplicates and stale sequences drop silently.
        let stats = log.append(id, events(3..=6));
        assert_eq!(stats, AppendStats { accepted: 1, dropped: 3 });
        assert_eq!(log.last_seq(id), 6);
    }

    #[tokio::test]
    async fn gaps_are_accepted() {
        let log = EventLog::default();
        let id = Uuid::new_v4();

        log.append(id, vec![event(1), event(5), event(9)]);
        assert_eq!(log.last_seq(id), 9);
    }

    #[tokio::test]
    async fn subscribe_replays_then_goes_live() {
        let log = EventLog::default();
        let id = Uuid::new_v4();

        log.append(id, events(1..=10));

        let mut sub = log.subscribe(id, 7);
        for expected in 8..=10 {
            match sub.next().await.unwrap() {
                Some(StreamMessage::TaskEvent(e)) => assert_eq!(e.sequence, expected),
                other => panic!("expected event {expected}, got {other:?}"),
            }
        }

        // Live phase.
        log.append(id, events(11..=12));
        match sub.next().await.unwrap() {
            Some(StreamMessage::TaskEvent(e)) => assert_eq!(e.sequence, 11),
            other => panic!("unexpected {other:?}"),
        }
        match sub.next().await.unwrap() {
            Some(StreamMessage::TaskEvent(e)) => assert_eq!(e.sequence, 12),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn resume_after_disconnect_yields_no_dups_and_no_gap() {
        let log = EventLog::default();
        let id = Uuid::new_v4();

        log.append(id, events(1..=10));

        // Observer consumed 1..=10, then disconnected. More events arrive.
        log.append(id, events(11..=20));

        let mut sub = log.subscribe(id, 10);
        let mut seen = Vec::new();
        for _ in 11..=20 {
            match sub.next().await.unwrap() {
                Some(StreamMessage::TaskEvent(e)) => seen.push(e.sequence),
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(seen, (11..=20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn ring_rolls_and_replay_starts_at_oldest_retained() {
        let log = EventLog::new(4);
        let id = Uuid::new_v4();

        log.append(id, events(1..=10));

        // Only 7..=10 are retained; a cursor at 2 replays what remains.
        let mut sub = log.subscribe(id, 2);
        let mut seen = Vec::new();
        for _ in 0..4 {
            match sub.next().await.unwrap() {
                Some(StreamMessage::TaskEvent(e)) => seen.push(e.sequence),
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(seen, vec![7, 8, 9, 10]);
    }

    #[tokio::test]
    async fn completion_closes_the_stream() {
        let log = EventLog::default();
        let id = Uuid::new_v4();

        log.append(id, events(1..=3));
        let mut sub = log.subscribe(id, 0);

        log.complete(TaskCompletion {
            task_id: id,
            status: TaskPhase::Succeeded,
            pr_url: Some("https://github.com/org/repo/pull/7".to_string()),
            error: None,
        });

        let mut saw_complete = false;
        while let Some(msg) = sub.next().await.unwrap() {
            if let StreamMessage::TaskComplete(c) = msg {
                assert_eq!(c.status, TaskPhase::Succeeded);
                assert_eq!(c.pr_url.as_deref(), Some("https://github.com/org/repo/pull/7"));
                saw_complete = true;
            }
        }
        assert!(saw_complete, "stream must end with the completion sentinel");
        assert!(sub.next().await.unwrap().is_none(), "stream stays closed");
    }

    #[tokio::test]
    async fn late_subscriber_gets_backlog_and_sentinel() {
        let log = EventLog::default();
        let id = Uuid::new_v4();

        log.append(id, events(1..=2));
        log.complete(TaskCompletion {
            task_id: id,
            status: TaskPhase::Failed,
            pr_url: None,
            error: Some("runner reported failure".to_string()),
        });

        let mut sub = log.subscribe(id, 0);
        let mut types = Vec::new();
        while let Some(msg) = sub.next().await.unwrap() {
            types.push(match msg {
                StreamMessage::TaskEvent(_) => "event",
                StreamMessage::TaskComplete(_) => "complete",
            });
        }
        assert_eq!(types, vec!["event", "event", "complete"]);
    }

    #[tokio::test]
    async fn appends_after_completion_are_dropped() {
        let log = EventLog::default();
        let id = Uuid::new_v4();

        log.append(id, events(1..=2));
        log.complete(TaskCompletion {
            task_id: id,
            status: TaskPhase::Failed,
            pr_url: None,
            error: None,
        });

        let stats = log.append(id, events(3..=4));
        assert_eq!(stats, AppendStats { accepted: 0, dropped: 2 });
        assert_eq!(log.last_seq(id), 2);
    }

    #[tokio::test]
    async fn completion_is_idempotent() {
        let log = EventLog::default();
        let id = Uuid::new_v4();

        let completion = TaskCompletion {
            task_id: id,
            status: TaskPhase::Succeeded,
            pr_url: None,
            error: None,
        };
        log.complete(completion.clone());
        log.complete(completion);

        let mut sub = log.subscribe(id, 0);
        let mut sentinels = 0;
        while let Some(msg) = sub.next().await.unwrap() {
            if matches!(msg, StreamMessage::TaskComplete(_)) {
                sentinels += 1;
            }
        }
        assert_eq!(sentinels, 1, "exactly one sentinel per subscriber");
    }

    #[tokio::test]
    async fn slow_subscriber_lags_out_without_blocking_publishers() {
        let log = EventLog::default();
        let id = Uuid::new_v4();

        let mut sub = log.subscribe(id, 0);

        // Push far more live events than the subscriber buffer holds.
        for batch_start in (1u64..=512).step_by(16) {
            let end = batch_start + 15;
            log.append(id, events(batch_start..=end));
        }

        // The subscriber must eventually observe a lag, never a deadlock.
        let mut lagged = false;
        for _ in 0..1024 {
            match sub.next().await {
                Err(Lagged(_)) => {
                    lagged = true;
                    break;
                }
                Ok(Some(_)) => continue,
                Ok(None) => break,
            }
        }
        assert!(lagged, "slow subscriber should be told it lagged");

        // Reconnecting with the cursor recovers what the ring retains.
        let mut resumed = log.subscribe(id, 500);
        match resumed.next().await.unwrap() {
            Some(StreamMessage::TaskEvent(e)) => assert_eq!(e.sequence, 501),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn stream_message_wire_format() {
        let msg = StreamMessage::TaskEvent(TaskEvent {
            sequence: 3,
            timestamp: Utc::now(),
            event_type: TaskEventType::ToolCall,
            summary: "running tests".to_string(),
            tool: Some("bash".to_string()),
            input: Some(serde_json::json!({"command": "cargo test"})),
            output: None,
        });
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "task_event");
        assert_eq!(value["data"]["sequence"], 3);
        assert_eq!(value["data"]["type"], "tool_call");
        assert_eq!(value["data"]["tool"], "bash");

        let msg = StreamMessage::TaskComplete(TaskCompletion {
            task_id: Uuid::nil(),
            status: TaskPhase::Succeeded,
            pr_url: Some("https://example.com/pull/1".to_string()),
            error: None,
        });
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "task_complete");
        assert_eq!(value["data"]["taskID"], Uuid::nil().to_string());
        assert_eq!(value["data"]["status"], "succeeded");
        assert_eq!(value["data"]["prURL"], "https://example.com/pull/1");
        assert!(value["data"].get("error").is_none());
    }
}
