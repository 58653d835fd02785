//! Job records and their on-disk schema
//!
//! A job file is the unit of state in this system: its directory encodes the
//! lifecycle stage, its contents carry the payload plus the full attempt
//! history. Everything here serializes to camelCase JSON so the files stay
//! readable and stable across versions.

use crate::error::BoxError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

/// Lifecycle stage of a job, encoded as the directory it lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Queued,
    Inprogress,
    Done,
    Dead,
}

impl Stage {
    pub const ALL: [Stage; 4] = [Stage::Queued, Stage::Inprogress, Stage::Done, Stage::Dead];

    /// Directory name under the topic root.
    pub fn dir(&self) -> &'static str {
        match self {
            Stage::Queued => "queued",
            Stage::Inprogress => "inprogress",
            Stage::Done => "done",
            Stage::Dead => "dead",
        }
    }
}

/// Outcome of one execution try.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptStatus {
    Pending,
    Success,
    Failure,
}

/// Plain serializable error shape, shared by job attempts and RPC responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorObject {
    pub name: String,
    pub message: String,
    pub stack: Option<String>,
}

impl ErrorObject {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
        }
    }

    /// A task or call that outran its deadline.
    pub fn timeout() -> Self {
        Self::new("Error", "timeout")
    }

    pub fn from_box(error: &BoxError) -> Self {
        Self::new("Error", error.to_string())
    }
}

impl std::fmt::Display for ErrorObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

/// One execution try of a job. Appended to the job record when it settles,
/// never rewritten afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attempt {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub status: AttemptStatus,
    pub error: Option<ErrorObject>,
    pub result: Option<Value>,
}

impl Attempt {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            processed_at: None,
            status: AttemptStatus::Pending,
            error: None,
            result: None,
        }
    }

    pub(crate) fn succeed(&mut self, result: Value) {
        self.processed_at = Some(Utc::now());
        self.status = AttemptStatus::Success;
        self.result = Some(result);
    }

    pub(crate) fn fail(&mut self, error: ErrorObject) {
        self.processed_at = Some(Utc::now());
        self.status = AttemptStatus::Failure;
        self.error = Some(error);
    }
}

impl Default for Attempt {
    fn default() -> Self {
        Self::new()
    }
}

/// One unit of work in a topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: Uuid,
    pub data: Value,
    pub created_at: DateTime<Utc>,
    pub attempts: Vec<Attempt>,
    /// Per-attempt execution deadline, milliseconds.
    pub task_timeout: u64,
    pub max_attempts: u32,
}

impl Job {
    /// Build a fresh job from a payload and the merged options.
    /// Ids are v7 so lexical order tracks creation order.
    pub fn new(data: Value, task_timeout: Duration, max_attempts: u32) -> Self {
        Self {
            id: Uuid::now_v7(),
            data,
            created_at: Utc::now(),
            attempts: Vec::new(),
            task_timeout: task_timeout.as_millis() as u64,
            max_attempts,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout)
    }

    /// File name of this job inside a stage directory.
    pub fn file_name(&self) -> String {
        format!("{}.json", self.id)
    }
}

/// Engine-wide defaults, overridable per `emit` call.
#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub poll_interval: Duration,
    pub task_timeout: Duration,
    pub max_attempts: u32,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(200),
            task_timeout: Duration::from_millis(10_000),
            max_attempts: 4,
        }
    }
}

impl QueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = n;
        self
    }
}

/// Per-emit overrides, merged over [`QueueOptions`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmitOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_timeout: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
}

impl EmitOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = Some(timeout.as_millis() as u64);
        self
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = Some(n);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn job_record_uses_wire_field_names() {
        let job = Job::new(json!({"hello": "world"}), Duration::from_secs(10), 4);
        let value = serde_json::to_value(&job).unwrap();

        assert!(value.get("createdAt").is_some());
        assert_eq!(value["taskTimeout"], 10_000);
        assert_eq!(value["maxAttempts"], 4);
        assert_eq!(value["attempts"], json!([]));
        assert_eq!(value["data"], json!({"hello": "world"}));
    }

    #[test]
    fn job_ids_are_time_ordered() {
        let a = Job::new(Value::Null, Duration::from_secs(1), 1);
        // v7 ids only order across distinct timestamps
        std::thread::sleep(Duration::from_millis(2));
        let b = Job::new(Value::Null, Duration::from_secs(1), 1);
        assert!(a.id < b.id);
    }

    #[test]
    fn attempt_settles_once() {
        let mut attempt = Attempt::new();
        assert_eq!(attempt.status, AttemptStatus::Pending);
        assert!(attempt.processed_at.is_none());

        attempt.fail(ErrorObject::timeout());
        assert_eq!(attempt.status, AttemptStatus::Failure);
        assert_eq!(attempt.error.as_ref().unwrap().message, "timeout");
        assert!(attempt.processed_at.is_some());
    }
}
