// SPDX-License-Identifier: MIT OR Apache-2.0
//! Queue plane (C3): per-module task FIFOs and per-`(module, fingerprint)`
//! result slots, backed by Redis.
//!
//! [`QueuePlane`] is the seam the executor (C6) programs against;
//! [`RedisQueuePlane`] is the production implementation and
//! [`MemoryQueuePlane`] is an in-process test double implementing the same
//! trait, so executor tests never need a live Redis instance.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use modscan_core::{Fingerprint, ModuleResult, Task};
use modscan_error::{ErrorKind, ModscanError};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// A result publication, carrying the `task_id` it answers so the executor
/// can reject a stale delayed result that no longer matches the
/// outstanding task for a `(module, fingerprint)` pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultEnvelope {
    /// The task this result answers.
    pub task_id: Uuid,
    /// The module's reported outcome.
    pub result: ModuleResult,
}

/// The queue plane's operations (spec §4.3).
///
/// Implementations make no ordering guarantees across modules — only
/// per-module FIFO — and the design contract is at-least-once delivery:
/// callers are expected to dedupe stale results via `task_id`.
#[async_trait]
pub trait QueuePlane: Send + Sync {
    /// Persist `task`'s payload, then push its id onto its module's queue.
    ///
    /// Implementations must write the payload before making the id
    /// visible to poppers, so a `pop` never returns an id with no
    /// matching payload.
    async fn enqueue(&self, task: &Task) -> Result<(), ModscanError>;

    /// Pop the next task id for `module_id`, waiting up to `wait` for one
    /// to appear. Returns `Ok(None)` on timeout with nothing available.
    async fn pop(&self, module_id: &str, wait: Duration) -> Result<Option<Uuid>, ModscanError>;

    /// Fetch the task payload for `task_id`, if it has not expired.
    async fn fetch_task(&self, task_id: Uuid) -> Result<Option<Task>, ModscanError>;

    /// Atomically publish the result for `(module_id, fingerprint)`.
    async fn publish_result(
        &self,
        module_id: &str,
        fingerprint: Fingerprint,
        envelope: ResultEnvelope,
    ) -> Result<(), ModscanError>;

    /// Wait for a result to appear for `(module_id, fingerprint)`, up to
    /// `deadline`. Returns `Ok(None)` if no matching result (by `task_id`)
    /// arrives before the deadline.
    async fn await_result(
        &self,
        module_id: &str,
        fingerprint: Fingerprint,
        task_id: Uuid,
        deadline: DateTime<Utc>,
    ) -> Result<Option<ModuleResult>, ModscanError>;

    /// Write a liveness timestamp for `module_id`. Used by the registry's
    /// health probe as a lightweight round-trip ping against the queue
    /// plane itself, on top of container state (spec §4.4).
    async fn write_heartbeat(&self, module_id: &str, at: DateTime<Utc>) -> Result<(), ModscanError>;

    /// Read back the most recent heartbeat written for `module_id`, if any.
    async fn read_heartbeat(&self, module_id: &str) -> Result<Option<DateTime<Utc>>, ModscanError>;
}

const POLL_INTERVAL: Duration = Duration::from_millis(250);
/// Heartbeat keys expire quickly: a stale one should read back as absent
/// well before the next probe tick under any reasonable interval.
const HEARTBEAT_TTL_SECS: u64 = 30;

/// Redis-backed [`QueuePlane`], using the key scheme:
/// `module:{id}:queue`, `task:{task_id}`, `result:{module_id}:{fingerprint}`.
pub struct RedisQueuePlane {
    manager: redis::aio::ConnectionManager,
}

impl RedisQueuePlane {
    /// Connect to `redis_url`, establishing a reconnecting connection
    /// manager.
    pub async fn connect(redis_url: &str) -> Result<Self, ModscanError> {
        let client = redis::Client::open(redis_url).map_err(|e| {
            ModscanError::new(ErrorKind::Unavailable, "invalid redis url").with_source(e)
        })?;
        let manager = client.get_connection_manager().await.map_err(|e| {
            ModscanError::new(ErrorKind::Unavailable, "failed to connect to redis").with_source(e)
        })?;
        Ok(Self { manager })
    }

    fn queue_key(module_id: &str) -> String {
        format!("module:{module_id}:queue")
    }

    fn task_key(task_id: Uuid) -> String {
        format!("task:{task_id}")
    }

    fn result_key(module_id: &str, fingerprint: Fingerprint) -> String {
        format!("result:{module_id}:{}", fingerprint.to_hex())
    }

    fn heartbeat_key(module_id: &str) -> String {
        format!("module:{module_id}:heartbeat")
    }
}

#[async_trait]
impl QueuePlane for RedisQueuePlane {
    async fn enqueue(&self, task: &Task) -> Result<(), ModscanError> {
        let mut conn = self.manager.clone();
        let payload = serde_json::to_string(task)
            .map_err(|e| ModscanError::new(ErrorKind::Internal, "failed to serialize task").with_source(e))?;
        let ttl_secs = (task.deadline - Utc::now()).num_seconds().max(1) as u64 + 60;

        redis::cmd("SET")
            .arg(Self::task_key(task.task_id))
            .arg(&payload)
            .arg("EX")
            .arg(ttl_secs)
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| ModscanError::new(ErrorKind::Unavailable, "failed to store task payload").with_source(e))?;

        redis::cmd("LPUSH")
            .arg(Self::queue_key(&task.module_id))
            .arg(task.task_id.to_string())
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| ModscanError::new(ErrorKind::Unavailable, "failed to push task id").with_source(e))?;

        Ok(())
    }

    async fn pop(&self, module_id: &str, wait: Duration) -> Result<Option<Uuid>, ModscanError> {
        let mut conn = self.manager.clone();
        let wait_secs = wait.as_secs().max(1);
        let reply: Option<(String, String)> = redis::cmd("BRPOP")
            .arg(Self::queue_key(module_id))
            .arg(wait_secs)
            .query_async(&mut conn)
            .await
            .map_err(|e| ModscanError::new(ErrorKind::Unavailable, "BRPOP failed").with_source(e))?;

        match reply {
            Some((_, id)) => Uuid::parse_str(&id)
                .map(Some)
                .map_err(|e| ModscanError::new(ErrorKind::Internal, "corrupt task id in queue").with_source(e)),
            None => Ok(None),
        }
    }

    async fn fetch_task(&self, task_id: Uuid) -> Result<Option<Task>, ModscanError> {
        let mut conn = self.manager.clone();
        let payload: Option<String> = redis::cmd("GET")
            .arg(Self::task_key(task_id))
            .query_async(&mut conn)
            .await
            .map_err(|e| ModscanError::new(ErrorKind::Unavailable, "failed to fetch task payload").with_source(e))?;
        payload
            .map(|p| {
                serde_json::from_str(&p)
                    .map_err(|e| ModscanError::new(ErrorKind::Internal, "corrupt task payload").with_source(e))
            })
            .transpose()
    }

    async fn publish_result(
        &self,
        module_id: &str,
        fingerprint: Fingerprint,
        envelope: ResultEnvelope,
    ) -> Result<(), ModscanError> {
        let mut conn = self.manager.clone();
        let payload = serde_json::to_string(&envelope)
            .map_err(|e| ModscanError::new(ErrorKind::Internal, "failed to serialize result").with_source(e))?;
        redis::cmd("SET")
            .arg(Self::result_key(module_id, fingerprint))
            .arg(payload)
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| ModscanError::new(ErrorKind::Unavailable, "failed to publish result").with_source(e))
    }

    async fn await_result(
        &self,
        module_id: &str,
        fingerprint: Fingerprint,
        task_id: Uuid,
        deadline: DateTime<Utc>,
    ) -> Result<Option<ModuleResult>, ModscanError> {
        let key = Self::result_key(module_id, fingerprint);
        loop {
            let mut conn = self.manager.clone();
            let payload: Option<String> = redis::cmd("GET")
                .arg(&key)
                .query_async(&mut conn)
                .await
                .map_err(|e| ModscanError::new(ErrorKind::Unavailable, "failed to poll result").with_source(e))?;

            if let Some(payload) = payload {
                let envelope: ResultEnvelope = serde_json::from_str(&payload)
                    .map_err(|e| ModscanError::new(ErrorKind::Internal, "corrupt result payload").with_source(e))?;
                if envelope.task_id == task_id {
                    return Ok(Some(envelope.result));
                }
            }

            if Utc::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn write_heartbeat(&self, module_id: &str, at: DateTime<Utc>) -> Result<(), ModscanError> {
        let mut conn = self.manager.clone();
        redis::cmd("SET")
            .arg(Self::heartbeat_key(module_id))
            .arg(at.to_rfc3339())
            .arg("EX")
            .arg(HEARTBEAT_TTL_SECS)
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| ModscanError::new(ErrorKind::Unavailable, "failed to write heartbeat").with_source(e))
    }

    async fn read_heartbeat(&self, module_id: &str) -> Result<Option<DateTime<Utc>>, ModscanError> {
        let mut conn = self.manager.clone();
        let payload: Option<String> = redis::cmd("GET")
            .arg(Self::heartbeat_key(module_id))
            .query_async(&mut conn)
            .await
            .map_err(|e| ModscanError::new(ErrorKind::Unavailable, "failed to read heartbeat").with_source(e))?;
        payload
            .map(|p| {
                DateTime::parse_from_rfc3339(&p)
                    .map(|dt| dt.with_timezone(&Utc))
                    .map_err(|e| ModscanError::new(ErrorKind::Internal, "corrupt heartbeat timestamp").with_source(e))
            })
            .transpose()
    }
}

/// In-process, Redis-free [`QueuePlane`] for unit and executor tests.
pub struct MemoryQueuePlane {
    queues: tokio::sync::Mutex<std::collections::HashMap<String, std::collections::VecDeque<Uuid>>>,
    tasks: tokio::sync::Mutex<std::collections::HashMap<Uuid, Task>>,
    results: tokio::sync::Mutex<std::collections::HashMap<String, ResultEnvelope>>,
    heartbeats: tokio::sync::Mutex<std::collections::HashMap<String, DateTime<Utc>>>,
}

impl MemoryQueuePlane {
    /// Create an empty in-memory queue plane.
    #[must_use]
    pub fn new() -> Self {
        Self {
            queues: tokio::sync::Mutex::new(std::collections::HashMap::new()),
            tasks: tokio::sync::Mutex::new(std::collections::HashMap::new()),
            results: tokio::sync::Mutex::new(std::collections::HashMap::new()),
            heartbeats: tokio::sync::Mutex::new(std::collections::HashMap::new()),
        }
    }

    fn result_key(module_id: &str, fingerprint: Fingerprint) -> String {
        format!("{module_id}:{}", fingerprint.to_hex())
    }
}

impl Default for MemoryQueuePlane {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueuePlane for MemoryQueuePlane {
    async fn enqueue(&self, task: &Task) -> Result<(), ModscanError> {
        self.tasks.lock().await.insert(task.task_id, task.clone());
        self.queues
            .lock()
            .await
            .entry(task.module_id.clone())
            .or_default()
            .push_back(task.task_id);
        Ok(())
    }

    async fn pop(&self, module_id: &str, wait: Duration) -> Result<Option<Uuid>, ModscanError> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if let Some(id) = self
                .queues
                .lock()
                .await
                .get_mut(module_id)
                .and_then(std::collections::VecDeque::pop_front)
            {
                return Ok(Some(id));
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn fetch_task(&self, task_id: Uuid) -> Result<Option<Task>, ModscanError> {
        Ok(self.tasks.lock().await.get(&task_id).cloned())
    }

    async fn publish_result(
        &self,
        module_id: &str,
        fingerprint: Fingerprint,
        envelope: ResultEnvelope,
    ) -> Result<(), ModscanError> {
        self.results
            .lock()
            .await
            .insert(Self::result_key(module_id, fingerprint), envelope);
        Ok(())
    }

    async fn await_result(
        &self,
        module_id: &str,
        fingerprint: Fingerprint,
        task_id: Uuid,
        deadline: DateTime<Utc>,
    ) -> Result<Option<ModuleResult>, ModscanError> {
        let key = Self::result_key(module_id, fingerprint);
        loop {
            if let Some(envelope) = self.results.lock().await.get(&key) {
                if envelope.task_id == task_id {
                    return Ok(Some(envelope.result.clone()));
                }
            }
            if Utc::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn write_heartbeat(&self, module_id: &str, at: DateTime<Utc>) -> Result<(), ModscanError> {
        self.heartbeats.lock().await.insert(module_id.to_string(), at);
        Ok(())
    }

    async fn read_heartbeat(&self, module_id: &str) -> Result<Option<DateTime<Utc>>, ModscanError> {
        Ok(self.heartbeats.lock().await.get(module_id).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modscan_core::TaskState;

    fn task(module_id: &str, fingerprint: Fingerprint) -> Task {
        let now = Utc::now();
        Task {
            task_id: Uuid::new_v4(),
            contract_version: "modscan/v1".into(),
            module_id: module_id.into(),
            fingerprint,
            file_type: modscan_core::FileType::Apk,
            chain_run_id: None,
            step_index: None,
            parameters: serde_json::Value::Null,
            extracted_root: "fp/tree".into(),
            enqueued_at: now,
            deadline: now + chrono::Duration::seconds(30),
            state: TaskState::Queued,
        }
    }

    #[tokio::test]
    async fn enqueue_then_pop_returns_same_task_id() {
        let plane = MemoryQueuePlane::new();
        let t = task("permissions", Fingerprint::of(b"x"));
        plane.enqueue(&t).await.unwrap();

        let popped = plane.pop("permissions", Duration::from_millis(50)).await.unwrap();
        assert_eq!(popped, Some(t.task_id));
    }

    #[tokio::test]
    async fn pop_times_out_on_empty_queue() {
        let plane = MemoryQueuePlane::new();
        let popped = plane.pop("permissions", Duration::from_millis(20)).await.unwrap();
        assert_eq!(popped, None);
    }

    #[tokio::test]
    async fn publish_then_await_result_returns_matching_task_id() {
        let plane = MemoryQueuePlane::new();
        let fp = Fingerprint::of(b"x");
        let task_id = Uuid::new_v4();
        let envelope = ResultEnvelope {
            task_id,
            result: ModuleResult::error("permissions", "1.0.0", task_id, "boom"),
        };
        plane.publish_result("permissions", fp, envelope).await.unwrap();

        let result = plane
            .await_result("permissions", fp, task_id, Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert!(result.is_some());
    }

    #[tokio::test]
    async fn await_result_rejects_stale_task_id() {
        let plane = MemoryQueuePlane::new();
        let fp = Fingerprint::of(b"x");
        let stale_task_id = Uuid::new_v4();
        let envelope = ResultEnvelope {
            task_id: stale_task_id,
            result: ModuleResult::error("permissions", "1.0.0", stale_task_id, "stale"),
        };
        plane.publish_result("permissions", fp, envelope).await.unwrap();

        let deadline = Utc::now() + chrono::Duration::milliseconds(50);
        let result = plane
            .await_result("permissions", fp, Uuid::new_v4(), deadline)
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn fetch_task_returns_none_for_unknown_id() {
        let plane = MemoryQueuePlane::new();
        assert!(plane.fetch_task(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn heartbeat_roundtrips() {
        let plane = MemoryQueuePlane::new();
        assert!(plane.read_heartbeat("permissions").await.unwrap().is_none());
        let now = Utc::now();
        plane.write_heartbeat("permissions", now).await.unwrap();
        assert_eq!(plane.read_heartbeat("permissions").await.unwrap(), Some(now));
    }
}
