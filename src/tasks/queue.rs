//! Fair per-org task queues in Redis.
//!
//! ```text
//! tasks:<queue>:<org_id>   sorted set of task envelopes, score = queued millis
//! tasks:<queue>:active     sorted set of org ids, score = tasks in flight
//! ```
//!
//! Popping always serves the org with the fewest tasks in flight, so one org
//! queueing thousands of batches can't starve the others. Within an org,
//! tasks come out in score order and high priority tasks are scored ahead of
//! everything queued normally.

use chrono::{DateTime, Utc};
use deadpool_redis::redis::{self, pipe, Script};
use deadpool_redis::Pool;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use super::RegisteredTask;
use crate::models::OrgId;

/// Bulk work such as flow starts and interrupts.
pub const BATCH_QUEUE: &str = "batch";

/// Latency sensitive work.
pub const HANDLER_QUEUE: &str = "handler";

/// Subtracted from the score of high priority tasks. Larger than any epoch
/// millis so they sort before every normal task.
const HIGH_PRIORITY_OFFSET_MS: f64 = 1e13;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("redis pool error: {0}")]
    Pool(#[from] deadpool_redis::PoolError),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("unable to encode task: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid org id in queue: {0}")]
    InvalidOrg(String),
}

/// Wire format of a queued task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    #[serde(rename = "type")]
    pub task_type: String,
    pub task: Value,
    pub queued_on: DateTime<Utc>,
}

/// A task taken off a queue, to be acknowledged with [`done`].
#[derive(Debug, Clone)]
pub struct PoppedTask {
    pub org_id: OrgId,
    pub envelope: TaskEnvelope,
}

pub fn queue_key(queue: &str, org_id: OrgId) -> String {
    format!("tasks:{queue}:{org_id}")
}

pub fn active_key(queue: &str) -> String {
    format!("tasks:{queue}:active")
}

fn score(queued_on: DateTime<Utc>, high_priority: bool) -> f64 {
    let millis = queued_on.timestamp_millis() as f64;
    if high_priority {
        millis - HIGH_PRIORITY_OFFSET_MS
    } else {
        millis
    }
}

/// Encodes a task into its envelope.
pub fn envelope<T: RegisteredTask>(task: &T, queued_on: DateTime<Utc>) -> Result<TaskEnvelope, QueueError> {
    Ok(TaskEnvelope {
        task_type: T::TYPE.to_string(),
        task: serde_json::to_value(task)?,
        queued_on,
    })
}

/// Adds a task to an org's queue and marks the org active.
pub async fn queue_task<T: RegisteredTask>(
    rp: &Pool,
    queue: &str,
    org_id: OrgId,
    task: &T,
    high_priority: bool,
) -> Result<(), QueueError> {
    let now = Utc::now();
    let payload = serde_json::to_string(&envelope(task, now)?)?;

    let mut conn = rp.get().await?;
    // ZINCRBY by 0 adds the org without touching its in-flight count
    let _: () = pipe()
        .atomic()
        .cmd("ZADD")
        .arg(queue_key(queue, org_id))
        .arg(score(now, high_priority))
        .arg(&payload)
        .ignore()
        .cmd("ZINCRBY")
        .arg(active_key(queue))
        .arg(0)
        .arg(org_id.0)
        .ignore()
        .query_async(&mut conn)
        .await?;

    debug!(queue, org_id = %org_id, task_type = T::TYPE, high_priority, "Queued task");
    Ok(())
}

const POP_SCRIPT: &str = r#"
local active = KEYS[1]
local prefix = ARGV[1]
while true do
    local org = redis.call("ZRANGE", active, 0, 0)[1]
    if not org then
        return false
    end
    local popped = redis.call("ZPOPMIN", prefix .. org)
    if #popped == 0 then
        redis.call("ZREM", active, org)
    else
        redis.call("ZINCRBY", active, 1, org)
        return {org, popped[1]}
    end
end
"#;

const DONE_SCRIPT: &str = r#"
local score = redis.call("ZSCORE", KEYS[1], ARGV[1])
if score and tonumber(score) > 0 then
    redis.call("ZINCRBY", KEYS[1], -1, ARGV[1])
end
return 1
"#;

/// Pops the next task of the org with the fewest tasks in flight. Orgs found
/// with empty queues are dropped from the active set along the way.
pub async fn pop(rp: &Pool, queue: &str) -> Result<Option<PoppedTask>, QueueError> {
    let mut conn = rp.get().await?;
    let popped: Option<(String, String)> = Script::new(POP_SCRIPT)
        .key(active_key(queue))
        .arg(format!("tasks:{queue}:"))
        .invoke_async(&mut conn)
        .await?;

    let Some((org, payload)) = popped else {
        return Ok(None);
    };
    let org_id = org
        .parse::<i64>()
        .map(OrgId)
        .map_err(|_| QueueError::InvalidOrg(org.clone()))?;
    let envelope = serde_json::from_str(&payload)?;
    Ok(Some(PoppedTask { org_id, envelope }))
}

/// Marks a popped task of the org as finished.
pub async fn done(rp: &Pool, queue: &str, org_id: OrgId) -> Result<(), QueueError> {
    let mut conn = rp.get().await?;
    let _: i64 = Script::new(DONE_SCRIPT)
        .key(active_key(queue))
        .arg(org_id.0)
        .invoke_async(&mut conn)
        .await?;
    Ok(())
}

/// Number of tasks waiting in an org's queue.
pub async fn size(rp: &Pool, queue: &str, org_id: OrgId) -> Result<u64, QueueError> {
    let mut conn = rp.get().await?;
    let size: u64 = redis::cmd("ZCARD")
        .arg(queue_key(queue, org_id))
        .query_async(&mut conn)
        .await?;
    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::interrupt_sessions::InterruptSessionsTask;
    use crate::models::FlowId;
    use chrono::TimeZone;

    #[test]
    fn test_keys() {
        assert_eq!(queue_key(BATCH_QUEUE, OrgId(12)), "tasks:batch:12");
        assert_eq!(active_key(HANDLER_QUEUE), "tasks:handler:active");
    }

    #[test]
    fn test_high_priority_scores_first() {
        let earlier = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let later = Utc.with_ymd_and_hms(2026, 10, 16, 0, 0, 0).unwrap();

        assert!(score(earlier, false) < score(later, false));
        assert!(score(later, true) < score(earlier, false));
        assert!(score(earlier, true) < score(later, true));
    }

    #[test]
    fn test_envelope_wire_format() {
        let queued_on = Utc.with_ymd_and_hms(2026, 10, 16, 10, 0, 0).unwrap();
        let task = InterruptSessionsTask {
            contact_ids: vec![],
            flow_ids: vec![FlowId(7)],
        };
        let encoded = serde_json::to_value(envelope(&task, queued_on).unwrap()).unwrap();

        assert_eq!(
            encoded,
            serde_json::json!({
                "type": "interrupt_sessions",
                "task": {"contact_ids": [], "flow_ids": [7]},
                "queued_on": "2026-10-16T10:00:00Z",
            })
        );

        let decoded: TaskEnvelope = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded.task_type, "interrupt_sessions");
        assert_eq!(decoded.queued_on, queued_on);
    }
}
