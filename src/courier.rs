//! Courier queues.
//!
//! Courier drains one Redis sorted set per channel and priority. Each member
//! is a JSON array of messages for one contact, which courier sends in order.
//! Queue keys embed the channel's throughput so courier can rate limit
//! without loading the channel:
//!
//! ```text
//! msgs:<channel uuid>|<tps>/<priority>    priority 0 = bulk, 1 = high
//! msgs:active                             sorted set of non-empty queue keys
//! ```

use chrono::{DateTime, Utc};
use deadpool_redis::redis::{self, cmd};
use deadpool_redis::Pool;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::models::assets::OrgAssets;
use crate::models::channel::Channel;
use crate::models::msg::Msg;
use crate::models::{ChannelId, ContactId, FlowId, MsgId, OrgId, UrnId};

pub const ACTIVE_QUEUES_KEY: &str = "msgs:active";

const BULK_PRIORITY: u8 = 0;
const HIGH_PRIORITY: u8 = 1;

#[derive(Debug, Error)]
pub enum CourierError {
    #[error("redis pool error: {0}")]
    Pool(#[from] deadpool_redis::PoolError),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("unable to serialize messages: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Key of a channel's queue for the given priority.
pub fn queue_key(channel: &Channel, high_priority: bool) -> String {
    let priority = if high_priority { HIGH_PRIORITY } else { BULK_PRIORITY };
    format!("msgs:{}|{}/{}", channel.uuid, channel.tps(), priority)
}

/// Shape of a message as courier reads it.
#[derive(Debug, Serialize)]
struct CourierMsg<'a> {
    id: MsgId,
    uuid: Uuid,
    org_id: OrgId,
    channel_id: ChannelId,
    channel_uuid: Uuid,
    contact_id: ContactId,
    contact_urn_id: Option<UrnId>,
    urn: &'a str,
    text: &'a str,
    #[serde(skip_serializing_if = "is_empty")]
    attachments: &'a [String],
    #[serde(skip_serializing_if = "is_empty")]
    quick_replies: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    templating: Option<&'a serde_json::Value>,
    high_priority: bool,
    created_on: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    flow_id: Option<FlowId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    session_uuid: Option<Uuid>,
}

fn is_empty(values: &&[String]) -> bool {
    values.is_empty()
}

/// Messages of one contact on one channel queue, sent by courier in order.
#[derive(Debug)]
pub struct Batch<'a> {
    pub channel: &'a Channel,
    pub contact_id: ContactId,
    pub high_priority: bool,
    pub msgs: Vec<&'a Msg>,
}

/// Groups consecutive sendable messages by channel, contact and priority.
/// Messages on unknown or Android channels, or not yet inserted, are skipped.
pub fn batch_messages<'a>(oa: &'a OrgAssets, msgs: &[&'a Msg]) -> Vec<Batch<'a>> {
    let mut batches: Vec<Batch<'a>> = Vec::new();

    for msg in msgs.iter().copied() {
        if !msg.is_sendable() || msg.id.is_none() {
            continue;
        }
        let Some(channel) = msg.channel_id.and_then(|id| oa.channel_by_id(id)) else {
            warn!(msg_uuid = %msg.uuid, "Message channel not found, not queueing");
            continue;
        };
        if channel.is_android() {
            continue;
        }

        let same_batch = batches.last().is_some_and(|b| {
            b.channel.id == channel.id
                && b.contact_id == msg.contact_id
                && b.high_priority == msg.high_priority
        });
        match batches.last_mut() {
            Some(batch) if same_batch => batch.msgs.push(msg),
            _ => batches.push(Batch {
                channel,
                contact_id: msg.contact_id,
                high_priority: msg.high_priority,
                msgs: vec![msg],
            }),
        }
    }
    batches
}

fn encode_batch(batch: &Batch<'_>) -> Result<String, serde_json::Error> {
    let msgs: Vec<CourierMsg<'_>> = batch
        .msgs
        .iter()
        .filter_map(|m| {
            Some(CourierMsg {
                id: m.id?,
                uuid: m.uuid,
                org_id: m.org_id,
                channel_id: batch.channel.id,
                channel_uuid: batch.channel.uuid,
                contact_id: m.contact_id,
                contact_urn_id: m.contact_urn_id,
                urn: m.urn.as_deref()?,
                text: &m.text,
                attachments: &m.attachments,
                quick_replies: &m.quick_replies,
                templating: m.templating.as_ref(),
                high_priority: m.high_priority,
                created_on: m.created_on,
                flow_id: m.flow_id,
                session_uuid: m.session_uuid,
            })
        })
        .collect();
    serde_json::to_string(&msgs)
}

/// Pushes messages onto their courier queues. Returns the number of messages
/// queued.
pub async fn queue_messages(rp: &Pool, oa: &OrgAssets, msgs: &[&Msg]) -> Result<usize, CourierError> {
    let batches = batch_messages(oa, msgs);
    if batches.is_empty() {
        return Ok(0);
    }

    let mut conn = rp.get().await?;
    let score = Utc::now().timestamp_millis();
    let mut queued = 0;

    for batch in &batches {
        let key = queue_key(batch.channel, batch.high_priority);
        let payload = encode_batch(batch)?;

        let _: () = redis::pipe()
            .atomic()
            .cmd("ZADD")
            .arg(&key)
            .arg(score)
            .arg(&payload)
            .ignore()
            .cmd("ZINCRBY")
            .arg(ACTIVE_QUEUES_KEY)
            .arg(0)
            .arg(&key)
            .ignore()
            .query_async(&mut conn)
            .await?;

        queued += batch.msgs.len();
    }

    debug!(org_id = %oa.org_id(), batches = batches.len(), queued, "Queued messages to courier");
    Ok(queued)
}

/// Deletes both of a channel's queues and drops them from the active set.
pub async fn clear_courier_queues(rp: &Pool, channel: &Channel) -> Result<(), CourierError> {
    let bulk = queue_key(channel, false);
    let high = queue_key(channel, true);

    let mut conn = rp.get().await?;
    let _: () = cmd("DEL")
        .arg(&bulk)
        .arg(&high)
        .query_async(&mut conn)
        .await?;
    let _: () = cmd("ZREM")
        .arg(ACTIVE_QUEUES_KEY)
        .arg(&bulk)
        .arg(&high)
        .query_async(&mut conn)
        .await?;

    debug!(channel_uuid = %channel.uuid, "Cleared courier queues");
    Ok(())
}
