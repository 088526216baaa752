use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use super::ApiError;
use crate::models::{ChannelId, OrgId};
use crate::runtime::Runtime;
use crate::tasks::queue::{self, HANDLER_QUEUE};
use crate::tasks::InterruptChannelTask;

#[derive(Debug, Deserialize)]
pub struct InterruptChannelRequest {
    pub org_id: OrgId,
    pub channel_id: ChannelId,
}

/// Queues the interrupt of a channel being released.
pub async fn interrupt(
    State(rt): State<Arc<Runtime>>,
    payload: Result<Json<InterruptChannelRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(req) = payload?;

    let task = InterruptChannelTask {
        channel_id: req.channel_id,
    };
    queue::queue_task(&rt.rp, HANDLER_QUEUE, req.org_id, &task, true).await?;

    info!(org_id = %req.org_id, channel_id = %req.channel_id, "Queued channel interrupt");
    Ok(Json(json!({})))
}
