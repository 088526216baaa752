use async_trait::async_trait;
use sqlx::PgConnection;
use tracing::{debug, warn};

use super::{post_commit_payloads, pre_commit_payloads, HookError, HookPayload};
use super::{PostCommit, PostCommitHook, PreCommit, PreCommitHook};
use crate::models::assets::OrgAssets;
use crate::models::flow_start::{self, FlowStart};
use crate::runtime::Runtime;
use crate::scene::{AssignedIds, Scene};
use crate::tasks::queue::{self, BATCH_QUEUE};
use crate::tasks::start_flow::StartFlowTask;

/// Persists starts created by `session_triggered` events.
pub(super) struct InsertStarts;

#[async_trait]
impl PreCommit for InsertStarts {
    async fn apply(
        &self,
        tx: &mut PgConnection,
        _oa: &OrgAssets,
        scenes: &mut [Scene],
    ) -> Result<(), HookError> {
        let mut starts: Vec<FlowStart> = pre_commit_payloads(scenes, PreCommitHook::InsertStarts)
            .filter_map(|(_, p)| match p {
                HookPayload::FlowStart(start) => Some(start.clone()),
                _ => None,
            })
            .collect();

        flow_start::insert_flow_starts(tx, &mut starts).await?;

        let ids = AssignedIds {
            starts: starts.iter().filter_map(|s| Some((s.uuid, s.id?))).collect(),
            ..Default::default()
        };
        for scene in scenes.iter_mut() {
            scene.propagate_ids(&ids);
        }
        Ok(())
    }
}

/// Queues a start_flow task for each inserted start.
pub(super) struct QueueStarts;

#[async_trait]
impl PostCommit for QueueStarts {
    async fn apply(&self, rt: &Runtime, oa: &OrgAssets, scenes: &[Scene]) -> Result<(), HookError> {
        for (scene, payload) in post_commit_payloads(scenes, PostCommitHook::QueueStarts) {
            let HookPayload::FlowStart(start) = payload else {
                continue;
            };
            if start.id.is_none() {
                warn!(contact_id = %scene.contact_id(), start_uuid = %start.uuid, "Start was never inserted, not queueing");
                continue;
            }

            let task = StartFlowTask { start: start.clone() };
            queue::queue_task(&rt.rp, BATCH_QUEUE, oa.org_id(), &task, false).await?;
            debug!(start_uuid = %start.uuid, "Queued start triggered by session");
        }
        Ok(())
    }
}
