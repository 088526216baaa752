use async_trait::async_trait;
use sqlx::PgConnection;
use tracing::debug;

use super::{post_commit_payloads, pre_commit_payloads, HookError, HookPayload};
use super::{PostCommit, PostCommitHook, PreCommit, PreCommitHook};
use crate::courier;
use crate::db::{BulkRow, MAX_BIND_PARAMS};
use crate::models::assets::OrgAssets;
use crate::models::msg::{self, Msg};
use crate::runtime::Runtime;
use crate::scene::{AssignedIds, Scene};

pub(super) struct InsertMessages;

#[async_trait]
impl PreCommit for InsertMessages {
    async fn apply(
        &self,
        tx: &mut PgConnection,
        _oa: &OrgAssets,
        scenes: &mut [Scene],
    ) -> Result<(), HookError> {
        let mut msgs: Vec<Msg> = pre_commit_payloads(scenes, PreCommitHook::InsertMessages)
            .filter_map(|(_, p)| match p {
                HookPayload::Msg(msg) => Some(msg.clone()),
                _ => None,
            })
            .collect();

        for chunk in msgs.chunks_mut(MAX_BIND_PARAMS / Msg::COLUMNS) {
            msg::insert_messages(&mut *tx, chunk).await?;
        }

        let ids = AssignedIds {
            msgs: msgs.iter().filter_map(|m| Some((m.uuid, m.id?))).collect(),
            ..Default::default()
        };
        for scene in scenes.iter_mut() {
            scene.propagate_ids(&ids);
        }

        debug!(count = msgs.len(), "Inserted messages");
        Ok(())
    }
}

/// Hands inserted messages to courier.
pub(super) struct SendMessages;

#[async_trait]
impl PostCommit for SendMessages {
    async fn apply(&self, rt: &Runtime, oa: &OrgAssets, scenes: &[Scene]) -> Result<(), HookError> {
        let msgs: Vec<&Msg> = post_commit_payloads(scenes, PostCommitHook::SendMessages)
            .filter_map(|(_, p)| match p {
                HookPayload::Msg(msg) => Some(msg),
                _ => None,
            })
            .collect();

        courier::queue_messages(&rt.rp, oa, &msgs).await?;
        Ok(())
    }
}
