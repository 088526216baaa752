use async_trait::async_trait;
use sqlx::PgConnection;

use super::{pre_commit_payloads, HookError, HookPayload, PreCommit, PreCommitHook};
use crate::models::assets::OrgAssets;
use crate::models::http_log::{self, HttpLog, WebhookResult};
use crate::models::resthook::{self, ResthookUnsubscribe};
use crate::scene::Scene;

pub(super) struct InsertHttpLogs;

#[async_trait]
impl PreCommit for InsertHttpLogs {
    async fn apply(
        &self,
        tx: &mut PgConnection,
        _oa: &OrgAssets,
        scenes: &mut [Scene],
    ) -> Result<(), HookError> {
        let logs: Vec<HttpLog> = pre_commit_payloads(scenes, PreCommitHook::InsertHttpLogs)
            .filter_map(|(_, p)| match p {
                HookPayload::HttpLog(log) => Some(log.clone()),
                _ => None,
            })
            .collect();

        http_log::insert_http_logs(tx, &logs).await?;
        Ok(())
    }
}

pub(super) struct InsertWebhookResults;

#[async_trait]
impl PreCommit for InsertWebhookResults {
    async fn apply(
        &self,
        tx: &mut PgConnection,
        _oa: &OrgAssets,
        scenes: &mut [Scene],
    ) -> Result<(), HookError> {
        let results: Vec<WebhookResult> = pre_commit_payloads(scenes, PreCommitHook::InsertWebhookResults)
            .filter_map(|(_, p)| match p {
                HookPayload::WebhookResult(result) => Some(result.clone()),
                _ => None,
            })
            .collect();

        http_log::insert_webhook_results(tx, &results).await?;
        Ok(())
    }
}

pub(super) struct UnsubscribeResthooks;

#[async_trait]
impl PreCommit for UnsubscribeResthooks {
    async fn apply(
        &self,
        tx: &mut PgConnection,
        _oa: &OrgAssets,
        scenes: &mut [Scene],
    ) -> Result<(), HookError> {
        let unsubs: Vec<ResthookUnsubscribe> = pre_commit_payloads(scenes, PreCommitHook::UnsubscribeResthooks)
            .filter_map(|(_, p)| match p {
                HookPayload::ResthookUnsubscribe(unsub) => Some(unsub.clone()),
                _ => None,
            })
            .collect();

        resthook::unsubscribe_resthooks(tx, unsubs).await?;
        Ok(())
    }
}
