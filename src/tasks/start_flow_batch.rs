use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use super::{RegisteredTask, Task, TaskError};
use crate::config::TasksConfig;
use crate::models::assets::OrgAssets;
use crate::models::contact;
use crate::models::flow_start::StartType;
use crate::models::session::{self, SessionSelector, SessionStatus};
use crate::models::{ContactId, DbContext, FlowId, StartId, UserId};
use crate::runner;
use crate::runtime::Runtime;
use crate::scene::Scene;

/// Starts one batch of a start's recipients in its flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartFlowBatchTask {
    pub start_id: StartId,
    pub start_type: StartType,
    pub flow_id: FlowId,
    pub contact_ids: Vec<ContactId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by_id: Option<UserId>,
}

impl RegisteredTask for StartFlowBatchTask {
    const TYPE: &'static str = "start_flow_batch";
}

#[async_trait]
impl Task for StartFlowBatchTask {
    fn task_type(&self) -> &'static str {
        Self::TYPE
    }

    fn timeout(&self, config: &TasksConfig) -> Duration {
        Duration::from_secs(config.start_flow_timeout_secs)
    }

    async fn perform(&self, rt: &Runtime, oa: &OrgAssets) -> Result<(), TaskError> {
        let flow = oa
            .flow_by_id(self.flow_id)
            .ok_or_else(|| TaskError::Invalid(format!("no flow with id {}", self.flow_id)))?;

        let mut tx = rt.db.begin().await.context("error starting batch transaction")?;
        let interrupted = session::exit_sessions(
            &mut *tx,
            SessionSelector::Contacts(&self.contact_ids),
            SessionStatus::Interrupted,
        )
        .await?;
        tx.commit().await.context("error committing batch interrupts")?;

        let contacts = contact::load_contacts(&rt.db, oa.org_id(), &self.contact_ids).await?;
        let mut scenes = Vec::with_capacity(contacts.len());
        for contact in &contacts {
            match rt
                .engine
                .start_session(&rt.http, oa, flow, contact, self.params.as_ref())
                .await
            {
                Ok(sprint) => {
                    let mut scene = Scene::new(contact.id, contact.uuid).with_session(sprint.session);
                    scene.add_events(sprint.events);
                    scenes.push(scene);
                }
                Err(err) => {
                    warn!(start_id = %self.start_id, contact_id = %contact.id, error = %err, "Error starting session");
                }
            }
        }

        if scenes.is_empty() {
            return Ok(());
        }
        runner::handle_and_commit_events(rt, oa, &mut scenes, true).await?;

        info!(
            start_id = %self.start_id,
            flow_id = %self.flow_id,
            started = scenes.len(),
            interrupted = interrupted.len(),
            "Started batch"
        );
        Ok(())
    }
}
