use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{RegisteredTask, Task, TaskError};
use crate::models::assets::OrgAssets;
use crate::models::session::{self, SessionSelector, SessionStatus};
use crate::models::{ContactId, DbContext, FlowId};
use crate::runtime::Runtime;

/// Interrupts the waiting sessions of some contacts and/or of everyone
/// currently in some flows. Messages are left alone.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InterruptSessionsTask {
    #[serde(default)]
    pub contact_ids: Vec<ContactId>,
    #[serde(default)]
    pub flow_ids: Vec<FlowId>,
}

impl RegisteredTask for InterruptSessionsTask {
    const TYPE: &'static str = "interrupt_sessions";
}

#[async_trait]
impl Task for InterruptSessionsTask {
    fn task_type(&self) -> &'static str {
        Self::TYPE
    }

    async fn perform(&self, rt: &Runtime, oa: &OrgAssets) -> Result<(), TaskError> {
        if self.contact_ids.is_empty() && self.flow_ids.is_empty() {
            return Ok(());
        }

        let mut tx = rt.db.begin().await.context("error starting interrupt transaction")?;
        let by_contact = session::exit_sessions(
            &mut *tx,
            SessionSelector::Contacts(&self.contact_ids),
            SessionStatus::Interrupted,
        )
        .await?;
        let by_flow =
            session::exit_sessions(&mut *tx, SessionSelector::Flows(&self.flow_ids), SessionStatus::Interrupted)
                .await?;
        tx.commit().await.context("error committing session interrupts")?;

        info!(
            org_id = %oa.org_id(),
            contacts = self.contact_ids.len(),
            flows = self.flow_ids.len(),
            interrupted = by_contact.len() + by_flow.len(),
            "Interrupted sessions"
        );
        Ok(())
    }
}
