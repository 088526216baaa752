use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{RegisteredTask, Task, TaskError};
use crate::courier;
use crate::models::assets::{OrgAssets, Refresh};
use crate::models::channel;
use crate::models::msg::{self, FailedReason};
use crate::models::session::{self, SessionSelector, SessionStatus};
use crate::models::{ChannelId, DbContext};
use crate::runtime::Runtime;

/// Interrupts everything in flight on a channel which is being released:
/// live calls, the sessions bound to them, queued courier messages and
/// unsent messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterruptChannelTask {
    pub channel_id: ChannelId,
}

impl RegisteredTask for InterruptChannelTask {
    const TYPE: &'static str = "interrupt_channel";
}

#[async_trait]
impl Task for InterruptChannelTask {
    fn task_type(&self) -> &'static str {
        Self::TYPE
    }

    fn with_assets(&self) -> Refresh {
        Refresh::Channels
    }

    async fn perform(&self, rt: &Runtime, oa: &OrgAssets) -> Result<(), TaskError> {
        // the channel may already be inactive and gone from assets
        let channel = channel::get_channel_by_id(&rt.db, self.channel_id).await?;
        if channel.org_id != oa.org_id() {
            return Err(TaskError::Invalid(format!(
                "channel {} does not belong to org {}",
                channel.id,
                oa.org_id()
            )));
        }

        let mut tx = rt.db.begin().await.context("error starting interrupt transaction")?;
        let calls = session::interrupt_channel_calls(&mut *tx, channel.id).await?;
        let sessions =
            session::exit_sessions(&mut *tx, SessionSelector::Channel(channel.id), SessionStatus::Interrupted).await?;
        tx.commit().await.context("error committing channel interrupt")?;

        courier::clear_courier_queues(&rt.rp, &channel).await?;

        let failed = msg::fail_channel_messages(&rt.db, oa.org_id(), channel.id, FailedReason::ChannelRemoved).await?;

        info!(
            org_id = %oa.org_id(),
            channel_id = %channel.id,
            calls,
            sessions = sessions.len(),
            failed_msgs = failed,
            "Interrupted channel"
        );
        Ok(())
    }
}
