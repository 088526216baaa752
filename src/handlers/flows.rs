use async_trait::async_trait;
use sqlx::PgConnection;
use tracing::{debug, warn};

use super::{EventHandler, HandlerError, PreWriteHandler};
use crate::event::{Event, EventBody};
use crate::hooks::{HookPayload, PostCommitHook, PreCommitHook};
use crate::models::assets::OrgAssets;
use crate::models::contact::{self, CurrentSessionUpdate};
use crate::models::flow_start::{FlowStart, StartType};
use crate::models::GroupId;
use crate::scene::Scene;

/// Handles `flow_entered` by pointing the contact at the session and flow.
pub struct FlowEntered;

impl PreWriteHandler for FlowEntered {
    fn name(&self) -> &'static str {
        "flow_entered"
    }

    fn handle(&self, oa: &OrgAssets, scene: &mut Scene, event: &Event) -> Result<(), HandlerError> {
        let EventBody::FlowEntered { flow } = &event.body else {
            return Ok(());
        };
        let entered = oa
            .flow_by_uuid(&flow.uuid)
            .ok_or(HandlerError::AssetNotFound { kind: "flow", uuid: flow.uuid })?;

        if let Some(session) = scene.session_mut() {
            session.current_flow_id = Some(entered.id);
        }
        let update = CurrentSessionUpdate {
            contact_id: scene.contact_id(),
            session_uuid: scene.session_uuid(),
            flow_id: Some(entered.id),
        };
        scene.append_to_pre_commit(PreCommitHook::UpdateCurrentSession, HookPayload::CurrentSession(update));
        Ok(())
    }
}

/// Handles `session_triggered` by creating a flow start for the recipients the
/// event names. The start is queued once the scene commits.
pub struct SessionTriggered;

#[async_trait]
impl EventHandler for SessionTriggered {
    fn name(&self) -> &'static str {
        "session_triggered"
    }

    async fn handle(
        &self,
        tx: &mut PgConnection,
        oa: &OrgAssets,
        scene: &mut Scene,
        event: &Event,
    ) -> Result<(), HandlerError> {
        let EventBody::SessionTriggered { flow, groups, contacts, urns, contact_query, run_summary } = &event.body
        else {
            return Ok(());
        };

        let target = oa
            .flow_by_uuid(&flow.uuid)
            .ok_or(HandlerError::AssetNotFound { kind: "flow", uuid: flow.uuid })?;

        let group_ids: Vec<GroupId> = groups
            .iter()
            .filter_map(|g| match oa.group_by_uuid(&g.uuid) {
                Some(group) => Some(group.id),
                None => {
                    warn!(group_uuid = %g.uuid, "Unable to find group for triggered session, ignoring");
                    None
                }
            })
            .collect();

        let contact_uuids: Vec<_> = contacts.iter().map(|c| c.uuid).collect();
        let contact_ids = contact::contact_ids_from_uuids(&mut *tx, oa.org_id(), &contact_uuids).await?;

        let mut start = FlowStart::new(oa.org_id(), StartType::FlowAction, target.id);
        start.group_ids = group_ids;
        start.contact_ids = contact_ids;
        start.urns = urns.clone();
        start.query = contact_query.clone();
        start.params = run_summary.clone();

        debug!(flow_uuid = %flow.uuid, start_uuid = %start.uuid, "Session triggered a flow start");
        scene.append_to_pre_commit(PreCommitHook::InsertStarts, HookPayload::FlowStart(start.clone()));
        scene.append_to_post_commit(PostCommitHook::QueueStarts, HookPayload::FlowStart(start));
        Ok(())
    }
}
