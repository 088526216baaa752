//! Hooks which update the contact row and its URNs. Each scene only ever
//! describes one contact, so these keep the last payload per scene.

use async_trait::async_trait;
use sqlx::PgConnection;

use super::{last_per_scene, HookError, HookPayload, PreCommit, PreCommitHook};
use crate::models::assets::OrgAssets;
use crate::models::contact::{self, ContactUrnsChange, CurrentSessionUpdate, LastSeenUpdate, NameUpdate};
use crate::scene::Scene;

pub(super) struct UpdateContactName;

#[async_trait]
impl PreCommit for UpdateContactName {
    async fn apply(
        &self,
        tx: &mut PgConnection,
        _oa: &OrgAssets,
        scenes: &mut [Scene],
    ) -> Result<(), HookError> {
        let updates: Vec<NameUpdate> = last_per_scene(scenes, PreCommitHook::UpdateContactName)
            .filter_map(|p| match p {
                HookPayload::ContactName(update) => Some(update.clone()),
                _ => None,
            })
            .collect();

        contact::update_contact_names(tx, &updates).await?;
        Ok(())
    }
}

pub(super) struct UpdateContactUrns;

#[async_trait]
impl PreCommit for UpdateContactUrns {
    async fn apply(
        &self,
        tx: &mut PgConnection,
        oa: &OrgAssets,
        scenes: &mut [Scene],
    ) -> Result<(), HookError> {
        let changes: Vec<ContactUrnsChange> = last_per_scene(scenes, PreCommitHook::UpdateContactUrns)
            .filter_map(|p| match p {
                HookPayload::ContactUrns(change) => Some(change.clone()),
                _ => None,
            })
            .collect();

        contact::update_contact_urns(tx, oa.org_id(), &contact::latest_urns_by_contact(changes)).await?;
        Ok(())
    }
}

pub(super) struct UpdateContactLastSeen;

#[async_trait]
impl PreCommit for UpdateContactLastSeen {
    async fn apply(
        &self,
        tx: &mut PgConnection,
        _oa: &OrgAssets,
        scenes: &mut [Scene],
    ) -> Result<(), HookError> {
        let updates: Vec<LastSeenUpdate> = last_per_scene(scenes, PreCommitHook::UpdateContactLastSeen)
            .filter_map(|p| match p {
                HookPayload::LastSeen(update) => Some(update.clone()),
                _ => None,
            })
            .collect();

        contact::update_last_seen_on(tx, &updates).await?;
        Ok(())
    }
}

/// Collects the pointer update of each scene, the last one appended winning.
fn current_session_updates(scenes: &[Scene]) -> Vec<CurrentSessionUpdate> {
    last_per_scene(scenes, PreCommitHook::UpdateCurrentSession)
        .filter_map(|p| match p {
            HookPayload::CurrentSession(update) => Some(update.clone()),
            _ => None,
        })
        .collect()
}

pub(super) struct UpdateCurrentSession;

#[async_trait]
impl PreCommit for UpdateCurrentSession {
    async fn apply(
        &self,
        tx: &mut PgConnection,
        _oa: &OrgAssets,
        scenes: &mut [Scene],
    ) -> Result<(), HookError> {
        contact::bulk_update_contact_current_session(tx, &current_session_updates(scenes)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ContactId, FlowId};
    use uuid::Uuid;

    fn pointer(contact_id: ContactId, flow_id: Option<i64>) -> HookPayload {
        HookPayload::CurrentSession(CurrentSessionUpdate {
            contact_id,
            session_uuid: flow_id.map(|_| Uuid::new_v4()),
            flow_id: flow_id.map(FlowId),
        })
    }

    #[test]
    fn test_current_session_last_wins() {
        let mut cathy = Scene::new(ContactId(1), Uuid::new_v4());
        cathy.append_to_pre_commit(PreCommitHook::UpdateCurrentSession, pointer(ContactId(1), Some(10)));
        cathy.append_to_pre_commit(PreCommitHook::UpdateCurrentSession, pointer(ContactId(1), Some(11)));

        let mut bob = Scene::new(ContactId(2), Uuid::new_v4());
        bob.append_to_pre_commit(PreCommitHook::UpdateCurrentSession, pointer(ContactId(2), Some(10)));
        bob.append_to_pre_commit(PreCommitHook::UpdateCurrentSession, pointer(ContactId(2), None));

        let george = Scene::new(ContactId(3), Uuid::new_v4());

        let updates = current_session_updates(&[cathy, bob, george]);
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].contact_id, ContactId(1));
        assert_eq!(updates[0].flow_id, Some(FlowId(11)));
        assert_eq!(updates[1].contact_id, ContactId(2));
        assert_eq!(updates[1].flow_id, None);
        assert_eq!(updates[1].session_uuid, None);
    }
}
