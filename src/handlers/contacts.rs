use tracing::warn;

use super::{HandlerError, PreWriteHandler};
use crate::event::{Event, EventBody};
use crate::hooks::{GroupChange, HookPayload, PreCommitHook};
use crate::models::assets::OrgAssets;
use crate::models::contact::{ContactUrnsChange, NameUpdate};
use crate::scene::Scene;

/// Handles `contact_groups_changed`. Groups missing from the org's assets,
/// e.g. deleted since the engine ran, are skipped.
pub struct ContactGroupsChanged;

impl PreWriteHandler for ContactGroupsChanged {
    fn name(&self) -> &'static str {
        "contact_groups_changed"
    }

    fn handle(&self, oa: &OrgAssets, scene: &mut Scene, event: &Event) -> Result<(), HandlerError> {
        let EventBody::ContactGroupsChanged { groups_added, groups_removed } = &event.body else {
            return Ok(());
        };

        let added = groups_added.iter().map(|g| (g, true));
        let removed = groups_removed.iter().map(|g| (g, false));

        for (reference, is_add) in added.chain(removed) {
            let Some(group) = oa.group_by_uuid(&reference.uuid) else {
                warn!(
                    group_uuid = %reference.uuid,
                    group_name = %reference.name,
                    contact_id = %scene.contact_id(),
                    "Unable to find group, ignoring membership change"
                );
                continue;
            };
            let change = if is_add {
                GroupChange::Add(group.id)
            } else {
                GroupChange::Remove(group.id)
            };
            scene.append_to_pre_commit(PreCommitHook::UpdateGroups, HookPayload::Group(change));
        }
        Ok(())
    }
}

/// Handles `contact_urns_changed`. The event carries the complete new list.
pub struct ContactUrnsChanged;

impl PreWriteHandler for ContactUrnsChanged {
    fn name(&self) -> &'static str {
        "contact_urns_changed"
    }

    fn handle(&self, _oa: &OrgAssets, scene: &mut Scene, event: &Event) -> Result<(), HandlerError> {
        let EventBody::ContactUrnsChanged { urns } = &event.body else {
            return Ok(());
        };
        let change = ContactUrnsChange {
            contact_id: scene.contact_id(),
            urns: urns.clone(),
        };
        scene.append_to_pre_commit(PreCommitHook::UpdateContactUrns, HookPayload::ContactUrns(change));
        Ok(())
    }
}

pub struct ContactNameChanged;

impl PreWriteHandler for ContactNameChanged {
    fn name(&self) -> &'static str {
        "contact_name_changed"
    }

    fn handle(&self, _oa: &OrgAssets, scene: &mut Scene, event: &Event) -> Result<(), HandlerError> {
        let EventBody::ContactNameChanged { name } = &event.body else {
            return Ok(());
        };
        let update = NameUpdate {
            contact_id: scene.contact_id(),
            name: name.clone(),
        };
        scene.append_to_pre_commit(PreCommitHook::UpdateContactName, HookPayload::ContactName(update));
        Ok(())
    }
}
