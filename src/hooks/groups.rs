use async_trait::async_trait;
use sqlx::PgConnection;
use tracing::debug;

use super::{GroupChange, HookError, HookPayload, PreCommit, PreCommitHook};
use crate::models::assets::OrgAssets;
use crate::models::group::{self, GroupMembership};
use crate::scene::Scene;

/// Reduces one scene's group changes to the last change per group, keeping
/// the order groups were first touched in.
///
/// `[+g1, -g1, +g1]` squashes to `[+g1]` and `[+g1, -g1]` to `[-g1]`.
pub fn squash_group_changes(changes: impl IntoIterator<Item = GroupChange>) -> Vec<GroupChange> {
    let mut squashed: Vec<GroupChange> = Vec::new();
    for change in changes {
        match squashed.iter_mut().find(|c| c.group_id() == change.group_id()) {
            Some(existing) => *existing = change,
            None => squashed.push(change),
        }
    }
    squashed
}

/// Splits squashed changes of every scene into one batch of adds and one of
/// removes.
fn memberships(scenes: &[Scene]) -> (Vec<GroupMembership>, Vec<GroupMembership>) {
    let mut adds = Vec::new();
    let mut removes = Vec::new();

    for scene in scenes {
        let changes = scene
            .pre_commit_payloads(PreCommitHook::UpdateGroups)
            .iter()
            .filter_map(|p| match p {
                HookPayload::Group(change) => Some(*change),
                _ => None,
            });

        for change in squash_group_changes(changes) {
            let membership = GroupMembership {
                contact_id: scene.contact_id(),
                group_id: change.group_id(),
            };
            match change {
                GroupChange::Add(_) => adds.push(membership),
                GroupChange::Remove(_) => removes.push(membership),
            }
        }
    }
    (adds, removes)
}

pub(super) struct UpdateGroups;

#[async_trait]
impl PreCommit for UpdateGroups {
    async fn apply(
        &self,
        tx: &mut PgConnection,
        _oa: &OrgAssets,
        scenes: &mut [Scene],
    ) -> Result<(), HookError> {
        let (adds, removes) = memberships(scenes);
        debug!(adds = adds.len(), removes = removes.len(), "Updating group memberships");

        group::add_contacts_to_groups(&mut *tx, &adds).await?;
        group::remove_contacts_from_groups(tx, &removes).await?;
        Ok(())
    }
}
