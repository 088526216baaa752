//! Commit hooks.
//!
//! Handlers never write to the database directly. They append payloads to
//! the hooks of their [`Scene`], and once every event of every scene in a
//! pass has been handled, each hook runs exactly once over the payloads of
//! all scenes. A pass over 100 scenes adding contacts to groups therefore
//! costs one `INSERT`, not 100.
//!
//! ```text
//!  scene A: UpdateGroups [+g1, -g1, +g2]   InsertMessages [m1]
//!  scene B: UpdateGroups [-g1]             InsertMessages [m2, m3]
//!                 │                               │
//!                 ▼                               ▼
//!   UpdateGroups.apply(A, B)         InsertMessages.apply(A, B)
//!   one INSERT + one DELETE          one INSERT of m1, m2, m3
//! ```
//!
//! Pre-commit hooks run inside the scene transaction in the order their
//! [`PreCommitHook`] variants are declared, which follows row dependencies:
//! URNs and contacts first, messages after the session pointers they
//! reference. Post-commit hooks run after the transaction commits and only
//! log their failures.

mod contacts;
mod groups;
mod msgs;
mod starts;
mod webhooks;

use async_trait::async_trait;
use sqlx::PgConnection;
use thiserror::Error;

use crate::courier::CourierError;
use crate::models::assets::OrgAssets;
use crate::models::contact::{ContactUrnsChange, CurrentSessionUpdate, LastSeenUpdate, NameUpdate};
use crate::models::flow_start::FlowStart;
use crate::models::http_log::{HttpLog, WebhookResult};
use crate::models::msg::Msg;
use crate::models::resthook::ResthookUnsubscribe;
use crate::models::{DbError, GroupId};
use crate::runtime::Runtime;
use crate::scene::Scene;
use crate::tasks::queue::QueueError;

pub use groups::squash_group_changes;

#[derive(Debug, Error)]
pub enum HookError {
    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Courier(#[from] CourierError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Hooks run inside the scene transaction. Declaration order is execution
/// order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PreCommitHook {
    UpdateContactName,
    UpdateContactUrns,
    UpdateContactLastSeen,
    UpdateGroups,
    UpdateCurrentSession,
    InsertMessages,
    InsertHttpLogs,
    InsertWebhookResults,
    UnsubscribeResthooks,
    InsertStarts,
}

impl PreCommitHook {
    pub fn name(self) -> &'static str {
        match self {
            Self::UpdateContactName => "update_contact_name",
            Self::UpdateContactUrns => "update_contact_urns",
            Self::UpdateContactLastSeen => "update_contact_last_seen",
            Self::UpdateGroups => "update_groups",
            Self::UpdateCurrentSession => "update_current_session",
            Self::InsertMessages => "insert_messages",
            Self::InsertHttpLogs => "insert_http_logs",
            Self::InsertWebhookResults => "insert_webhook_results",
            Self::UnsubscribeResthooks => "unsubscribe_resthooks",
            Self::InsertStarts => "insert_starts",
        }
    }

    pub(crate) fn hook(self) -> &'static dyn PreCommit {
        match self {
            Self::UpdateContactName => &contacts::UpdateContactName,
            Self::UpdateContactUrns => &contacts::UpdateContactUrns,
            Self::UpdateContactLastSeen => &contacts::UpdateContactLastSeen,
            Self::UpdateGroups => &groups::UpdateGroups,
            Self::UpdateCurrentSession => &contacts::UpdateCurrentSession,
            Self::InsertMessages => &msgs::InsertMessages,
            Self::InsertHttpLogs => &webhooks::InsertHttpLogs,
            Self::InsertWebhookResults => &webhooks::InsertWebhookResults,
            Self::UnsubscribeResthooks => &webhooks::UnsubscribeResthooks,
            Self::InsertStarts => &starts::InsertStarts,
        }
    }
}

/// Hooks run after the scene transaction has committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PostCommitHook {
    SendMessages,
    QueueStarts,
}

impl PostCommitHook {
    pub fn name(self) -> &'static str {
        match self {
            Self::SendMessages => "send_messages",
            Self::QueueStarts => "queue_starts",
        }
    }

    pub(crate) fn hook(self) -> &'static dyn PostCommit {
        match self {
            Self::SendMessages => &msgs::SendMessages,
            Self::QueueStarts => &starts::QueueStarts,
        }
    }
}

/// A membership change of the scene's contact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupChange {
    Add(GroupId),
    Remove(GroupId),
}

impl GroupChange {
    pub fn group_id(self) -> GroupId {
        match self {
            Self::Add(id) | Self::Remove(id) => id,
        }
    }
}

/// Value appended to a hook. Each hook only reads its own variant.
#[derive(Debug, Clone)]
pub enum HookPayload {
    ContactName(NameUpdate),
    ContactUrns(ContactUrnsChange),
    LastSeen(LastSeenUpdate),
    Group(GroupChange),
    CurrentSession(CurrentSessionUpdate),
    Msg(Msg),
    HttpLog(HttpLog),
    WebhookResult(WebhookResult),
    ResthookUnsubscribe(ResthookUnsubscribe),
    FlowStart(FlowStart),
}

#[async_trait]
pub trait PreCommit: Send + Sync {
    async fn apply(
        &self,
        tx: &mut PgConnection,
        oa: &OrgAssets,
        scenes: &mut [Scene],
    ) -> Result<(), HookError>;
}

#[async_trait]
pub trait PostCommit: Send + Sync {
    async fn apply(&self, rt: &Runtime, oa: &OrgAssets, scenes: &[Scene]) -> Result<(), HookError>;
}

/// Payloads of a pre-commit hook across scenes, in scene then append order.
fn pre_commit_payloads(
    scenes: &[Scene],
    hook: PreCommitHook,
) -> impl Iterator<Item = (&Scene, &HookPayload)> {
    scenes
        .iter()
        .flat_map(move |s| s.pre_commit_payloads(hook).iter().map(move |p| (s, p)))
}

fn post_commit_payloads(
    scenes: &[Scene],
    hook: PostCommitHook,
) -> impl Iterator<Item = (&Scene, &HookPayload)> {
    scenes
        .iter()
        .flat_map(move |s| s.post_commit_payloads(hook).iter().map(move |p| (s, p)))
}

/// The last payload each scene appended to a hook.
fn last_per_scene(scenes: &[Scene], hook: PreCommitHook) -> impl Iterator<Item = &HookPayload> {
    scenes
        .iter()
        .filter_map(move |s| s.pre_commit_payloads(hook).last())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pre_commit_order() {
        let mut hooks = vec![
            PreCommitHook::InsertStarts,
            PreCommitHook::InsertMessages,
            PreCommitHook::UpdateGroups,
            PreCommitHook::UnsubscribeResthooks,
            PreCommitHook::UpdateContactUrns,
            PreCommitHook::UpdateCurrentSession,
            PreCommitHook::InsertHttpLogs,
        ];
        hooks.sort();
        assert_eq!(
            hooks,
            vec![
                PreCommitHook::UpdateContactUrns,
                PreCommitHook::UpdateGroups,
                PreCommitHook::UpdateCurrentSession,
                PreCommitHook::InsertMessages,
                PreCommitHook::InsertHttpLogs,
                PreCommitHook::UnsubscribeResthooks,
                PreCommitHook::InsertStarts,
            ]
        );
        assert!(PostCommitHook::SendMessages < PostCommitHook::QueueStarts);
    }

    #[test]
    fn test_group_change_id() {
        assert_eq!(GroupChange::Add(GroupId(3)).group_id(), GroupId(3));
        assert_eq!(GroupChange::Remove(GroupId(4)).group_id(), GroupId(4));
    }
}
