//! Scene commit engine.
//!
//! ```text
//! scenes ──► pre-write handlers ──► BEGIN
//!                                    │ insert new sessions
//!                                    │ commit handlers
//!                                    │ pre-commit hooks (once each, all scenes)
//!                                  COMMIT
//!                                    │
//!                                    ▼
//!                             post-commit hooks (errors logged only)
//! ```
//!
//! Any error before `COMMIT` drops the transaction, which rolls it back, and
//! no post-commit hook runs.

use std::collections::BTreeSet;

use thiserror::Error;
use tracing::{debug, error, info};

use crate::event::EventKind;
use crate::handlers::{HandlerError, HandlerRegistry};
use crate::hooks::{HookError, HookPayload, PostCommitHook, PreCommitHook};
use crate::models::assets::OrgAssets;
use crate::models::contact::CurrentSessionUpdate;
use crate::models::session::{self, Session, SessionStatus};
use crate::models::{ContactId, DbContext, DbError};
use crate::runtime::Runtime;
use crate::scene::Scene;

#[derive(Debug, Error)]
pub enum CommitError {
    #[error("error handling {event_type} event for contact {contact_id}: {source}")]
    Handler {
        event_type: EventKind,
        contact_id: ContactId,
        #[source]
        source: HandlerError,
    },

    #[error("error applying {hook} hook: {source}")]
    Hook {
        hook: &'static str,
        #[source]
        source: HookError,
    },

    #[error(transparent)]
    Db(#[from] DbError),
}

/// Durably applies the effects of every scene's events in one transaction,
/// then runs post-commit hooks. `new_sessions` is set when the scenes' sessions
/// were just started and still need inserting.
pub async fn handle_and_commit_events(
    rt: &Runtime,
    oa: &OrgAssets,
    scenes: &mut [Scene],
    new_sessions: bool,
) -> Result<(), CommitError> {
    if scenes.is_empty() {
        return Ok(());
    }

    apply_pre_write(&rt.handlers, oa, scenes)?;
    append_session_pointer_clears(scenes);

    let mut tx = rt.db.begin().await.context("error starting scene transaction")?;

    if new_sessions {
        let sessions: Vec<&Session> = scenes.iter().filter_map(Scene::session).collect();
        session::insert_sessions(&mut *tx, &sessions, |uuid| oa.flow_by_uuid(uuid).map(|f| f.id)).await?;
    }

    for scene in scenes.iter_mut() {
        let events = scene.take_events();
        let mut result = Ok(());
        for event in &events {
            if let Err(source) = rt.handlers.commit(&mut *tx, oa, scene, event).await {
                result = Err(CommitError::Handler {
                    event_type: event.kind(),
                    contact_id: scene.contact_id(),
                    source,
                });
                break;
            }
        }
        scene.restore_events(events);
        result?;
    }

    for hook in pending_pre_commit_hooks(scenes) {
        debug!(hook = hook.name(), scenes = scenes.len(), "Applying pre-commit hook");
        hook.hook()
            .apply(&mut *tx, oa, scenes)
            .await
            .map_err(|source| CommitError::Hook { hook: hook.name(), source })?;
    }

    tx.commit().await.context("error committing scenes")?;

    for hook in pending_post_commit_hooks(scenes) {
        if let Err(e) = hook.hook().apply(rt, oa, scenes).await {
            error!(hook = hook.name(), org_id = %oa.org_id(), error = %e, "Post-commit hook failed");
        }
    }

    info!(org_id = %oa.org_id(), scenes = scenes.len(), "Committed scenes");
    Ok(())
}

/// Runs pre-write handlers over every event of every scene, in order.
pub fn apply_pre_write(registry: &HandlerRegistry, oa: &OrgAssets, scenes: &mut [Scene]) -> Result<(), CommitError> {
    for scene in scenes.iter_mut() {
        let contact_id = scene.contact_id();
        let events = scene.take_events();
        let result = events.iter().try_for_each(|event| {
            registry
                .pre_write(oa, scene, event)
                .map_err(|source| CommitError::Handler {
                    event_type: event.kind(),
                    contact_id,
                    source,
                })
        });
        scene.restore_events(events);
        result?;
    }
    Ok(())
}

/// Points contacts whose session is no longer waiting at no session at all.
fn append_session_pointer_clears(scenes: &mut [Scene]) {
    for scene in scenes.iter_mut() {
        let ended = scene
            .session()
            .is_some_and(|s| s.status() != SessionStatus::Waiting);
        if ended {
            let update = CurrentSessionUpdate {
                contact_id: scene.contact_id(),
                session_uuid: None,
                flow_id: None,
            };
            scene.append_to_pre_commit(PreCommitHook::UpdateCurrentSession, HookPayload::CurrentSession(update));
        }
    }
}

/// Pre-commit hooks with at least one payload in any scene, in execution order.
fn pending_pre_commit_hooks(scenes: &[Scene]) -> BTreeSet<PreCommitHook> {
    scenes
        .iter()
        .flat_map(|s| s.pre_commits().iter())
        .filter(|(_, payloads)| !payloads.is_empty())
        .map(|(hook, _)| *hook)
        .collect()
}

fn pending_post_commit_hooks(scenes: &[Scene]) -> BTreeSet<PostCommitHook> {
    scenes
        .iter()
        .flat_map(|s| s.post_commits().iter())
        .filter(|(_, payloads)| !payloads.is_empty())
        .map(|(hook, _)| *hook)
        .collect()
}
