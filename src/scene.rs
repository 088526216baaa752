//! Per-contact commit context.

use std::collections::{BTreeMap, HashMap};

use uuid::Uuid;

use crate::event::Event;
use crate::hooks::{HookPayload, PostCommitHook, PreCommitHook};
use crate::models::session::Session;
use crate::models::{ContactId, MsgId, StartId};

/// Ids assigned by inserts, keyed by the UUID of the inserted value.
#[derive(Debug, Default)]
pub struct AssignedIds {
    pub msgs: HashMap<Uuid, MsgId>,
    pub starts: HashMap<Uuid, StartId>,
}

/// Everything one contact's pass through the engine needs committed.
///
/// A scene owns its session for the duration of the pass. Handlers mutate the
/// session through [`Scene::session_mut`] and queue their writes as hook
/// payloads; nothing is written until the runner applies the hooks.
#[derive(Debug)]
pub struct Scene {
    contact_id: ContactId,
    contact_uuid: Uuid,
    session: Option<Session>,
    events: Vec<Event>,
    pre_commits: BTreeMap<PreCommitHook, Vec<HookPayload>>,
    post_commits: BTreeMap<PostCommitHook, Vec<HookPayload>>,
}

impl Scene {
    pub fn new(contact_id: ContactId, contact_uuid: Uuid) -> Self {
        Self {
            contact_id,
            contact_uuid,
            session: None,
            events: Vec::new(),
            pre_commits: BTreeMap::new(),
            post_commits: BTreeMap::new(),
        }
    }

    pub fn with_session(mut self, session: Session) -> Self {
        self.session = Some(session);
        self
    }

    pub fn contact_id(&self) -> ContactId {
        self.contact_id
    }

    pub fn contact_uuid(&self) -> Uuid {
        self.contact_uuid
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn session_mut(&mut self) -> Option<&mut Session> {
        self.session.as_mut()
    }

    pub fn session_uuid(&self) -> Option<Uuid> {
        self.session.as_ref().map(|s| s.uuid)
    }

    /// Queues events emitted by the engine, keeping emission order.
    pub fn add_events(&mut self, events: impl IntoIterator<Item = Event>) {
        self.events.extend(events);
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub(crate) fn take_events(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.events)
    }

    pub(crate) fn restore_events(&mut self, events: Vec<Event>) {
        self.events = events;
    }

    pub fn append_to_pre_commit(&mut self, hook: PreCommitHook, payload: HookPayload) {
        self.pre_commits.entry(hook).or_default().push(payload);
    }

    pub fn append_to_post_commit(&mut self, hook: PostCommitHook, payload: HookPayload) {
        self.post_commits.entry(hook).or_default().push(payload);
    }

    /// Pre-commit payloads by hook, iterating in execution order.
    pub fn pre_commits(&self) -> &BTreeMap<PreCommitHook, Vec<HookPayload>> {
        &self.pre_commits
    }

    pub fn post_commits(&self) -> &BTreeMap<PostCommitHook, Vec<HookPayload>> {
        &self.post_commits
    }

    pub fn pre_commit_payloads(&self, hook: PreCommitHook) -> &[HookPayload] {
        self.pre_commits.get(&hook).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn post_commit_payloads(&self, hook: PostCommitHook) -> &[HookPayload] {
        self.post_commits.get(&hook).map(Vec::as_slice).unwrap_or_default()
    }

    /// Copies ids assigned at insert time onto every payload carrying the same
    /// message or start, so post-commit hooks see persisted ids.
    pub fn propagate_ids(&mut self, ids: &AssignedIds) {
        let payloads = self
            .pre_commits
            .values_mut()
            .chain(self.post_commits.values_mut())
            .flatten();

        for payload in payloads {
            match payload {
                HookPayload::Msg(msg) => {
                    if let Some(id) = ids.msgs.get(&msg.uuid) {
                        msg.id = Some(*id);
                    }
                }
                HookPayload::FlowStart(start) => {
                    if let Some(id) = ids.starts.get(&start.uuid) {
                        start.id = Some(*id);
                    }
                }
                _ => {}
            }
        }
    }
}
