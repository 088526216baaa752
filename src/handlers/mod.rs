//! Event handler registry.
//!
//! Every event kind can register two handlers:
//!
//! - a [`PreWriteHandler`], run for each event before the scene transaction
//!   opens. It may mutate the scene's session and append hook payloads, but
//!   has no database access.
//! - an [`EventHandler`], run inside the scene transaction. It may read or
//!   write through the transaction (e.g. to create a missing URN) and appends
//!   hook payloads.
//!
//! ```text
//! Event (type: "msg_created")
//!     │
//!     ▼
//! ┌──────────────────────────────────────────┐
//! │            HandlerRegistry               │
//! │                                          │
//! │  pre_write[msg_created]  → clear timeout │
//! │  commit[msg_created]     → build Msg,    │
//! │                            InsertMessages│
//! │                            SendMessages  │
//! └──────────────────────────────────────────┘
//! ```
//!
//! The registry is assembled once at startup with [`HandlerRegistry::builder`]
//! and shared behind an `Arc`; nothing can register after it is built. Events
//! of kinds with no handler are logged and skipped.

mod contacts;
mod flows;
mod msgs;
mod webhooks;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::PgConnection;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::event::{Event, EventKind};
use crate::models::assets::OrgAssets;
use crate::models::DbError;
use crate::scene::Scene;

pub use contacts::{ContactGroupsChanged, ContactNameChanged, ContactUrnsChanged};
pub use flows::{FlowEntered, SessionTriggered};
pub use msgs::{build_msg, MsgCreated, MsgReceived};
pub use webhooks::WebhookCalled;

#[derive(Error, Debug)]
pub enum HandlerError {
    /// An event referenced an asset the org doesn't have
    #[error("no {kind} with uuid {uuid}")]
    AssetNotFound { kind: &'static str, uuid: Uuid },

    #[error(transparent)]
    Db(#[from] DbError),
}

/// Runs before the scene transaction opens.
pub trait PreWriteHandler: Send + Sync {
    fn name(&self) -> &'static str;

    fn handle(&self, oa: &OrgAssets, scene: &mut Scene, event: &Event) -> Result<(), HandlerError>;
}

/// Runs inside the scene transaction.
#[async_trait]
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &'static str;

    async fn handle(
        &self,
        tx: &mut PgConnection,
        oa: &OrgAssets,
        scene: &mut Scene,
        event: &Event,
    ) -> Result<(), HandlerError>;
}

/// Frozen mapping of event kinds to their handlers.
pub struct HandlerRegistry {
    pre_write: HashMap<EventKind, Arc<dyn PreWriteHandler>>,
    commit: HashMap<EventKind, Arc<dyn EventHandler>>,
}

impl HandlerRegistry {
    pub fn builder() -> HandlerRegistryBuilder {
        HandlerRegistryBuilder::default()
    }

    pub fn pre_write_handler(&self, kind: EventKind) -> Option<&Arc<dyn PreWriteHandler>> {
        self.pre_write.get(&kind)
    }

    pub fn commit_handler(&self, kind: EventKind) -> Option<&Arc<dyn EventHandler>> {
        self.commit.get(&kind)
    }

    pub fn has_handlers(&self, kind: EventKind) -> bool {
        self.pre_write.contains_key(&kind) || self.commit.contains_key(&kind)
    }

    /// Kinds with at least one handler, sorted.
    pub fn event_kinds(&self) -> Vec<EventKind> {
        let mut kinds: Vec<EventKind> = self
            .pre_write
            .keys()
            .chain(self.commit.keys())
            .copied()
            .collect();
        kinds.sort();
        kinds.dedup();
        kinds
    }

    /// Runs the pre-write handler for an event, if any.
    pub fn pre_write(&self, oa: &OrgAssets, scene: &mut Scene, event: &Event) -> Result<(), HandlerError> {
        let kind = event.kind();
        if !self.has_handlers(kind) {
            warn!(
                event_type = %kind,
                contact_id = %scene.contact_id(),
                "No handlers registered for event type, skipping"
            );
            return Ok(());
        }

        if let Some(handler) = self.pre_write.get(&kind) {
            debug!(event_type = %kind, handler = handler.name(), "Running pre-write handler");
            handler.handle(oa, scene, event)?;
        }
        Ok(())
    }

    /// Runs the commit handler for an event, if any.
    pub async fn commit(
        &self,
        tx: &mut PgConnection,
        oa: &OrgAssets,
        scene: &mut Scene,
        event: &Event,
    ) -> Result<(), HandlerError> {
        let kind = event.kind();
        if let Some(handler) = self.commit.get(&kind) {
            debug!(event_type = %kind, handler = handler.name(), "Running commit handler");
            handler.handle(tx, oa, scene, event).await?;
        }
        Ok(())
    }
}

/// Collects registrations before the registry is frozen.
#[derive(Default)]
pub struct HandlerRegistryBuilder {
    pre_write: HashMap<EventKind, Arc<dyn PreWriteHandler>>,
    commit: HashMap<EventKind, Arc<dyn EventHandler>>,
}

impl HandlerRegistryBuilder {
    /// Registers the pre-write handler of a kind, replacing any earlier one.
    pub fn pre_write(mut self, kind: EventKind, handler: Arc<dyn PreWriteHandler>) -> Self {
        debug!(event_type = %kind, handler = handler.name(), "Registering pre-write handler");
        if let Some(previous) = self.pre_write.insert(kind, handler) {
            warn!(event_type = %kind, replaced = previous.name(), "Replaced pre-write handler");
        }
        self
    }

    /// Registers the commit handler of a kind, replacing any earlier one.
    pub fn commit(mut self, kind: EventKind, handler: Arc<dyn EventHandler>) -> Self {
        debug!(event_type = %kind, handler = handler.name(), "Registering commit handler");
        if let Some(previous) = self.commit.insert(kind, handler) {
            warn!(event_type = %kind, replaced = previous.name(), "Replaced commit handler");
        }
        self
    }

    pub fn build(self) -> Arc<HandlerRegistry> {
        Arc::new(HandlerRegistry {
            pre_write: self.pre_write,
            commit: self.commit,
        })
    }
}

/// Registry with the handlers for every event kind this crate understands.
pub fn default_registry() -> Arc<HandlerRegistry> {
    HandlerRegistry::builder()
        .pre_write(EventKind::MsgCreated, Arc::new(MsgCreated))
        .commit(EventKind::MsgCreated, Arc::new(MsgCreated))
        .commit(EventKind::MsgReceived, Arc::new(MsgReceived))
        .pre_write(EventKind::ContactGroupsChanged, Arc::new(ContactGroupsChanged))
        .pre_write(EventKind::ContactUrnsChanged, Arc::new(ContactUrnsChanged))
        .pre_write(EventKind::ContactNameChanged, Arc::new(ContactNameChanged))
        .pre_write(EventKind::FlowEntered, Arc::new(FlowEntered))
        .pre_write(EventKind::WebhookCalled, Arc::new(WebhookCalled))
        .commit(EventKind::SessionTriggered, Arc::new(SessionTriggered))
        .build()
}

#[cfg(test)]
pub(crate) mod testdata {
    use super::*;
    use crate::models::session::testdata::waiting_session;
    use crate::models::session::{FlowReference, SessionType};
    use crate::models::ContactId;

    /// Scene for contact 1 with a waiting messaging session in flow 1.
    pub fn scene(oa: &OrgAssets) -> Scene {
        let flow = oa.flow_by_id(crate::models::FlowId(1)).unwrap();
        let session = waiting_session(
            1,
            FlowReference {
                uuid: flow.uuid,
                name: flow.name.clone(),
            },
            SessionType::Messaging,
        );
        Scene::new(ContactId(1), Uuid::new_v4()).with_session(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventBody;
    use crate::hooks::PreCommitHook;
    use crate::models::assets::testdata::org_assets;

    #[test]
    fn test_default_registry() {
        let registry = default_registry();
        assert!(registry.pre_write_handler(EventKind::MsgCreated).is_some());
        assert!(registry.commit_handler(EventKind::MsgCreated).is_some());
        assert!(registry.pre_write_handler(EventKind::MsgReceived).is_none());
        assert!(registry.commit_handler(EventKind::SessionTriggered).is_some());
        assert!(!registry.has_handlers(EventKind::Unknown));
        assert_eq!(registry.event_kinds().len(), 8);
    }

    struct Noop;

    impl PreWriteHandler for Noop {
        fn name(&self) -> &'static str {
            "noop"
        }

        fn handle(&self, _: &OrgAssets, _: &mut Scene, _: &Event) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    #[test]
    fn test_builder_replaces_registration() {
        let registry = HandlerRegistry::builder()
            .pre_write(EventKind::FlowEntered, Arc::new(FlowEntered))
            .pre_write(EventKind::FlowEntered, Arc::new(Noop))
            .build();

        let handler = registry.pre_write_handler(EventKind::FlowEntered).unwrap();
        assert_eq!(handler.name(), "noop");
        assert_eq!(registry.event_kinds(), vec![EventKind::FlowEntered]);
    }

    #[test]
    fn test_unknown_events_are_skipped() {
        let oa = org_assets();
        let mut scene = testdata::scene(&oa);
        let registry = default_registry();

        registry.pre_write(&oa, &mut scene, &Event::new(EventBody::Unknown)).unwrap();
        assert!(scene.pre_commits().is_empty());

        registry
            .pre_write(&oa, &mut scene, &Event::new(EventBody::ContactNameChanged { name: "Cathy".into() }))
            .unwrap();
        assert_eq!(scene.pre_commit_payloads(PreCommitHook::UpdateContactName).len(), 1);
    }
}
