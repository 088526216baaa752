use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{EventHandler, HandlerError, PreWriteHandler};
use crate::event::{Event, EventBody, MsgOut};
use crate::hooks::{HookPayload, PostCommitHook, PreCommitHook};
use crate::models::assets::OrgAssets;
use crate::models::channel::Channel;
use crate::models::contact::{self, LastSeenUpdate, Urn};
use crate::models::msg::{Direction, FailedReason, Msg, MsgStatus};
use crate::models::session::SessionType;
use crate::models::DbError;
use crate::scene::Scene;

/// Builds the outgoing message for a `msg_created` event.
///
/// The flow is found through the run owning the event's step. A message with
/// no channel or no URN is still persisted, but failed with no destination.
pub fn build_msg(
    oa: &OrgAssets,
    scene: &Scene,
    created_on: DateTime<Utc>,
    step_uuid: Option<Uuid>,
    msg: &MsgOut,
    channel: Option<&Channel>,
    urn: Option<&Urn>,
) -> Result<Msg, HandlerError> {
    let flow_id = match scene
        .session()
        .zip(step_uuid)
        .and_then(|(session, step)| session.find_step(&step))
    {
        Some((run, _)) => Some(
            oa.flow_by_uuid(&run.flow.uuid)
                .ok_or(HandlerError::AssetNotFound { kind: "flow", uuid: run.flow.uuid })?
                .id,
        ),
        None => None,
    };

    let template_id = match &msg.templating {
        Some(templating) => {
            let uuid = templating.template.uuid;
            Some(
                oa.template_by_uuid(&uuid)
                    .ok_or(HandlerError::AssetNotFound { kind: "template", uuid })?
                    .id,
            )
        }
        None => None,
    };

    let mut out = Msg {
        id: None,
        uuid: msg.uuid,
        org_id: oa.org_id(),
        direction: Direction::Outgoing,
        channel_id: channel.map(|c| c.id),
        contact_id: scene.contact_id(),
        contact_urn_id: urn.and_then(|u| u.id),
        urn: urn.map(Urn::identity),
        text: msg.text.clone(),
        attachments: msg.attachments.clone(),
        quick_replies: msg.quick_replies.clone(),
        templating: msg
            .templating
            .as_ref()
            .and_then(|t| serde_json::to_value(t).ok()),
        template_id,
        status: MsgStatus::Queued,
        failed_reason: None,
        high_priority: false,
        created_on,
        flow_id,
        session_uuid: scene.session_uuid(),
    };

    if channel.is_none() || urn.is_none() {
        out.fail(FailedReason::NoDestination);
    }
    Ok(out)
}

/// Handles `msg_created`.
pub struct MsgCreated;

impl PreWriteHandler for MsgCreated {
    fn name(&self) -> &'static str {
        "msg_created"
    }

    /// Courier starts the wait timeout once the message is wired, so the
    /// engine's timeout is dropped. Android channels have no courier leg and
    /// keep it.
    fn handle(&self, oa: &OrgAssets, scene: &mut Scene, event: &Event) -> Result<(), HandlerError> {
        let EventBody::MsgCreated { msg } = &event.body else {
            return Ok(());
        };
        let Some(session) = scene.session_mut() else {
            return Ok(());
        };
        if session.session_type() != SessionType::Messaging {
            return Ok(());
        }

        let channel = msg.channel.as_ref().and_then(|c| oa.channel_by_uuid(&c.uuid));
        if channel.is_some_and(|c| !c.is_android()) {
            session.clear_wait_timeout();
        }
        Ok(())
    }
}

#[async_trait]
impl EventHandler for MsgCreated {
    fn name(&self) -> &'static str {
        "msg_created"
    }

    async fn handle(
        &self,
        tx: &mut PgConnection,
        oa: &OrgAssets,
        scene: &mut Scene,
        event: &Event,
    ) -> Result<(), HandlerError> {
        let EventBody::MsgCreated { msg } = &event.body else {
            return Ok(());
        };

        let channel = match &msg.channel {
            Some(reference) => Some(oa.channel_by_uuid(&reference.uuid).ok_or(
                HandlerError::AssetNotFound { kind: "channel", uuid: reference.uuid },
            )?),
            None => None,
        };

        let mut urn = msg.urn.clone();
        if let Some(pending) = urn.clone().filter(Urn::needs_id) {
            match contact::get_or_create_urn(tx, oa.org_id(), scene.contact_id(), &pending).await {
                Ok(id) => {
                    debug!(urn = %pending.identity(), urn_id = %id, "Created missing contact urn");
                    urn = Some(pending.with_id(id));
                }
                Err(DbError::UrnTaken { owner, .. }) => {
                    warn!(urn = %pending.identity(), owner = %owner, contact_id = %scene.contact_id(), "URN belongs to another contact");
                    urn = None;
                }
                Err(err) => return Err(err.into()),
            }
        }

        let out = build_msg(oa, scene, event.created_on, event.step_uuid, msg, channel, urn.as_ref())?;
        scene.append_to_pre_commit(PreCommitHook::InsertMessages, HookPayload::Msg(out.clone()));
        scene.append_to_post_commit(PostCommitHook::SendMessages, HookPayload::Msg(out));
        Ok(())
    }
}

/// Handles `msg_received` by recording when the contact was last seen.
pub struct MsgReceived;

#[async_trait]
impl EventHandler for MsgReceived {
    fn name(&self) -> &'static str {
        "msg_received"
    }

    async fn handle(
        &self,
        _tx: &mut PgConnection,
        _oa: &OrgAssets,
        scene: &mut Scene,
        event: &Event,
    ) -> Result<(), HandlerError> {
        let update = LastSeenUpdate {
            contact_id: scene.contact_id(),
            last_seen_on: event.created_on,
        };
        scene.append_to_pre_commit(PreCommitHook::UpdateContactLastSeen, HookPayload::LastSeen(update));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{ChannelReference, TemplateReference, Templating};
    use crate::handlers::testdata::scene;
    use crate::models::assets::testdata::org_assets;
    use crate::models::{ChannelId, FlowId, TemplateId, UrnId};

    fn msg_out(channel: Option<&Channel>) -> MsgOut {
        MsgOut {
            uuid: Uuid::new_v4(),
            urn: Some("tel:+250700000000".parse().unwrap()),
            channel: channel.map(|c| ChannelReference { uuid: c.uuid, name: c.name.clone() }),
            text: "Hi there".to_string(),
            attachments: vec![],
            quick_replies: vec![],
            templating: None,
        }
    }

    fn msg_created(msg: MsgOut) -> Event {
        Event::new(EventBody::MsgCreated { msg })
    }

    #[test]
    fn test_clears_wait_timeout_for_courier_channels() {
        let oa = org_assets();
        let twilio = oa.channel_by_id(ChannelId(10)).unwrap();
        let mut scene = scene(&oa);

        PreWriteHandler::handle(&MsgCreated, &oa, &mut scene, &msg_created(msg_out(Some(twilio)))).unwrap();
        assert!(scene.session().unwrap().wait_timeout.is_none());
    }

    #[test]
    fn test_keeps_wait_timeout_for_android_and_voice() {
        let oa = org_assets();
        let android = oa.channel_by_id(ChannelId(11)).unwrap();
        let mut scene = scene(&oa);

        PreWriteHandler::handle(&MsgCreated, &oa, &mut scene, &msg_created(msg_out(Some(android)))).unwrap();
        assert!(scene.session().unwrap().wait_timeout.is_some());

        let twilio = oa.channel_by_id(ChannelId(10)).unwrap();
        scene.session_mut().unwrap().session_type = SessionType::Voice;
        PreWriteHandler::handle(&MsgCreated, &oa, &mut scene, &msg_created(msg_out(Some(twilio)))).unwrap();
        assert!(scene.session().unwrap().wait_timeout.is_some());
    }

    #[test]
    fn test_build_msg() {
        let oa = org_assets();
        let twilio = oa.channel_by_id(ChannelId(10)).unwrap();
        let scene = scene(&oa);
        let step = scene.session().unwrap().runs[0].path[0].uuid;
        let out = msg_out(Some(twilio));
        let urn = out.urn.clone().unwrap().with_id(UrnId(23));

        let msg = build_msg(&oa, &scene, Utc::now(), Some(step), &out, Some(twilio), Some(&urn)).unwrap();
        assert_eq!(msg.uuid, out.uuid);
        assert_eq!(msg.status, MsgStatus::Queued);
        assert_eq!(msg.channel_id, Some(ChannelId(10)));
        assert_eq!(msg.contact_urn_id, Some(UrnId(23)));
        assert_eq!(msg.urn.as_deref(), Some("tel:+250700000000"));
        assert_eq!(msg.flow_id, Some(FlowId(1)));
        assert_eq!(msg.session_uuid, scene.session_uuid());
        assert!(msg.is_sendable());
    }

    #[test]
    fn test_build_msg_without_destination() {
        let oa = org_assets();
        let scene = scene(&oa);
        let out = msg_out(None);

        let msg = build_msg(&oa, &scene, Utc::now(), None, &out, None, out.urn.as_ref()).unwrap();
        assert_eq!(msg.status, MsgStatus::Failed);
        assert_eq!(msg.failed_reason, Some(FailedReason::NoDestination));
        assert_eq!(msg.flow_id, None);
    }

    #[test]
    fn test_build_msg_resolves_template() {
        let oa = org_assets();
        let twilio = oa.channel_by_id(ChannelId(10)).unwrap();
        let scene = scene(&oa);
        let template = &oa.templates()[0];

        let mut out = msg_out(Some(twilio));
        out.templating = Some(Templating {
            template: TemplateReference { uuid: template.uuid, name: template.name.clone() },
            variables: vec!["Bob".to_string()],
        });
        let msg = build_msg(&oa, &scene, Utc::now(), None, &out, Some(twilio), out.urn.as_ref()).unwrap();
        assert_eq!(msg.template_id, Some(TemplateId(5)));
        assert_eq!(msg.templating.unwrap()["variables"][0], "Bob");

        out.templating = Some(Templating {
            template: TemplateReference { uuid: Uuid::new_v4(), name: "gone".to_string() },
            variables: vec![],
        });
        let err = build_msg(&oa, &scene, Utc::now(), None, &out, Some(twilio), out.urn.as_ref()).unwrap_err();
        assert!(matches!(err, HandlerError::AssetNotFound { kind: "template", .. }));
    }
}
