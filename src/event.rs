//! Events emitted by the engine while advancing a contact's session.
//!
//! Events arrive as JSON objects tagged by `type`:
//!
//! ```json
//! {
//!   "type": "msg_created",
//!   "created_on": "2026-10-16T10:00:00Z",
//!   "step_uuid": "5c0a3c4e-0d3f-4d53-a7a0-8c6f1e0d7c7a",
//!   "msg": {"uuid": "...", "urn": "tel:+250700000000", "text": "Hi there"}
//! }
//! ```
//!
//! Types this crate has no handling for deserialize to [`EventBody::Unknown`]
//! and are skipped by the runner.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::http::WebhookStatus;
use crate::models::contact::Urn;
use crate::models::session::FlowReference;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelReference {
    pub uuid: Uuid,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupReference {
    pub uuid: Uuid,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactReference {
    pub uuid: Uuid,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateReference {
    pub uuid: Uuid,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Templating {
    pub template: TemplateReference,
    #[serde(default)]
    pub variables: Vec<String>,
}

/// A message as described by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MsgOut {
    pub uuid: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub urn: Option<Urn>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<ChannelReference>,
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub quick_replies: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub templating: Option<Templating>,
}

/// Kind-specific part of an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventBody {
    MsgCreated {
        msg: MsgOut,
    },
    MsgReceived {
        msg: MsgOut,
    },
    SessionTriggered {
        flow: FlowReference,
        #[serde(default)]
        groups: Vec<GroupReference>,
        #[serde(default)]
        contacts: Vec<ContactReference>,
        #[serde(default)]
        urns: Vec<Urn>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        contact_query: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        run_summary: Option<Value>,
    },
    ContactGroupsChanged {
        #[serde(default)]
        groups_added: Vec<GroupReference>,
        #[serde(default)]
        groups_removed: Vec<GroupReference>,
    },
    ContactUrnsChanged {
        urns: Vec<Urn>,
    },
    WebhookCalled {
        url: String,
        status: WebhookStatus,
        #[serde(default)]
        status_code: i32,
        #[serde(default)]
        elapsed_ms: i32,
        #[serde(default)]
        retries: i32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        resthook: Option<String>,
        #[serde(default)]
        request: String,
        #[serde(default)]
        response: String,
    },
    FlowEntered {
        flow: FlowReference,
    },
    ContactNameChanged {
        name: String,
    },
    #[serde(other)]
    Unknown,
}

/// Discriminant of [`EventBody`], used to key handler registrations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    MsgCreated,
    MsgReceived,
    SessionTriggered,
    ContactGroupsChanged,
    ContactUrnsChanged,
    WebhookCalled,
    FlowEntered,
    ContactNameChanged,
    Unknown,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MsgCreated => "msg_created",
            Self::MsgReceived => "msg_received",
            Self::SessionTriggered => "session_triggered",
            Self::ContactGroupsChanged => "contact_groups_changed",
            Self::ContactUrnsChanged => "contact_urns_changed",
            Self::WebhookCalled => "webhook_called",
            Self::FlowEntered => "flow_entered",
            Self::ContactNameChanged => "contact_name_changed",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One event emitted by the engine. Immutable once emitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub created_on: DateTime<Utc>,

    /// Step of the session path that produced this event
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_uuid: Option<Uuid>,

    #[serde(flatten)]
    pub body: EventBody,
}

impl Event {
    pub fn new(body: EventBody) -> Self {
        Self {
            created_on: Utc::now(),
            step_uuid: None,
            body,
        }
    }

    pub fn with_step(mut self, step_uuid: Uuid) -> Self {
        self.step_uuid = Some(step_uuid);
        self
    }

    pub fn kind(&self) -> EventKind {
        match &self.body {
            EventBody::MsgCreated { .. } => EventKind::MsgCreated,
            EventBody::MsgReceived { .. } => EventKind::MsgReceived,
            EventBody::SessionTriggered { .. } => EventKind::SessionTriggered,
            EventBody::ContactGroupsChanged { .. } => EventKind::ContactGroupsChanged,
            EventBody::ContactUrnsChanged { .. } => EventKind::ContactUrnsChanged,
            EventBody::WebhookCalled { .. } => EventKind::WebhookCalled,
            EventBody::FlowEntered { .. } => EventKind::FlowEntered,
            EventBody::ContactNameChanged { .. } => EventKind::ContactNameChanged,
            EventBody::Unknown => EventKind::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_deserialize() {
        let event: Event = serde_json::from_value(json!({
            "type": "msg_created",
            "created_on": "2026-10-16T10:00:00Z",
            "step_uuid": "5c0a3c4e-0d3f-4d53-a7a0-8c6f1e0d7c7a",
            "msg": {
                "uuid": "b2c2a4d4-3f2e-4a39-9d16-0b4cc1b6a6f4",
                "urn": "tel:+250700000000",
                "channel": {"uuid": "0f661e8b-ea9d-4bd3-9953-d368340acf91", "name": "Twilio"},
                "text": "Hi there"
            }
        }))
        .unwrap();

        assert_eq!(event.kind(), EventKind::MsgCreated);
        assert!(event.step_uuid.is_some());
        match event.body {
            EventBody::MsgCreated { msg } => {
                assert_eq!(msg.text, "Hi there");
                assert_eq!(msg.urn.unwrap().identity(), "tel:+250700000000");
                assert_eq!(msg.channel.unwrap().name, "Twilio");
            }
            other => panic!("unexpected body: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_type() {
        let event: Event = serde_json::from_value(json!({
            "type": "environment_refreshed",
            "created_on": "2026-10-16T10:00:00Z",
            "environment": {"date_format": "DD-MM-YYYY"}
        }))
        .unwrap();
        assert_eq!(event.kind(), EventKind::Unknown);
    }

    #[test]
    fn test_webhook_called_defaults() {
        let event: Event = serde_json::from_value(json!({
            "type": "webhook_called",
            "created_on": "2026-10-16T10:00:00Z",
            "url": "https://x",
            "status": "subscriber_gone",
            "resthook": "weather"
        }))
        .unwrap();

        match event.body {
            EventBody::WebhookCalled { status, status_code, resthook, .. } => {
                assert_eq!(status, WebhookStatus::SubscriberGone);
                assert_eq!(status_code, 0);
                assert_eq!(resthook.as_deref(), Some("weather"));
            }
            other => panic!("unexpected body: {other:?}"),
        }
    }

    #[test]
    fn test_serialize_round_trips_type_tag() {
        let event = Event::new(EventBody::ContactNameChanged { name: "Bob".into() });
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "contact_name_changed");
        assert_eq!(value["name"], "Bob");
        assert_eq!(EventKind::ContactNameChanged.to_string(), "contact_name_changed");
    }
}
