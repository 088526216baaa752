//! The flow engine seam.
//!
//! Flow evaluation happens in an external library. This crate talks to it
//! through [`Engine`]: reading and migrating definitions, cloning them with
//! remapped dependencies, and starting sessions which produce a [`Sprint`].
//!
//! [`DefinitionEngine`] is the built-in implementation. It works at the
//! definition level only: it enters the flow at its first node, runs that
//! node's webhook actions and stops there, waiting if the node waits.

use std::cmp::Ordering;
use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Method;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::event::{Event, EventBody};
use crate::http::HttpAccess;
use crate::models::assets::{Flow, OrgAssets};
use crate::models::contact::Contact;
use crate::models::session::{FlowReference, Run, RunStatus, Session, SessionStatus, SessionType, Step};

/// Newest definition version this engine understands.
pub const CURRENT_SPEC_VERSION: &str = "13.1.0";

/// Oldest definition version which can be migrated.
pub const MIN_SPEC_VERSION: &str = "11.0.0";

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid flow definition: {0}")]
    InvalidDefinition(String),

    #[error("unsupported spec version: {0}")]
    UnsupportedVersion(String),

    #[error("flow {0} has no definition")]
    NoDefinition(Uuid),
}

/// Summary of a definition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlowInfo {
    pub uuid: Uuid,
    pub name: String,
    pub spec_version: String,
    pub node_count: usize,
}

/// Output of one engine invocation for one contact.
#[derive(Debug, Clone)]
pub struct Sprint {
    pub session: Session,
    pub events: Vec<Event>,
}

#[async_trait]
pub trait Engine: Send + Sync {
    /// Validates a definition and summarizes it.
    fn read_flow(&self, definition: &Value) -> Result<FlowInfo, EngineError>;

    /// Migrates a definition to `to_version`, or the current version.
    fn migrate(&self, definition: Value, to_version: Option<&str>) -> Result<Value, EngineError>;

    /// Copies a definition, replacing dependency UUIDs found in `mapping` and
    /// giving the flow and every node, action, exit, category and case a
    /// fresh UUID.
    fn clone_definition(&self, definition: &Value, mapping: &HashMap<Uuid, Uuid>) -> Result<Value, EngineError>;

    /// Starts a new session for a contact in a flow. Webhooks called along
    /// the way go through `http` and are reported as `webhook_called` events.
    async fn start_session(
        &self,
        http: &HttpAccess,
        oa: &OrgAssets,
        flow: &Flow,
        contact: &Contact,
        params: Option<&Value>,
    ) -> Result<Sprint, EngineError>;
}

type Version = (u32, u32, u32);

fn parse_version(version: &str) -> Result<Version, EngineError> {
    let unsupported = || EngineError::UnsupportedVersion(version.to_string());
    let mut parts = version.trim().split('.').map(|p| p.parse::<u32>().map_err(|_| unsupported()));
    let major = parts.next().ok_or_else(unsupported)??;
    let minor = parts.next().transpose()?.unwrap_or(0);
    let patch = parts.next().transpose()?.unwrap_or(0);
    if parts.next().is_some() {
        return Err(unsupported());
    }
    Ok((major, minor, patch))
}

fn compare_versions(a: &str, b: &str) -> Result<Ordering, EngineError> {
    Ok(parse_version(a)?.cmp(&parse_version(b)?))
}

/// Keys whose array elements are structural parts of a flow.
const STRUCTURAL_KEYS: [&str; 5] = ["nodes", "actions", "exits", "categories", "cases"];

#[derive(Debug, Default, Clone, Copy)]
pub struct DefinitionEngine;

impl DefinitionEngine {
    fn object<'a>(definition: &'a Value) -> Result<&'a Map<String, Value>, EngineError> {
        definition
            .as_object()
            .ok_or_else(|| EngineError::InvalidDefinition("definition must be an object".into()))
    }

    fn string_field<'a>(obj: &'a Map<String, Value>, key: &str) -> Result<&'a str, EngineError> {
        obj.get(key)
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::InvalidDefinition(format!("missing {key}")))
    }
}

/// Collects the UUIDs of structural elements, mapping each to a fresh one.
fn collect_structural(value: &Value, structural: bool, found: &mut HashMap<String, String>) {
    match value {
        Value::Object(obj) => {
            if structural {
                if let Some(uuid) = obj.get("uuid").and_then(Value::as_str) {
                    found
                        .entry(uuid.to_string())
                        .or_insert_with(|| Uuid::new_v4().to_string());
                }
            }
            for (key, child) in obj {
                if let Value::Array(items) = child {
                    let is_structural = STRUCTURAL_KEYS.contains(&key.as_str());
                    for item in items {
                        collect_structural(item, is_structural, found);
                    }
                } else {
                    collect_structural(child, false, found);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_structural(item, false, found);
            }
        }
        _ => {}
    }
}

/// Rewrites every string and object key found in `replacements`.
fn replace_uuids(value: &Value, replacements: &HashMap<String, String>) -> Value {
    match value {
        Value::String(s) => Value::String(replacements.get(s).cloned().unwrap_or_else(|| s.clone())),
        Value::Array(items) => Value::Array(items.iter().map(|v| replace_uuids(v, replacements)).collect()),
        Value::Object(obj) => Value::Object(
            obj.iter()
                .map(|(k, v)| {
                    let key = replacements.get(k).cloned().unwrap_or_else(|| k.clone());
                    (key, replace_uuids(v, replacements))
                })
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Makes the request of a `call_webhook` action. Bodies which parse as JSON
/// are sent as JSON, anything else is sent as a JSON string.
async fn call_webhook(http: &HttpAccess, action: &Value, step_uuid: Uuid) -> Option<Event> {
    let url = action.get("url").and_then(Value::as_str)?;
    let method = action
        .get("method")
        .and_then(Value::as_str)
        .and_then(|m| Method::from_bytes(m.to_uppercase().as_bytes()).ok())
        .unwrap_or(Method::GET);
    let body = action.get("body").map(|body| match body {
        Value::String(text) => serde_json::from_str(text).unwrap_or_else(|_| body.clone()),
        other => other.clone(),
    });

    let call = http.call(method, url, body.as_ref()).await;
    let event = EventBody::WebhookCalled {
        url: call.url,
        status: call.status,
        status_code: i32::from(call.status_code),
        elapsed_ms: i32::try_from(call.elapsed.as_millis()).unwrap_or(i32::MAX),
        retries: 0,
        resthook: None,
        request: call.request,
        response: call.response,
    };
    Some(Event::new(event).with_step(step_uuid))
}

#[async_trait]
impl Engine for DefinitionEngine {
    fn read_flow(&self, definition: &Value) -> Result<FlowInfo, EngineError> {
        let obj = Self::object(definition)?;
        let uuid = Self::string_field(obj, "uuid")?
            .parse::<Uuid>()
            .map_err(|e| EngineError::InvalidDefinition(format!("invalid uuid: {e}")))?;
        let name = Self::string_field(obj, "name")?.to_string();
        let spec_version = Self::string_field(obj, "spec_version")?.to_string();

        if compare_versions(&spec_version, CURRENT_SPEC_VERSION)? == Ordering::Greater {
            return Err(EngineError::UnsupportedVersion(spec_version));
        }

        let nodes = obj
            .get("nodes")
            .and_then(Value::as_array)
            .ok_or_else(|| EngineError::InvalidDefinition("missing nodes".into()))?;
        for node in nodes {
            node.get("uuid")
                .and_then(Value::as_str)
                .ok_or_else(|| EngineError::InvalidDefinition("node without uuid".into()))?;
        }

        Ok(FlowInfo {
            uuid,
            name,
            spec_version,
            node_count: nodes.len(),
        })
    }

    fn migrate(&self, mut definition: Value, to_version: Option<&str>) -> Result<Value, EngineError> {
        let target = to_version.unwrap_or(CURRENT_SPEC_VERSION);
        if compare_versions(target, CURRENT_SPEC_VERSION)? == Ordering::Greater {
            return Err(EngineError::UnsupportedVersion(target.to_string()));
        }

        let obj = definition
            .as_object_mut()
            .ok_or_else(|| EngineError::InvalidDefinition("definition must be an object".into()))?;
        let current = obj
            .get("spec_version")
            .and_then(Value::as_str)
            .unwrap_or(MIN_SPEC_VERSION)
            .to_string();

        if compare_versions(&current, MIN_SPEC_VERSION)? == Ordering::Less {
            return Err(EngineError::UnsupportedVersion(current));
        }
        if compare_versions(&current, target)? == Ordering::Less {
            obj.insert("spec_version".into(), Value::String(target.to_string()));
            obj.entry("nodes").or_insert_with(|| Value::Array(Vec::new()));
        }
        Ok(definition)
    }

    fn clone_definition(&self, definition: &Value, mapping: &HashMap<Uuid, Uuid>) -> Result<Value, EngineError> {
        Self::object(definition)?;

        let mut replacements = HashMap::new();
        collect_structural(definition, true, &mut replacements);
        for (from, to) in mapping {
            replacements.insert(from.to_string(), to.to_string());
        }
        Ok(replace_uuids(definition, &replacements))
    }

    async fn start_session(
        &self,
        http: &HttpAccess,
        oa: &OrgAssets,
        flow: &Flow,
        contact: &Contact,
        _params: Option<&Value>,
    ) -> Result<Sprint, EngineError> {
        let definition = flow.definition.as_ref().ok_or(EngineError::NoDefinition(flow.uuid))?;
        let first = definition
            .get("nodes")
            .and_then(Value::as_array)
            .and_then(|nodes| nodes.first())
            .ok_or_else(|| EngineError::InvalidDefinition("flow has no nodes".into()))?;
        let node_uuid = first
            .get("uuid")
            .and_then(Value::as_str)
            .and_then(|u| u.parse::<Uuid>().ok())
            .ok_or_else(|| EngineError::InvalidDefinition("node without uuid".into()))?;
        let waits = first.pointer("/router/wait").is_some();

        let now = Utc::now();
        let reference = FlowReference {
            uuid: flow.uuid,
            name: flow.name.clone(),
        };
        let step = Step {
            uuid: Uuid::new_v4(),
            node_uuid,
            arrived_on: now,
        };
        let step_uuid = step.uuid;
        let (status, run_status) = if waits {
            (SessionStatus::Waiting, RunStatus::Waiting)
        } else {
            (SessionStatus::Completed, RunStatus::Completed)
        };

        let session = Session {
            uuid: Uuid::new_v4(),
            org_id: oa.org_id(),
            contact_id: contact.id,
            session_type: if flow.is_voice() { SessionType::Voice } else { SessionType::Messaging },
            status,
            current_flow_id: Some(flow.id),
            call_id: None,
            wait_timeout: first
                .pointer("/router/wait/timeout/seconds")
                .and_then(Value::as_i64)
                .filter(|_| waits)
                .map(|secs| now + chrono::Duration::seconds(secs)),
            wait_expires_on: waits.then(|| now + chrono::Duration::days(7)),
            runs: vec![Run {
                uuid: Uuid::new_v4(),
                flow: reference.clone(),
                status: run_status,
                path: vec![step],
                created_on: now,
                exited_on: (!waits).then_some(now),
            }],
            created_on: now,
        };

        let mut events = vec![Event::new(EventBody::FlowEntered { flow: reference }).with_step(step_uuid)];
        let webhooks = first
            .get("actions")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter(|action| action.get("type").and_then(Value::as_str) == Some("call_webhook"));
        for action in webhooks {
            if let Some(event) = call_webhook(http, action, step_uuid).await {
                events.push(event);
            }
        }
        Ok(Sprint { session, events })
    }
}
