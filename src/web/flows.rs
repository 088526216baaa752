use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use super::ApiError;
use crate::models::assets::{OrgAssets, Refresh};
use crate::models::contact::Urn;
use crate::models::flow_start::{self, Exclusions, FlowStart, StartType};
use crate::models::{ContactId, DbContext, FlowId, GroupId, OrgId, StartId, UserId};
use crate::runtime::Runtime;
use crate::search::{self, Inclusions};
use crate::tasks::queue::{self, BATCH_QUEUE};
use crate::tasks::{InterruptSessionsTask, StartFlowTask};

/// Preview sample size when none is requested
const DEFAULT_SAMPLE_SIZE: usize = 3;

#[derive(Debug, Deserialize)]
pub struct InterruptFlowRequest {
    pub org_id: OrgId,
    pub flow_id: FlowId,
}

/// Queues an interrupt of every session waiting in a flow.
pub async fn interrupt(
    State(rt): State<Arc<Runtime>>,
    payload: Result<Json<InterruptFlowRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(req) = payload?;

    let task = InterruptSessionsTask {
        flow_ids: vec![req.flow_id],
        ..Default::default()
    };
    queue::queue_task(&rt.rp, BATCH_QUEUE, req.org_id, &task, true).await?;

    info!(org_id = %req.org_id, flow_id = %req.flow_id, "Queued flow interrupt");
    Ok(Json(json!({})))
}

#[derive(Debug, Deserialize)]
pub struct StartRequest {
    pub org_id: OrgId,
    pub user_id: Option<UserId>,
    #[serde(rename = "type")]
    pub start_type: StartType,
    pub flow_id: FlowId,
    #[serde(default)]
    pub group_ids: Vec<GroupId>,
    #[serde(default)]
    pub contact_ids: Vec<ContactId>,
    #[serde(default)]
    pub urns: Vec<Urn>,
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub exclude: Exclusions,
    #[serde(default)]
    pub params: Option<Value>,
}

impl StartRequest {
    fn into_start(self) -> FlowStart {
        let mut start = FlowStart::new(self.org_id, self.start_type, self.flow_id);
        start.group_ids = self.group_ids;
        start.contact_ids = self.contact_ids;
        start.urns = self.urns;
        start.query = self.query;
        start.exclusions = self.exclude;
        start.params = self.params;
        start.created_by_id = self.user_id;
        start
    }
}

#[derive(Debug, Serialize)]
pub struct StartResponse {
    pub id: StartId,
}

/// Persists a start and queues it for expansion.
pub async fn start(
    State(rt): State<Arc<Runtime>>,
    payload: Result<Json<StartRequest>, JsonRejection>,
) -> Result<Json<StartResponse>, ApiError> {
    let Json(req) = payload?;
    let mut start = req.into_start();
    if !start.has_recipients() {
        return Err(ApiError::Validation("start must have at least one recipient".into()));
    }

    let oa = rt.assets.get(&rt.db, start.org_id, Refresh::None).await?;
    if oa.flow_by_id(start.flow_id).is_none() {
        return Err(ApiError::Validation(format!("no such flow with id {}", start.flow_id)));
    }

    let mut conn = rt.db.acquire().await.context("error acquiring connection")?;
    flow_start::insert_flow_starts(&mut conn, std::slice::from_mut(&mut start)).await?;
    let id = start
        .id
        .ok_or_else(|| ApiError::Internal(format!("start {} was not assigned an id", start.uuid)))?;

    let task = StartFlowTask { start };
    queue::queue_task(&rt.rp, BATCH_QUEUE, oa.org_id(), &task, false).await?;

    info!(org_id = %oa.org_id(), start_id = %id, flow_id = %task.start.flow_id, "Queued flow start");
    Ok(Json(StartResponse { id }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Include {
    pub group_uuids: Vec<Uuid>,
    pub contact_uuids: Vec<Uuid>,
    pub query: String,
}

#[derive(Debug, Deserialize)]
pub struct PreviewRequest {
    pub org_id: OrgId,
    pub flow_id: FlowId,
    #[serde(default)]
    pub include: Include,
    #[serde(default)]
    pub exclude: Exclusions,
    #[serde(default)]
    pub sample_size: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct PreviewResponse {
    pub query: String,
    pub total: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_ids: Option<Vec<ContactId>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// Builds the recipient query of a prospective start.
pub(crate) fn preview_query(oa: &OrgAssets, req: &PreviewRequest) -> String {
    let group_names = req
        .include
        .group_uuids
        .iter()
        .filter_map(|uuid| {
            let group = oa.group_by_uuid(uuid);
            if group.is_none() {
                warn!(org_id = %oa.org_id(), group_uuid = %uuid, "Unknown group in start preview");
            }
            group.map(|g| g.name.as_str())
        })
        .collect();
    let include = Inclusions {
        group_names,
        contact_uuids: req.include.contact_uuids.iter().map(Uuid::to_string).collect(),
        query: Some(req.include.query.as_str()),
    };
    search::build_start_query(oa, req.flow_id, &include, &req.exclude, Utc::now())
}

async fn run_preview(rt: &Runtime, req: &PreviewRequest, limit: usize) -> Result<(String, search::SearchResults), ApiError> {
    let oa = rt.assets.get(&rt.db, req.org_id, Refresh::None).await?;
    if oa.flow_by_id(req.flow_id).is_none() {
        return Err(ApiError::Validation(format!("no such flow with id {}", req.flow_id)));
    }

    let query = preview_query(&oa, req);
    if query.is_empty() {
        return Ok((query, search::SearchResults::default()));
    }
    let results = rt.search.search(req.org_id, &query, Some(limit)).await?;
    Ok((query, results))
}

/// Counts the recipients a start would have.
pub async fn start_preview(
    State(rt): State<Arc<Runtime>>,
    payload: Result<Json<PreviewRequest>, JsonRejection>,
) -> Result<Json<PreviewResponse>, ApiError> {
    let Json(req) = payload?;
    let (query, results) = run_preview(&rt, &req, 0).await?;
    Ok(Json(PreviewResponse {
        query,
        total: results.total,
        sample_ids: None,
        metadata: None,
    }))
}

/// Counts the recipients a start would have, with a sample of them.
pub async fn preview_start(
    State(rt): State<Arc<Runtime>>,
    payload: Result<Json<PreviewRequest>, JsonRejection>,
) -> Result<Json<PreviewResponse>, ApiError> {
    let Json(req) = payload?;
    let sample_size = req.sample_size.unwrap_or(DEFAULT_SAMPLE_SIZE);
    let (query, results) = run_preview(&rt, &req, sample_size).await?;

    let metadata = json!({
        "groups": req.include.group_uuids,
        "contacts": req.include.contact_uuids.len(),
        "exclusions": req.exclude,
    });
    Ok(Json(PreviewResponse {
        query,
        total: results.total,
        sample_ids: Some(results.ids.into_iter().take(sample_size).collect()),
        metadata: Some(metadata),
    }))
}

#[derive(Debug, Deserialize)]
pub struct CloneRequest {
    #[serde(default)]
    pub dependency_mapping: HashMap<Uuid, Uuid>,
    pub flow: Value,
}

/// Copies a definition with fresh UUIDs and remapped dependencies.
pub async fn clone(
    State(rt): State<Arc<Runtime>>,
    payload: Result<Json<CloneRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(req) = payload?;
    let cloned = rt.engine.clone_definition(&req.flow, &req.dependency_mapping)?;
    Ok(Json(cloned))
}

#[derive(Debug, Deserialize)]
pub struct MigrateRequest {
    pub flow: Value,
    #[serde(default)]
    pub to_version: Option<String>,
}

/// Migrates a definition, returning it only if it reads back.
pub async fn migrate(
    State(rt): State<Arc<Runtime>>,
    payload: Result<Json<MigrateRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(req) = payload?;
    let migrated = rt.engine.migrate(req.flow, req.to_version.as_deref())?;
    rt.engine.read_flow(&migrated)?;
    Ok(Json(migrated))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::assets::testdata::org_assets;

    #[test]
    fn test_start_request() {
        let req: StartRequest = serde_json::from_value(json!({
            "org_id": 1,
            "user_id": 3,
            "type": "M",
            "flow_id": 1,
            "urns": ["tel:+250700000001"],
            "exclude": {"in_a_flow": true}
        }))
        .unwrap();

        let start = req.into_start();
        assert_eq!(start.start_type, StartType::Manual);
        assert_eq!(start.created_by_id, Some(UserId(3)));
        assert_eq!(start.urns, vec![Urn::new("tel", "+250700000001")]);
        assert!(start.exclusions.in_a_flow);
        assert!(!start.exclusions.non_active);
        assert!(start.has_recipients());
    }

    #[test]
    fn test_preview_query() {
        let oa = org_assets();
        let doctors = oa.group_by_id(GroupId(100)).unwrap().uuid;
        let req: PreviewRequest = serde_json::from_value(json!({
            "org_id": 1,
            "flow_id": 1,
            "include": {"group_uuids": [doctors, Uuid::new_v4()], "query": "age > 30"},
            "exclude": {"non_active": true}
        }))
        .unwrap();

        assert_eq!(
            preview_query(&oa, &req),
            r#"(group = "Doctors" OR (age > 30)) AND status = "active""#
        );
    }
}
