//! Contact search.
//!
//! Query parsing and indexing live in a separate search service; this crate
//! only builds queries and asks a [`ContactSearch`] implementation to run
//! them.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::models::assets::OrgAssets;
use crate::models::flow_start::Exclusions;
use crate::models::{ContactId, FlowId, OrgId};

#[derive(Debug, Error)]
pub enum SearchError {
    /// The query was rejected, e.g. it references an unknown field
    #[error("{message}")]
    Query {
        message: String,
        code: String,
        extra: Map<String, Value>,
    },

    #[error("contact search is not available")]
    Unavailable,

    #[error("search request failed: {0}")]
    Request(String),
}

impl SearchError {
    pub fn query(message: impl Into<String>, code: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            code: code.into(),
            extra: Map::new(),
        }
    }
}

/// Matches of a search, `ids` capped by the requested limit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchResults {
    pub total: i64,
    pub ids: Vec<ContactId>,
}

#[async_trait]
pub trait ContactSearch: Send + Sync {
    /// Runs a query against an org's contacts. `limit` caps the returned ids;
    /// `None` returns every match.
    async fn search(&self, org_id: OrgId, query: &str, limit: Option<usize>) -> Result<SearchResults, SearchError>;
}

/// Search used when no search service is configured. Every query fails, so
/// starts by query fail while starts by group or contact still work.
pub struct NoSearch;

#[async_trait]
impl ContactSearch for NoSearch {
    async fn search(&self, _org_id: OrgId, _query: &str, _limit: Option<usize>) -> Result<SearchResults, SearchError> {
        Err(SearchError::Unavailable)
    }
}

/// What a start includes, by reference.
#[derive(Debug, Clone, Default)]
pub struct Inclusions<'a> {
    pub group_names: Vec<&'a str>,
    pub contact_uuids: Vec<String>,
    pub query: Option<&'a str>,
}

fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Builds the contact query selecting a start's recipients, e.g.
///
/// ```text
/// (group = "Doctors" OR uuid = "0c8e...") AND status = "active" AND flow = ""
/// ```
pub fn build_start_query(
    oa: &OrgAssets,
    flow_id: FlowId,
    include: &Inclusions<'_>,
    exclude: &Exclusions,
    now: DateTime<Utc>,
) -> String {
    let mut inclusions: Vec<String> = Vec::new();
    inclusions.extend(include.group_names.iter().map(|name| format!("group = {}", quote(name))));
    inclusions.extend(include.contact_uuids.iter().map(|uuid| format!("uuid = {}", quote(uuid))));
    if let Some(query) = include.query.map(str::trim).filter(|q| !q.is_empty()) {
        inclusions.push(format!("({query})"));
    }

    let mut parts: Vec<String> = Vec::new();
    match inclusions.len() {
        0 => {}
        1 => parts.push(inclusions.remove(0)),
        _ => parts.push(format!("({})", inclusions.join(" OR "))),
    }

    if exclude.non_active {
        parts.push("status = \"active\"".to_string());
    }
    if exclude.in_a_flow {
        parts.push("flow = \"\"".to_string());
    }
    if exclude.started_previously {
        if let Some(flow) = oa.flow_by_id(flow_id) {
            parts.push(format!("history != {}", quote(&flow.name)));
        }
    }
    if exclude.not_seen_since_days > 0 {
        let since = now - Duration::days(i64::from(exclude.not_seen_since_days));
        parts.push(format!("last_seen_on > {}", quote(&since.format("%d-%m-%Y").to_string())));
    }

    parts.join(" AND ")
}
