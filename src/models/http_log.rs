use chrono::{DateTime, Utc};
use sqlx::query_builder::Separated;
use sqlx::{PgConnection, Postgres};

use super::{ContactId, DbError, FlowId, OrgId};
use crate::db::{self, BulkRow};

pub const LOG_TYPE_WEBHOOK_CALLED: &str = "webhook_called";

/// Body stored on webhook results whose call never got a response.
pub const CONNECTION_ERROR_BODY: &str = "connection error";

/// Trace of one outgoing HTTP request, persisted in `request_logs_httplog`.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpLog {
    pub org_id: OrgId,
    pub flow_id: Option<FlowId>,
    pub log_type: &'static str,
    pub url: String,
    pub status_code: i32,
    pub request: String,
    pub response: String,
    pub is_error: bool,
    pub elapsed_ms: i32,
    pub retries: i32,
    pub created_on: DateTime<Utc>,
}

impl BulkRow for HttpLog {
    const COLUMNS: usize = 11;

    fn bind_row<'q>(&'q self, row: &mut Separated<'_, 'q, Postgres, &'static str>) {
        row.push_bind(self.org_id)
            .push_bind(self.flow_id)
            .push_bind(self.log_type)
            .push_bind(&self.url)
            .push_bind(self.status_code)
            .push_bind(&self.request)
            .push_bind(&self.response)
            .push_bind(self.is_error)
            .push_bind(self.elapsed_ms)
            .push_bind(self.retries)
            .push_bind(self.created_on);
    }
}

pub async fn insert_http_logs(conn: &mut PgConnection, logs: &[HttpLog]) -> Result<(), DbError> {
    db::bulk_execute(
        conn,
        "error inserting http logs",
        "INSERT INTO request_logs_httplog(org_id, flow_id, log_type, url, status_code, request, response, is_error, request_time, num_retries, created_on) ",
        logs,
        "",
    )
    .await?;
    Ok(())
}

/// Result of a webhook called from a flow, persisted in `api_webhookresult`.
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookResult {
    pub org_id: OrgId,
    pub contact_id: ContactId,
    pub url: String,
    pub request: String,
    pub status_code: i32,
    pub response: String,
    pub elapsed_ms: i32,
    pub created_on: DateTime<Utc>,
}

impl BulkRow for WebhookResult {
    const COLUMNS: usize = 8;

    fn bind_row<'q>(&'q self, row: &mut Separated<'_, 'q, Postgres, &'static str>) {
        row.push_bind(self.org_id)
            .push_bind(self.contact_id)
            .push_bind(&self.url)
            .push_bind(&self.request)
            .push_bind(self.status_code)
            .push_bind(&self.response)
            .push_bind(self.elapsed_ms)
            .push_bind(self.created_on);
    }
}

pub async fn insert_webhook_results(
    conn: &mut PgConnection,
    results: &[WebhookResult],
) -> Result<(), DbError> {
    db::bulk_execute(
        conn,
        "error inserting webhook results",
        "INSERT INTO api_webhookresult(org_id, contact_id, url, request, status_code, response, request_time, created_on) ",
        results,
        "",
    )
    .await?;
    Ok(())
}
