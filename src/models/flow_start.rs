//! Flow starts: requests to start a flow for a set of recipients.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::query_builder::Separated;
use sqlx::{FromRow, PgConnection, PgExecutor, Postgres};
use uuid::Uuid;

use super::contact::{ContactState, Urn};
use super::msg::code_enum;
use super::{ContactId, DbContext, DbError, FlowId, GroupId, OrgId, StartId, UserId};
use crate::db::{self, BulkRow};

code_enum!(
    StartStatus {
        Pending = "P",
        Started = "S",
        Complete = "C",
        Failed = "F",
        Interrupted = "I",
    }
);

code_enum!(
    StartType {
        Manual = "M",
        Trigger = "T",
        Api = "A",
        FlowAction = "F",
    }
);

/// Per-start recipient filters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Exclusions {
    /// Skip stopped, blocked and archived contacts
    pub non_active: bool,
    /// Skip contacts currently in any flow
    pub in_a_flow: bool,
    /// Skip contacts who have ever been in this flow
    pub started_previously: bool,
    /// Skip contacts not seen in this many days, when positive
    pub not_seen_since_days: i32,
}

impl Exclusions {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Whether a contact in the given state should still be started.
    pub fn allows(&self, contact: &ContactState, now: DateTime<Utc>) -> bool {
        if self.non_active && contact.status != "A" {
            return false;
        }
        if self.in_a_flow && contact.current_flow_id.is_some() {
            return false;
        }
        if self.started_previously && contact.started_previously {
            return false;
        }
        if self.not_seen_since_days > 0 {
            let cutoff = now - Duration::days(i64::from(self.not_seen_since_days));
            match contact.last_seen_on {
                Some(seen) if seen >= cutoff => {}
                _ => return false,
            }
        }
        true
    }
}

/// A request to start a flow, persisted in `flows_flowstart`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowStart {
    #[serde(default)]
    pub id: Option<StartId>,
    pub uuid: Uuid,
    pub org_id: OrgId,
    pub start_type: StartType,
    pub flow_id: FlowId,
    #[serde(default)]
    pub group_ids: Vec<GroupId>,
    #[serde(default)]
    pub contact_ids: Vec<ContactId>,
    #[serde(default)]
    pub urns: Vec<Urn>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(default)]
    pub exclusions: Exclusions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by_id: Option<UserId>,
}

impl FlowStart {
    pub fn new(org_id: OrgId, start_type: StartType, flow_id: FlowId) -> Self {
        Self {
            id: None,
            uuid: Uuid::new_v4(),
            org_id,
            start_type,
            flow_id,
            group_ids: Vec::new(),
            contact_ids: Vec::new(),
            urns: Vec::new(),
            query: None,
            exclusions: Exclusions::default(),
            params: None,
            created_by_id: None,
        }
    }

    /// Whether any recipient selector is set.
    pub fn has_recipients(&self) -> bool {
        !self.group_ids.is_empty()
            || !self.contact_ids.is_empty()
            || !self.urns.is_empty()
            || self.query.as_deref().is_some_and(|q| !q.trim().is_empty())
    }
}

impl BulkRow for FlowStart {
    const COLUMNS: usize = 10;

    fn bind_row<'q>(&'q self, row: &mut Separated<'_, 'q, Postgres, &'static str>) {
        let urns: Vec<String> = self.urns.iter().map(|u| u.to_string()).collect();
        row.push_bind(self.uuid)
            .push_bind(self.org_id)
            .push_bind(StartStatus::Pending.code())
            .push_bind(self.start_type.code())
            .push_bind(self.flow_id)
            .push_bind(urns)
            .push_bind(&self.query)
            .push_bind(sqlx::types::Json(self.exclusions))
            .push_bind(&self.params)
            .push_unseparated(", NOW(), NOW(), 0, ")
            .push_bind_unseparated(self.created_by_id);
    }
}

#[derive(FromRow)]
struct InsertedId {
    id: StartId,
}

struct StartContact(StartId, ContactId);

impl BulkRow for StartContact {
    const COLUMNS: usize = 2;

    fn bind_row<'q>(&'q self, row: &mut Separated<'_, 'q, Postgres, &'static str>) {
        row.push_bind(self.0).push_bind(self.1);
    }
}

struct StartGroup(StartId, GroupId);

impl BulkRow for StartGroup {
    const COLUMNS: usize = 2;

    fn bind_row<'q>(&'q self, row: &mut Separated<'_, 'q, Postgres, &'static str>) {
        row.push_bind(self.0).push_bind(self.1);
    }
}

/// Inserts pending starts with their contact and group selectors, assigning
/// ids back.
pub async fn insert_flow_starts(conn: &mut PgConnection, starts: &mut [FlowStart]) -> Result<(), DbError> {
    let ids: Vec<InsertedId> = db::bulk_returning(
        &mut *conn,
        "error inserting flow starts",
        r#"INSERT INTO flows_flowstart(uuid, org_id, status, start_type, flow_id, urns, query,
       exclusions, params, created_on, modified_on, contact_count, created_by_id) "#,
        starts,
        " RETURNING id",
    )
    .await?;

    for (start, inserted) in starts.iter_mut().zip(ids) {
        start.id = Some(inserted.id);
    }

    let contacts: Vec<StartContact> = starts
        .iter()
        .filter_map(|s| s.id.map(|id| (id, s)))
        .flat_map(|(id, s)| s.contact_ids.iter().map(move |c| StartContact(id, *c)))
        .collect();
    let groups: Vec<StartGroup> = starts
        .iter()
        .filter_map(|s| s.id.map(|id| (id, s)))
        .flat_map(|(id, s)| s.group_ids.iter().map(move |g| StartGroup(id, *g)))
        .collect();

    db::bulk_execute(
        &mut *conn,
        "error inserting flow start contacts",
        "INSERT INTO flows_flowstart_contacts(flowstart_id, contact_id) ",
        &contacts,
        "",
    )
    .await?;
    db::bulk_execute(
        conn,
        "error inserting flow start groups",
        "INSERT INTO flows_flowstart_groups(flowstart_id, contactgroup_id) ",
        &groups,
        "",
    )
    .await?;
    Ok(())
}

/// Moves a pending start to started. Returns false if the start had already
/// left pending, e.g. it was interrupted before a worker picked it up.
pub async fn mark_started<'e>(db: impl PgExecutor<'e>, id: StartId) -> Result<bool, DbError> {
    let result = sqlx::query(
        "UPDATE flows_flowstart SET status = 'S', modified_on = NOW() WHERE id = $1 AND status = 'P'",
    )
    .bind(id)
    .execute(db)
    .await
    .context("error marking flow start as started")?;
    Ok(result.rows_affected() == 1)
}

pub async fn mark_complete<'e>(db: impl PgExecutor<'e>, id: StartId, contact_count: i64) -> Result<(), DbError> {
    sqlx::query(
        "UPDATE flows_flowstart SET status = 'C', contact_count = $2, modified_on = NOW() WHERE id = $1 AND status = 'S'",
    )
    .bind(id)
    .bind(contact_count)
    .execute(db)
    .await
    .context("error marking flow start as complete")?;
    Ok(())
}

pub async fn mark_failed<'e>(db: impl PgExecutor<'e>, id: StartId) -> Result<(), DbError> {
    sqlx::query(
        "UPDATE flows_flowstart SET status = 'F', modified_on = NOW() WHERE id = $1 AND status IN ('P', 'S')",
    )
    .bind(id)
    .execute(db)
    .await
    .context("error marking flow start as failed")?;
    Ok(())
}

/// Records why a started start stopped short. The status stays Started since
/// batches queued before the error will still run.
pub async fn set_last_error<'e>(db: impl PgExecutor<'e>, id: StartId, error: &str) -> Result<(), DbError> {
    sqlx::query(
        "UPDATE flows_flowstart SET last_error = $2, modified_on = NOW() WHERE id = $1 AND status = 'S'",
    )
    .bind(id)
    .bind(error)
    .execute(db)
    .await
    .context("error recording flow start error")?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod testdata {
    use super::*;

    #[derive(Debug, FromRow)]
    pub struct StartState {
        pub status: String,
        pub contact_count: i64,
        pub last_error: Option<String>,
    }

    pub async fn start_state<'e>(db: impl PgExecutor<'e>, id: StartId) -> StartState {
        sqlx::query_as("SELECT status, contact_count, last_error FROM flows_flowstart WHERE id = $1")
            .bind(id)
            .fetch_one(db)
            .await
            .unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::testdata::start_state;
    use super::*;
    use crate::db::testdata::test_db;

    fn state(status: &str) -> ContactState {
        ContactState {
            id: ContactId(1),
            status: status.to_string(),
            current_flow_id: None,
            last_seen_on: None,
            started_previously: false,
        }
    }

    #[test]
    fn test_no_exclusions_allow_everyone() {
        let now = Utc::now();
        let exclusions = Exclusions::default();
        assert!(exclusions.is_empty());

        let mut blocked = state("B");
        blocked.current_flow_id = Some(FlowId(3));
        blocked.started_previously = true;
        assert!(exclusions.allows(&blocked, now));
    }

    #[test]
    fn test_exclusions() {
        let now = Utc::now();

        let non_active = Exclusions { non_active: true, ..Default::default() };
        assert!(non_active.allows(&state("A"), now));
        assert!(!non_active.allows(&state("S"), now));
        assert!(!non_active.allows(&state("V"), now));

        let in_a_flow = Exclusions { in_a_flow: true, ..Default::default() };
        let mut busy = state("A");
        busy.current_flow_id = Some(FlowId(3));
        assert!(!in_a_flow.allows(&busy, now));
        assert!(in_a_flow.allows(&state("A"), now));

        let previously = Exclusions { started_previously: true, ..Default::default() };
        let mut returning = state("A");
        returning.started_previously = true;
        assert!(!previously.allows(&returning, now));

        let not_seen = Exclusions { not_seen_since_days: 90, ..Default::default() };
        let mut recent = state("A");
        recent.last_seen_on = Some(now - Duration::days(10));
        let mut stale = state("A");
        stale.last_seen_on = Some(now - Duration::days(100));
        assert!(not_seen.allows(&recent, now));
        assert!(!not_seen.allows(&stale, now));
        assert!(!not_seen.allows(&state("A"), now));
    }

    #[test]
    fn test_has_recipients() {
        let mut start = FlowStart::new(OrgId(1), StartType::Manual, FlowId(2));
        assert!(!start.has_recipients());

        start.query = Some("  ".to_string());
        assert!(!start.has_recipients());

        start.query = Some("age > 10".to_string());
        assert!(start.has_recipients());
    }

    #[test]
    fn test_deserialize_exclusions_with_defaults() {
        let exclusions: Exclusions = serde_json::from_str(r#"{"in_a_flow": true}"#).unwrap();
        assert!(exclusions.in_a_flow);
        assert!(!exclusions.non_active);
        assert_eq!(exclusions.not_seen_since_days, 0);
    }

    #[tokio::test]
    async fn test_start_lifecycle() {
        let Some(db) = test_db().await else { return };
        let mut tx = db.begin().await.unwrap();

        let mut start = FlowStart::new(OrgId(1), StartType::Manual, FlowId(1));
        start.contact_ids = vec![ContactId(4), ContactId(5)];
        start.group_ids = vec![GroupId(100)];
        start.urns = vec!["tel:+250700000001".parse().unwrap()];
        let other = FlowStart::new(OrgId(1), StartType::Api, FlowId(1));
        let mut starts = vec![start, other];
        insert_flow_starts(&mut *tx, &mut starts).await.unwrap();

        let id = starts[0].id.unwrap();
        assert!(starts[1].id.unwrap() > id);

        let contacts: Vec<ContactId> = sqlx::query_scalar(
            "SELECT contact_id FROM flows_flowstart_contacts WHERE flowstart_id = $1 ORDER BY contact_id",
        )
        .bind(id)
        .fetch_all(&mut *tx)
        .await
        .unwrap();
        assert_eq!(contacts, vec![ContactId(4), ContactId(5)]);
        assert_eq!(start_state(&mut *tx, id).await.status, "P");

        assert!(mark_started(&mut *tx, id).await.unwrap());
        assert!(!mark_started(&mut *tx, id).await.unwrap());

        set_last_error(&mut *tx, id, "unable to queue batch 2 of 3").await.unwrap();
        let state = start_state(&mut *tx, id).await;
        assert_eq!(state.status, "S");
        assert_eq!(state.last_error.as_deref(), Some("unable to queue batch 2 of 3"));

        mark_complete(&mut *tx, id, 2).await.unwrap();
        let state = start_state(&mut *tx, id).await;
        assert_eq!(state.status, "C");
        assert_eq!(state.contact_count, 2);

        // a completed start can no longer fail
        mark_failed(&mut *tx, id).await.unwrap();
        assert_eq!(start_state(&mut *tx, id).await.status, "C");
    }
}
