//! Flow sessions and runs.
//!
//! A [`Session`] is produced by the engine and lives in memory for one scene
//! pass. The rest of this module holds the SQL which persists sessions and
//! exits waiting ones.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::query_builder::Separated;
use sqlx::{FromRow, PgConnection, Postgres};
use tracing::debug;
use uuid::Uuid;

use super::msg::code_enum;
use super::{CallId, ChannelId, ContactId, DbContext, DbError, FlowId, OrgId};
use crate::db::{self, BulkRow};

code_enum!(
    SessionType {
        Messaging = "M",
        Voice = "V",
    }
);

code_enum!(
    SessionStatus {
        Waiting = "W",
        Completed = "C",
        Interrupted = "I",
        Expired = "X",
        Failed = "F",
    }
);

code_enum!(
    RunStatus {
        Active = "A",
        Waiting = "W",
        Completed = "C",
        Interrupted = "I",
        Expired = "X",
        Failed = "F",
    }
);

code_enum!(
    /// Status of an IVR call in `ivr_call`.
    CallStatus {
        Pending = "P",
        Queued = "Q",
        Wired = "W",
        InProgress = "R",
        Completed = "D",
        Errored = "E",
        Failed = "F",
        Interrupted = "I",
    }
);

impl From<SessionStatus> for RunStatus {
    fn from(status: SessionStatus) -> Self {
        match status {
            SessionStatus::Waiting => RunStatus::Waiting,
            SessionStatus::Completed => RunStatus::Completed,
            SessionStatus::Interrupted => RunStatus::Interrupted,
            SessionStatus::Expired => RunStatus::Expired,
            SessionStatus::Failed => RunStatus::Failed,
        }
    }
}

/// Calls which can still have a live session bound to them.
pub const ACTIVE_CALL_STATUSES: [CallStatus; 4] = [
    CallStatus::Pending,
    CallStatus::Queued,
    CallStatus::Wired,
    CallStatus::InProgress,
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowReference {
    pub uuid: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub uuid: Uuid,
    pub node_uuid: Uuid,
    pub arrived_on: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub uuid: Uuid,
    pub flow: FlowReference,
    pub status: RunStatus,
    pub path: Vec<Step>,
    pub created_on: DateTime<Utc>,
    pub exited_on: Option<DateTime<Utc>>,
}

/// Live execution of flows for one contact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub uuid: Uuid,
    pub org_id: OrgId,
    pub contact_id: ContactId,
    pub session_type: SessionType,
    pub status: SessionStatus,
    pub current_flow_id: Option<FlowId>,
    pub call_id: Option<CallId>,
    /// When the current wait times out, cleared when courier takes over
    pub wait_timeout: Option<DateTime<Utc>>,
    pub wait_expires_on: Option<DateTime<Utc>>,
    pub runs: Vec<Run>,
    pub created_on: DateTime<Utc>,
}

impl Session {
    pub fn session_type(&self) -> SessionType {
        self.session_type
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    /// Drops the wait timeout; courier sets it once the message is wired.
    pub fn clear_wait_timeout(&mut self) {
        self.wait_timeout = None;
    }

    /// Finds the run and step a step UUID belongs to.
    pub fn find_step(&self, step_uuid: &Uuid) -> Option<(&Run, &Step)> {
        self.runs.iter().find_map(|run| {
            run.path
                .iter()
                .find(|step| &step.uuid == step_uuid)
                .map(|step| (run, step))
        })
    }

    /// When the current wait began: arrival at the last step of the waiting run.
    pub fn wait_started_on(&self) -> Option<DateTime<Utc>> {
        if self.status != SessionStatus::Waiting {
            return None;
        }
        self.runs
            .iter()
            .rev()
            .find(|run| run.status == RunStatus::Waiting)
            .and_then(|run| run.path.last())
            .map(|step| step.arrived_on)
    }

    pub fn ended_on(&self) -> Option<DateTime<Utc>> {
        if self.status == SessionStatus::Waiting {
            None
        } else {
            self.runs.iter().filter_map(|r| r.exited_on).max()
        }
    }
}

struct SessionRow<'a>(&'a Session);

impl BulkRow for SessionRow<'_> {
    const COLUMNS: usize = 12;

    fn bind_row<'q>(&'q self, row: &mut Separated<'_, 'q, Postgres, &'static str>) {
        let s = self.0;
        row.push_bind(s.uuid)
            .push_bind(s.org_id)
            .push_bind(s.contact_id)
            .push_bind(s.session_type.code())
            .push_bind(s.status.code())
            .push_bind(s.current_flow_id)
            .push_bind(s.call_id)
            .push_bind(s.created_on)
            .push_bind(s.ended_on())
            .push_bind(s.wait_started_on())
            .push_bind(s.wait_timeout)
            .push_bind(s.wait_expires_on);
    }
}

struct RunRow {
    uuid: Uuid,
    org_id: OrgId,
    flow_id: Option<FlowId>,
    contact_id: ContactId,
    session_uuid: Uuid,
    status: RunStatus,
    created_on: DateTime<Utc>,
    exited_on: Option<DateTime<Utc>>,
    path: serde_json::Value,
}

impl BulkRow for RunRow {
    const COLUMNS: usize = 9;

    fn bind_row<'q>(&'q self, row: &mut Separated<'_, 'q, Postgres, &'static str>) {
        row.push_bind(self.uuid)
            .push_bind(self.org_id)
            .push_bind(self.flow_id)
            .push_bind(self.contact_id)
            .push_bind(self.session_uuid)
            .push_bind(self.status.code())
            .push_bind(self.created_on)
            .push_bind(self.exited_on)
            .push_bind(&self.path);
    }
}

/// Writes new sessions and all of their runs. Run flow ids are resolved by
/// the caller because runs only reference flows by UUID.
pub async fn insert_sessions(
    conn: &mut PgConnection,
    sessions: &[&Session],
    flow_id_for: impl Fn(&Uuid) -> Option<FlowId>,
) -> Result<(), DbError> {
    if sessions.is_empty() {
        return Ok(());
    }

    let rows: Vec<SessionRow> = sessions.iter().map(|s| SessionRow(s)).collect();
    db::bulk_execute(
        &mut *conn,
        "error inserting sessions",
        "INSERT INTO flows_flowsession(uuid, org_id, contact_id, session_type, status, current_flow_id, call_id, created_on, ended_on, wait_started_on, timeout_on, wait_expires_on) ",
        &rows,
        "",
    )
    .await?;

    let runs: Vec<RunRow> = sessions
        .iter()
        .flat_map(|s| {
            s.runs.iter().map(|run| RunRow {
                uuid: run.uuid,
                org_id: s.org_id,
                flow_id: flow_id_for(&run.flow.uuid),
                contact_id: s.contact_id,
                session_uuid: s.uuid,
                status: run.status,
                created_on: run.created_on,
                exited_on: run.exited_on,
                path: serde_json::to_value(&run.path).unwrap_or_default(),
            })
        })
        .collect();

    db::bulk_execute(
        conn,
        "error inserting runs",
        "INSERT INTO flows_flowrun(uuid, org_id, flow_id, contact_id, session_uuid, status, created_on, exited_on, path) ",
        &runs,
        "",
    )
    .await?;
    Ok(())
}

/// Which waiting sessions an interrupt applies to.
#[derive(Debug, Clone, Copy)]
pub enum SessionSelector<'a> {
    Contacts(&'a [ContactId]),
    Flows(&'a [FlowId]),
    /// Sessions whose current call is on the channel
    Channel(ChannelId),
}

impl SessionSelector<'_> {
    fn is_empty(&self) -> bool {
        match self {
            Self::Contacts(ids) => ids.is_empty(),
            Self::Flows(ids) => ids.is_empty(),
            Self::Channel(_) => false,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct ExitedSession {
    pub uuid: Uuid,
    pub contact_id: ContactId,
}

const EXIT_SET: &str =
    "SET status = $1, ended_on = NOW(), wait_started_on = NULL, timeout_on = NULL, wait_expires_on = NULL";

/// Exits the waiting sessions matched by a selector with the given status,
/// along with their active and waiting runs, and clears the current-session
/// pointer of contacts still pointing at them.
///
/// Every statement re-checks `status = 'W'`, so sessions already exited by a
/// concurrent writer are left alone.
pub async fn exit_sessions(
    conn: &mut PgConnection,
    selector: SessionSelector<'_>,
    status: SessionStatus,
) -> Result<Vec<ExitedSession>, DbError> {
    if selector.is_empty() {
        return Ok(Vec::new());
    }

    let exited: Vec<ExitedSession> = match selector {
        SessionSelector::Contacts(ids) => {
            sqlx::query_as(&format!(
                "UPDATE flows_flowsession {EXIT_SET} WHERE contact_id = ANY($2) AND status = 'W' RETURNING uuid, contact_id"
            ))
            .bind(status.code())
            .bind(ids)
            .fetch_all(&mut *conn)
            .await
        }
        SessionSelector::Flows(ids) => {
            sqlx::query_as(&format!(
                "UPDATE flows_flowsession {EXIT_SET} WHERE current_flow_id = ANY($2) AND status = 'W' RETURNING uuid, contact_id"
            ))
            .bind(status.code())
            .bind(ids)
            .fetch_all(&mut *conn)
            .await
        }
        SessionSelector::Channel(channel_id) => {
            // matches on the call the session is bound to right now, so a
            // session re-bound to a call on another channel is skipped
            sqlx::query_as(&format!(
                r#"UPDATE flows_flowsession s {EXIT_SET}
                     FROM ivr_call c
                    WHERE s.call_id = c.id AND c.channel_id = $2 AND s.status = 'W'
                RETURNING s.uuid, s.contact_id"#
            ))
            .bind(status.code())
            .bind(channel_id)
            .fetch_all(&mut *conn)
            .await
        }
    }
    .context("error exiting sessions")?;

    if exited.is_empty() {
        return Ok(exited);
    }

    let uuids: Vec<Uuid> = exited.iter().map(|s| s.uuid).collect();
    let run_status = RunStatus::from(status);

    sqlx::query(
        "UPDATE flows_flowrun SET status = $1, exited_on = NOW(), modified_on = NOW() WHERE session_uuid = ANY($2) AND status IN ('A', 'W')",
    )
    .bind(run_status.code())
    .bind(&uuids)
    .execute(&mut *conn)
    .await
    .context("error exiting runs")?;

    sqlx::query(
        "UPDATE contacts_contact SET current_session_uuid = NULL, current_flow_id = NULL, modified_on = NOW() WHERE current_session_uuid = ANY($1)",
    )
    .bind(&uuids)
    .execute(conn)
    .await
    .context("error clearing contact current sessions")?;

    debug!(count = exited.len(), status = status.code(), "Exited sessions");
    Ok(exited)
}

/// Ends every call on a channel that is still live.
pub async fn interrupt_channel_calls(
    conn: &mut PgConnection,
    channel_id: ChannelId,
) -> Result<u64, DbError> {
    let active: Vec<&str> = ACTIVE_CALL_STATUSES.iter().map(|s| s.code()).collect();
    let result = sqlx::query(
        "UPDATE ivr_call SET status = $1, ended_on = NOW(), modified_on = NOW() WHERE channel_id = $2 AND status = ANY($3)",
    )
    .bind(CallStatus::Interrupted.code())
    .bind(channel_id)
    .bind(&active)
    .execute(conn)
    .await
    .context("error interrupting channel calls")?;

    Ok(result.rows_affected())
}

#[cfg(test)]
pub(crate) mod testdata {
    use super::*;

    pub fn waiting_session(contact_id: i64, flow: FlowReference, session_type: SessionType) -> Session {
        let now = Utc::now();
        Session {
            uuid: Uuid::new_v4(),
            org_id: OrgId(1),
            contact_id: ContactId(contact_id),
            session_type,
            status: SessionStatus::Waiting,
            current_flow_id: None,
            call_id: None,
            wait_timeout: Some(now + chrono::Duration::minutes(5)),
            wait_expires_on: Some(now + chrono::Duration::days(7)),
            runs: vec![Run {
                uuid: Uuid::new_v4(),
                flow,
                status: RunStatus::Waiting,
                path: vec![Step {
                    uuid: Uuid::new_v4(),
                    node_uuid: Uuid::new_v4(),
                    arrived_on: now,
                }],
                created_on: now,
                exited_on: None,
            }],
            created_on: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testdata::waiting_session;
    use super::*;
    use crate::db::testdata::test_db;
    use crate::models::contact::testdata::insert_contact;

    async fn session_status(conn: &mut PgConnection, uuid: Uuid) -> (String, bool, bool) {
        sqlx::query_as("SELECT status, ended_on IS NOT NULL, timeout_on IS NULL FROM flows_flowsession WHERE uuid = $1")
            .bind(uuid)
            .fetch_one(conn)
            .await
            .unwrap()
    }

    async fn run_statuses(conn: &mut PgConnection, session_uuid: Uuid) -> Vec<(String, bool)> {
        sqlx::query_as("SELECT status, exited_on IS NOT NULL FROM flows_flowrun WHERE session_uuid = $1 ORDER BY id")
            .bind(session_uuid)
            .fetch_all(conn)
            .await
            .unwrap()
    }

    async fn point_at(conn: &mut PgConnection, contact_id: ContactId, session: &Session) {
        sqlx::query("UPDATE contacts_contact SET current_session_uuid = $2, current_flow_id = 7 WHERE id = $1")
            .bind(contact_id)
            .bind(session.uuid)
            .execute(conn)
            .await
            .unwrap();
    }

    async fn insert_call(conn: &mut PgConnection, channel_id: i64, contact_id: ContactId, status: CallStatus) -> CallId {
        sqlx::query_scalar("INSERT INTO ivr_call(org_id, channel_id, contact_id, status) VALUES (1, $1, $2, $3) RETURNING id")
            .bind(channel_id)
            .bind(contact_id)
            .bind(status.code())
            .fetch_one(conn)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_exit_sessions() {
        let Some(db) = test_db().await else { return };
        let mut tx = db.begin().await.unwrap();

        let cathy = insert_contact(&mut *tx, "Cathy").await;
        let george = insert_contact(&mut *tx, "George").await;
        let alexandra = insert_contact(&mut *tx, "Alexandra").await;
        let bob = insert_contact(&mut *tx, "Bob").await;
        let call = insert_call(&mut tx, 10, alexandra, CallStatus::InProgress).await;

        let by_contact = waiting_session(cathy.0, flow_ref(), SessionType::Messaging);
        let mut by_flow = waiting_session(george.0, flow_ref(), SessionType::Messaging);
        by_flow.current_flow_id = Some(FlowId(7));
        let mut by_call = waiting_session(alexandra.0, flow_ref(), SessionType::Voice);
        by_call.call_id = Some(call);
        let untouched = waiting_session(bob.0, flow_ref(), SessionType::Messaging);
        let mut ended = waiting_session(cathy.0, flow_ref(), SessionType::Messaging);
        ended.status = SessionStatus::Completed;
        ended.current_flow_id = Some(FlowId(7));
        ended.runs[0].status = RunStatus::Completed;
        ended.runs[0].exited_on = Some(Utc::now());

        let all = [&by_contact, &by_flow, &by_call, &untouched, &ended];
        insert_sessions(&mut tx, &all, |_| Some(FlowId(7))).await.unwrap();
        point_at(&mut tx, cathy, &by_contact).await;
        point_at(&mut tx, bob, &untouched).await;

        let exited = exit_sessions(&mut tx, SessionSelector::Contacts(&[cathy]), SessionStatus::Interrupted)
            .await
            .unwrap();
        assert_eq!(exited.len(), 1);
        assert_eq!(exited[0].uuid, by_contact.uuid);
        assert_eq!(exited[0].contact_id, cathy);
        assert_eq!(session_status(&mut tx, by_contact.uuid).await, ("I".to_string(), true, true));
        assert_eq!(run_statuses(&mut tx, by_contact.uuid).await, vec![("I".to_string(), true)]);

        let pointer: Option<Uuid> = sqlx::query_scalar("SELECT current_session_uuid FROM contacts_contact WHERE id = $1")
            .bind(cathy)
            .fetch_one(&mut *tx)
            .await
            .unwrap();
        assert!(pointer.is_none());

        // already exited sessions are skipped
        let again = exit_sessions(&mut tx, SessionSelector::Contacts(&[cathy]), SessionStatus::Interrupted)
            .await
            .unwrap();
        assert!(again.is_empty());

        let exited = exit_sessions(&mut tx, SessionSelector::Flows(&[FlowId(7)]), SessionStatus::Expired)
            .await
            .unwrap();
        assert_eq!(exited.len(), 1);
        assert_eq!(exited[0].uuid, by_flow.uuid);
        assert_eq!(run_statuses(&mut tx, by_flow.uuid).await, vec![("X".to_string(), true)]);

        let none = exit_sessions(&mut tx, SessionSelector::Channel(ChannelId(11)), SessionStatus::Interrupted)
            .await
            .unwrap();
        assert!(none.is_empty());
        let exited = exit_sessions(&mut tx, SessionSelector::Channel(ChannelId(10)), SessionStatus::Interrupted)
            .await
            .unwrap();
        assert_eq!(exited.len(), 1);
        assert_eq!(exited[0].uuid, by_call.uuid);

        assert_eq!(session_status(&mut tx, untouched.uuid).await, ("W".to_string(), false, false));
        assert_eq!(run_statuses(&mut tx, untouched.uuid).await, vec![("W".to_string(), false)]);
        assert_eq!(session_status(&mut tx, ended.uuid).await.0, "C");
        assert_eq!(run_statuses(&mut tx, ended.uuid).await, vec![("C".to_string(), true)]);

        let pointer: Option<Uuid> = sqlx::query_scalar("SELECT current_session_uuid FROM contacts_contact WHERE id = $1")
            .bind(bob)
            .fetch_one(&mut *tx)
            .await
            .unwrap();
        assert_eq!(pointer, Some(untouched.uuid));
    }

    #[tokio::test]
    async fn test_interrupt_channel_calls() {
        let Some(db) = test_db().await else { return };
        let mut tx = db.begin().await.unwrap();
        let contact = insert_contact(&mut *tx, "Cathy").await;

        let statuses = [
            CallStatus::Pending,
            CallStatus::Queued,
            CallStatus::Wired,
            CallStatus::InProgress,
            CallStatus::Completed,
            CallStatus::Failed,
        ];
        let mut calls = Vec::new();
        for status in statuses {
            calls.push(insert_call(&mut tx, 20, contact, status).await);
        }
        let elsewhere = insert_call(&mut tx, 21, contact, CallStatus::InProgress).await;

        assert_eq!(interrupt_channel_calls(&mut tx, ChannelId(20)).await.unwrap(), 4);

        let after: Vec<(String, bool)> =
            sqlx::query_as("SELECT status, ended_on IS NOT NULL FROM ivr_call WHERE id = ANY($1) ORDER BY id")
                .bind(&calls)
                .fetch_all(&mut *tx)
                .await
                .unwrap();
        let after: Vec<(&str, bool)> = after.iter().map(|(s, e)| (s.as_str(), *e)).collect();
        assert_eq!(
            after,
            vec![("I", true), ("I", true), ("I", true), ("I", true), ("D", false), ("F", false)]
        );

        let other: String = sqlx::query_scalar("SELECT status FROM ivr_call WHERE id = $1")
            .bind(elsewhere)
            .fetch_one(&mut *tx)
            .await
            .unwrap();
        assert_eq!(other, "R");
    }

    fn flow_ref() -> FlowReference {
        FlowReference {
            uuid: Uuid::new_v4(),
            name: "Favorites".to_string(),
        }
    }

    #[test]
    fn test_find_step() {
        let flow = flow_ref();
        let session = waiting_session(1, flow.clone(), SessionType::Messaging);
        let step_uuid = session.runs[0].path[0].uuid;

        let (run, step) = session.find_step(&step_uuid).unwrap();
        assert_eq!(run.flow, flow);
        assert_eq!(step.uuid, step_uuid);
        assert!(session.find_step(&Uuid::new_v4()).is_none());
    }

    #[test]
    fn test_clear_wait_timeout() {
        let mut session = waiting_session(1, flow_ref(), SessionType::Messaging);
        assert!(session.wait_timeout.is_some());
        session.clear_wait_timeout();
        assert!(session.wait_timeout.is_none());
        assert!(session.wait_expires_on.is_some());
    }

    #[test]
    fn test_run_status_follows_session_status() {
        assert_eq!(RunStatus::from(SessionStatus::Interrupted), RunStatus::Interrupted);
        assert_eq!(RunStatus::from(SessionStatus::Waiting), RunStatus::Waiting);
        assert_eq!(RunStatus::Interrupted.code(), SessionStatus::Interrupted.code());
    }

    #[test]
    fn test_empty_selectors() {
        assert!(SessionSelector::Contacts(&[]).is_empty());
        assert!(SessionSelector::Flows(&[]).is_empty());
        assert!(!SessionSelector::Channel(ChannelId(1)).is_empty());
    }

    #[test]
    fn test_wait_started_on() {
        let mut session = waiting_session(1, flow_ref(), SessionType::Messaging);
        let arrived = session.runs[0].path[0].arrived_on;
        assert_eq!(session.wait_started_on(), Some(arrived));
        assert_ne!(session.wait_started_on(), session.wait_timeout);

        // clearing the timeout leaves the wait start alone
        session.clear_wait_timeout();
        assert_eq!(session.wait_started_on(), Some(arrived));

        session.status = SessionStatus::Completed;
        assert!(session.wait_started_on().is_none());
    }

    #[test]
    fn test_ended_on() {
        let mut session = waiting_session(1, flow_ref(), SessionType::Voice);
        assert!(session.ended_on().is_none());

        let exited = Utc::now();
        session.status = SessionStatus::Completed;
        session.runs[0].exited_on = Some(exited);
        assert_eq!(session.ended_on(), Some(exited));
    }
}
