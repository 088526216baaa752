//! Contacts, their URNs and the denormalized fields kept on the contact row.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sqlx::query_builder::Separated;
use sqlx::{FromRow, PgConnection, PgExecutor, PgPool, Postgres};
use uuid::Uuid;

use super::{ContactId, DbContext, DbError, FlowId, OrgId, UrnId};
use crate::db::{self, BulkRow};

/// Priority given to the first URN of a contact; later URNs count down.
pub const TOP_URN_PRIORITY: i32 = 1000;

/// Errors parsing a URN string.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum UrnError {
    #[error("URN '{0}' has no scheme")]
    MissingScheme(String),

    #[error("URN '{0}' has an empty path")]
    EmptyPath(String),

    #[error("URN '{0}' has an invalid id")]
    InvalidId(String),
}

/// A contact URN such as `tel:+250700000000`.
///
/// When the URN is known to the database its row id travels with it as an
/// `id` query parameter, e.g. `tel:+250700000000?id=23`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Urn {
    pub scheme: String,
    pub path: String,
    pub id: Option<UrnId>,
}

impl Urn {
    pub fn new(scheme: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            path: path.into(),
            id: None,
        }
    }

    /// `scheme:path` without the query, the unique key of a URN in an org.
    pub fn identity(&self) -> String {
        format!("{}:{}", self.scheme, self.path)
    }

    pub fn with_id(mut self, id: UrnId) -> Self {
        self.id = Some(id);
        self
    }

    /// URNs whose id is absent or zero have never been written.
    pub fn needs_id(&self) -> bool {
        self.id.is_none_or(|id| id.0 == 0)
    }
}

impl FromStr for Urn {
    type Err = UrnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, rest) = s
            .split_once(':')
            .filter(|(scheme, _)| !scheme.is_empty())
            .ok_or_else(|| UrnError::MissingScheme(s.to_string()))?;

        let (path, query) = match rest.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (rest, None),
        };
        if path.is_empty() {
            return Err(UrnError::EmptyPath(s.to_string()));
        }

        let mut id = None;
        for pair in query.unwrap_or("").split('&').filter(|p| !p.is_empty()) {
            if let Some(value) = pair.strip_prefix("id=") {
                let parsed = value
                    .parse::<i64>()
                    .map_err(|_| UrnError::InvalidId(s.to_string()))?;
                id = Some(UrnId(parsed));
            }
        }

        Ok(Self {
            scheme: scheme.to_lowercase(),
            path: path.to_string(),
            id,
        })
    }
}

impl fmt::Display for Urn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scheme, self.path)?;
        if let Some(id) = self.id {
            write!(f, "?id={id}")?;
        }
        Ok(())
    }
}

impl Serialize for Urn {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Urn {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Contact status codes as stored in `contacts_contact.status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContactStatus {
    #[serde(rename = "A")]
    Active,
    #[serde(rename = "B")]
    Blocked,
    #[serde(rename = "S")]
    Stopped,
    #[serde(rename = "V")]
    Archived,
}

impl ContactStatus {
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "A" => Some(Self::Active),
            "B" => Some(Self::Blocked),
            "S" => Some(Self::Stopped),
            "V" => Some(Self::Archived),
            _ => None,
        }
    }
}

/// A contact as handed to the engine when starting a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub id: ContactId,
    pub uuid: Uuid,
    pub name: Option<String>,
    pub language: Option<String>,
    pub status: ContactStatus,
    /// Ordered by priority, first is preferred
    pub urns: Vec<Urn>,
}

#[derive(FromRow)]
struct ContactRow {
    id: ContactId,
    uuid: Uuid,
    name: Option<String>,
    language: Option<String>,
    status: String,
    urns: Vec<String>,
}

/// Loads active contacts with their URNs, ordered by id.
pub async fn load_contacts(
    db: &PgPool,
    org_id: OrgId,
    ids: &[ContactId],
) -> Result<Vec<Contact>, DbError> {
    let rows: Vec<ContactRow> = sqlx::query_as(
        r#"
SELECT c.id, c.uuid, c.name, c.language, c.status,
       COALESCE(ARRAY(
           SELECT u.identity || '?id=' || u.id FROM contacts_contacturn u
            WHERE u.contact_id = c.id
            ORDER BY u.priority DESC, u.id ASC
       ), '{}') AS urns
  FROM contacts_contact c
 WHERE c.org_id = $1 AND c.id = ANY($2) AND c.is_active = TRUE
 ORDER BY c.id"#,
    )
    .bind(org_id)
    .bind(ids)
    .fetch_all(db)
    .await
    .context("error loading contacts")?;

    Ok(rows
        .into_iter()
        .map(|row| Contact {
            id: row.id,
            uuid: row.uuid,
            name: row.name,
            language: row.language,
            status: ContactStatus::from_code(&row.status).unwrap_or(ContactStatus::Active),
            urns: row.urns.iter().filter_map(|u| u.parse().ok()).collect(),
        })
        .collect())
}

/// Looks up contact ids by UUID, ignoring unknown UUIDs.
pub async fn contact_ids_from_uuids<'e>(
    db: impl PgExecutor<'e>,
    org_id: OrgId,
    uuids: &[Uuid],
) -> Result<Vec<ContactId>, DbError> {
    if uuids.is_empty() {
        return Ok(Vec::new());
    }
    sqlx::query_scalar(
        "SELECT id FROM contacts_contact WHERE org_id = $1 AND uuid = ANY($2) AND is_active = TRUE ORDER BY id",
    )
    .bind(org_id)
    .bind(uuids)
    .fetch_all(db)
    .await
    .context("error looking up contacts by uuid")
}

/// Returns the id of the URN row for `urn`, creating it for the contact if it
/// doesn't exist. An existing orphaned URN is attached to the contact, one
/// owned by another contact is left alone and reported as taken.
pub async fn get_or_create_urn(
    conn: &mut PgConnection,
    org_id: OrgId,
    contact_id: ContactId,
    urn: &Urn,
) -> Result<UrnId, DbError> {
    let row: (UrnId, Option<ContactId>) = sqlx::query_as(
        r#"
INSERT INTO contacts_contacturn(org_id, contact_id, identity, scheme, path, priority)
     VALUES ($1, $2, $3, $4, $5, $6)
ON CONFLICT (identity, org_id)
  DO UPDATE SET contact_id = COALESCE(contacts_contacturn.contact_id, EXCLUDED.contact_id)
  RETURNING id, contact_id"#,
    )
    .bind(org_id)
    .bind(contact_id)
    .bind(urn.identity())
    .bind(&urn.scheme)
    .bind(&urn.path)
    .bind(TOP_URN_PRIORITY / 2)
    .fetch_one(conn)
    .await
    .context("error getting or creating urn")?;

    claimed_urn(urn, contact_id, row)
}

fn claimed_urn(urn: &Urn, contact_id: ContactId, (id, owner): (UrnId, Option<ContactId>)) -> Result<UrnId, DbError> {
    match owner {
        Some(owner) if owner != contact_id => Err(DbError::UrnTaken {
            identity: urn.identity(),
            owner,
        }),
        _ => Ok(id),
    }
}

/// Resolves URNs to contacts, creating a contact for every URN not yet known
/// to the org. Returns contact ids in input order.
pub async fn get_or_create_contacts_for_urns(
    conn: &mut PgConnection,
    org_id: OrgId,
    urns: &[Urn],
) -> Result<Vec<ContactId>, DbError> {
    let mut ids = Vec::with_capacity(urns.len());
    for urn in urns {
        let existing: Option<ContactId> = sqlx::query_scalar(
            "SELECT contact_id FROM contacts_contacturn WHERE org_id = $1 AND identity = $2 AND contact_id IS NOT NULL",
        )
        .bind(org_id)
        .bind(urn.identity())
        .fetch_optional(&mut *conn)
        .await
        .context("error looking up contact by urn")?;

        let contact_id = match existing {
            Some(id) => id,
            None => {
                let id: ContactId = sqlx::query_scalar(
                    r#"
INSERT INTO contacts_contact(org_id, uuid, status, is_active, created_on, modified_on)
     VALUES ($1, $2, 'A', TRUE, NOW(), NOW())
  RETURNING id"#,
                )
                .bind(org_id)
                .bind(Uuid::new_v4())
                .fetch_one(&mut *conn)
                .await
                .context("error creating contact")?;

                get_or_create_urn(&mut *conn, org_id, id, urn).await?;
                id
            }
        };
        ids.push(contact_id);
    }
    Ok(ids)
}

/// The full, ordered URN list a contact should end up with.
#[derive(Debug, Clone, PartialEq)]
pub struct ContactUrnsChange {
    pub contact_id: ContactId,
    pub urns: Vec<Urn>,
}

struct UrnRow {
    org_id: OrgId,
    contact_id: ContactId,
    identity: String,
    scheme: String,
    path: String,
    priority: i32,
}

impl BulkRow for UrnRow {
    const COLUMNS: usize = 6;

    fn bind_row<'q>(&'q self, row: &mut Separated<'_, 'q, Postgres, &'static str>) {
        row.push_bind(self.org_id)
            .push_bind(self.contact_id)
            .push_bind(&self.identity)
            .push_bind(&self.scheme)
            .push_bind(&self.path)
            .push_bind(self.priority);
    }
}

/// Expands URN changes into rows with priorities reflecting list order.
fn urn_rows(org_id: OrgId, changes: &[ContactUrnsChange]) -> Vec<UrnRow> {
    changes
        .iter()
        .flat_map(|change| {
            change.urns.iter().enumerate().map(move |(i, urn)| UrnRow {
                org_id,
                contact_id: change.contact_id,
                identity: urn.identity(),
                scheme: urn.scheme.clone(),
                path: urn.path.clone(),
                priority: TOP_URN_PRIORITY - i as i32,
            })
        })
        .collect()
}

/// Applies the final URN list of each contact. URNs no longer in a contact's
/// list are detached, the rest are claimed with priorities in list order so
/// that the first URN is the primary one.
pub async fn update_contact_urns(
    conn: &mut PgConnection,
    org_id: OrgId,
    changes: &[ContactUrnsChange],
) -> Result<(), DbError> {
    if changes.is_empty() {
        return Ok(());
    }

    let contact_ids: Vec<ContactId> = changes.iter().map(|c| c.contact_id).collect();
    let rows = urn_rows(org_id, changes);
    let keep_contacts: Vec<ContactId> = rows.iter().map(|r| r.contact_id).collect();
    let keep_identities: Vec<&str> = rows.iter().map(|r| r.identity.as_str()).collect();

    sqlx::query(
        r#"
UPDATE contacts_contacturn u
   SET contact_id = NULL, priority = 0
 WHERE u.contact_id = ANY($1)
   AND (u.contact_id, u.identity) NOT IN (SELECT * FROM UNNEST($2::bigint[], $3::text[]))"#,
    )
    .bind(&contact_ids)
    .bind(&keep_contacts)
    .bind(&keep_identities)
    .execute(&mut *conn)
    .await
    .context("error detaching contact urns")?;

    db::bulk_execute(
        &mut *conn,
        "error upserting contact urns",
        "INSERT INTO contacts_contacturn(org_id, contact_id, identity, scheme, path, priority) ",
        &rows,
        " ON CONFLICT (identity, org_id) DO UPDATE SET contact_id = EXCLUDED.contact_id, priority = EXCLUDED.priority",
    )
    .await?;

    touch_contacts(conn, &contact_ids).await
}

/// Bumps `modified_on` of contacts whose related rows changed.
pub async fn touch_contacts(conn: &mut PgConnection, ids: &[ContactId]) -> Result<(), DbError> {
    sqlx::query("UPDATE contacts_contact SET modified_on = NOW() WHERE id = ANY($1)")
        .bind(ids)
        .execute(conn)
        .await
        .context("error touching contacts")?;
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub struct NameUpdate {
    pub contact_id: ContactId,
    pub name: String,
}

impl BulkRow for NameUpdate {
    const COLUMNS: usize = 2;

    fn bind_row<'q>(&'q self, row: &mut Separated<'_, 'q, Postgres, &'static str>) {
        row.push_bind(self.contact_id).push_bind(&self.name);
    }
}

pub async fn update_contact_names(
    conn: &mut PgConnection,
    updates: &[NameUpdate],
) -> Result<(), DbError> {
    db::bulk_execute(
        conn,
        "error updating contact names",
        "UPDATE contacts_contact c SET name = r.name, modified_on = NOW() FROM (",
        updates,
        ") AS r(contact_id, name) WHERE c.id = r.contact_id",
    )
    .await?;
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub struct LastSeenUpdate {
    pub contact_id: ContactId,
    pub last_seen_on: DateTime<Utc>,
}

impl BulkRow for LastSeenUpdate {
    const COLUMNS: usize = 2;

    fn bind_row<'q>(&'q self, row: &mut Separated<'_, 'q, Postgres, &'static str>) {
        row.push_bind(self.contact_id).push_bind(self.last_seen_on);
    }
}

pub async fn update_last_seen_on(
    conn: &mut PgConnection,
    updates: &[LastSeenUpdate],
) -> Result<(), DbError> {
    db::bulk_execute(
        conn,
        "error updating contact last seen",
        "UPDATE contacts_contact c SET last_seen_on = r.seen, modified_on = NOW() FROM (",
        updates,
        ") AS r(contact_id, seen) WHERE c.id = r.contact_id AND (c.last_seen_on IS NULL OR c.last_seen_on < r.seen)",
    )
    .await?;
    Ok(())
}

/// New value of the denormalized current-session pointer on a contact.
#[derive(Debug, Clone, PartialEq)]
pub struct CurrentSessionUpdate {
    pub contact_id: ContactId,
    pub session_uuid: Option<Uuid>,
    pub flow_id: Option<FlowId>,
}

impl BulkRow for CurrentSessionUpdate {
    const COLUMNS: usize = 3;

    fn bind_row<'q>(&'q self, row: &mut Separated<'_, 'q, Postgres, &'static str>) {
        row.push_bind(self.contact_id)
            .push_bind(self.session_uuid)
            .push_bind(self.flow_id);
    }
}

/// Updates the current session and flow of many contacts in one statement.
pub async fn bulk_update_contact_current_session(
    conn: &mut PgConnection,
    updates: &[CurrentSessionUpdate],
) -> Result<(), DbError> {
    db::bulk_execute(
        conn,
        "error updating contact current sessions",
        "UPDATE contacts_contact c SET current_session_uuid = r.session_uuid::uuid, current_flow_id = r.flow_id::bigint, modified_on = NOW() FROM (",
        updates,
        ") AS r(contact_id, session_uuid, flow_id) WHERE c.id = r.contact_id::bigint",
    )
    .await?;
    Ok(())
}

/// What start exclusions need to know about a contact.
#[derive(Debug, Clone, FromRow)]
pub struct ContactState {
    pub id: ContactId,
    pub status: String,
    pub current_flow_id: Option<FlowId>,
    pub last_seen_on: Option<DateTime<Utc>>,
    pub started_previously: bool,
}

/// Loads exclusion state for contacts, `started_previously` relative to `flow_id`.
pub async fn load_contact_states(
    db: &PgPool,
    org_id: OrgId,
    ids: &[ContactId],
    flow_id: FlowId,
) -> Result<Vec<ContactState>, DbError> {
    sqlx::query_as(
        r#"
SELECT c.id, c.status, c.current_flow_id, c.last_seen_on,
       EXISTS (SELECT 1 FROM flows_flowrun r WHERE r.contact_id = c.id AND r.flow_id = $3) AS started_previously
  FROM contacts_contact c
 WHERE c.org_id = $1 AND c.id = ANY($2) AND c.is_active = TRUE
 ORDER BY c.id"#,
    )
    .bind(org_id)
    .bind(ids)
    .bind(flow_id)
    .fetch_all(db)
    .await
    .context("error loading contact states")
}

/// Groups URN changes by contact keeping only each contact's latest list.
pub fn latest_urns_by_contact(changes: Vec<ContactUrnsChange>) -> Vec<ContactUrnsChange> {
    let mut order = Vec::new();
    let mut latest: HashMap<ContactId, ContactUrnsChange> = HashMap::new();
    for change in changes {
        if !latest.contains_key(&change.contact_id) {
            order.push(change.contact_id);
        }
        latest.insert(change.contact_id, change);
    }
    order.into_iter().filter_map(|id| latest.remove(&id)).collect()
}

#[cfg(test)]
pub(crate) mod testdata {
    use super::*;

    /// Inserts an active contact in org 1, last modified in 2020.
    pub async fn insert_contact<'e>(db: impl PgExecutor<'e>, name: &str) -> ContactId {
        sqlx::query_scalar(
            r#"
INSERT INTO contacts_contact(org_id, uuid, name, created_on, modified_on)
     VALUES (1, $1, $2, '2020-01-01', '2020-01-01')
  RETURNING id"#,
        )
        .bind(Uuid::new_v4())
        .bind(name)
        .fetch_one(db)
        .await
        .unwrap()
    }

    pub async fn modified_on<'e>(db: impl PgExecutor<'e>, id: ContactId) -> DateTime<Utc> {
        sqlx::query_scalar("SELECT modified_on FROM contacts_contact WHERE id = $1")
            .bind(id)
            .fetch_one(db)
            .await
            .unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::testdata::insert_contact;
    use super::*;
    use crate::db::testdata::test_db;

    #[tokio::test]
    async fn test_get_or_create_urn() {
        let Some(db) = test_db().await else { return };
        let mut tx = db.begin().await.unwrap();
        let cathy = insert_contact(&mut *tx, "Cathy").await;
        let bob = insert_contact(&mut *tx, "Bob").await;
        let urn = Urn::new("tel", "+250700000077");

        let id = get_or_create_urn(&mut tx, OrgId(1), cathy, &urn).await.unwrap();
        let owner: Option<ContactId> = sqlx::query_scalar("SELECT contact_id FROM contacts_contacturn WHERE id = $1")
            .bind(id)
            .fetch_one(&mut *tx)
            .await
            .unwrap();
        assert_eq!(owner, Some(cathy));

        // asking again for the same contact returns the same row
        assert_eq!(get_or_create_urn(&mut tx, OrgId(1), cathy, &urn).await.unwrap(), id);

        // another contact can't take it over
        let err = get_or_create_urn(&mut tx, OrgId(1), bob, &urn).await.unwrap_err();
        assert!(matches!(err, DbError::UrnTaken { owner, .. } if owner == cathy));
    }

    #[test]
    fn test_parse_urn() {
        let urn: Urn = "tel:+250700000000".parse().unwrap();
        assert_eq!(urn.scheme, "tel");
        assert_eq!(urn.path, "+250700000000");
        assert!(urn.id.is_none());
        assert!(urn.needs_id());

        let urn: Urn = "tel:+250700000000?id=23&priority=1000".parse().unwrap();
        assert_eq!(urn.id, Some(UrnId(23)));
        assert!(!urn.needs_id());
        assert_eq!(urn.identity(), "tel:+250700000000");
        assert_eq!(urn.to_string(), "tel:+250700000000?id=23");

        let zero: Urn = "tel:+1?id=0".parse().unwrap();
        assert!(zero.needs_id());
    }

    #[test]
    fn test_parse_urn_errors() {
        assert!(matches!("+250700".parse::<Urn>(), Err(UrnError::MissingScheme(_))));
        assert!(matches!("tel:".parse::<Urn>(), Err(UrnError::EmptyPath(_))));
        assert!(matches!("tel:+1?id=x".parse::<Urn>(), Err(UrnError::InvalidId(_))));
    }

    #[test]
    fn test_urn_serde() {
        let urn = Urn::new("tel", "+1").with_id(UrnId(4));
        assert_eq!(serde_json::to_string(&urn).unwrap(), "\"tel:+1?id=4\"");
        let parsed: Urn = serde_json::from_str("\"twitter:bob\"").unwrap();
        assert_eq!(parsed, Urn::new("twitter", "bob"));
    }

    #[test]
    fn test_urn_rows_priorities_follow_order() {
        let changes = vec![ContactUrnsChange {
            contact_id: ContactId(1),
            urns: vec![Urn::new("tel", "+1"), Urn::new("twitter", "bob")],
        }];
        let rows = urn_rows(OrgId(1), &changes);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].identity, "tel:+1");
        assert!(rows[0].priority > rows[1].priority);
    }

    #[test]
    fn test_claimed_urn() {
        let urn = Urn::new("tel", "+1");
        assert_eq!(claimed_urn(&urn, ContactId(1), (UrnId(9), Some(ContactId(1)))).unwrap(), UrnId(9));
        assert_eq!(claimed_urn(&urn, ContactId(1), (UrnId(9), None)).unwrap(), UrnId(9));
        assert!(matches!(
            claimed_urn(&urn, ContactId(1), (UrnId(9), Some(ContactId(2)))),
            Err(DbError::UrnTaken { owner: ContactId(2), .. })
        ));
    }

    #[test]
    fn test_latest_urns_by_contact() {
        let change = |id: i64, path: &str| ContactUrnsChange {
            contact_id: ContactId(id),
            urns: vec![Urn::new("tel", path)],
        };
        let latest = latest_urns_by_contact(vec![change(1, "+1"), change(2, "+2"), change(1, "+3")]);
        assert_eq!(latest, vec![change(1, "+3"), change(2, "+2")]);
    }
}
