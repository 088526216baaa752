use sqlx::query_builder::Separated;
use sqlx::{PgConnection, PgPool, Postgres};

use super::{ContactId, DbContext, DbError, GroupId};
use crate::db::{self, BulkRow};

/// One membership change of a contact in a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupMembership {
    pub contact_id: ContactId,
    pub group_id: GroupId,
}

impl BulkRow for GroupMembership {
    const COLUMNS: usize = 2;

    fn bind_row<'q>(&'q self, row: &mut Separated<'_, 'q, Postgres, &'static str>) {
        row.push_bind(self.contact_id).push_bind(self.group_id);
    }
}

/// Adds contacts to groups, ignoring memberships that already exist.
pub async fn add_contacts_to_groups(
    conn: &mut PgConnection,
    adds: &[GroupMembership],
) -> Result<(), DbError> {
    if adds.is_empty() {
        return Ok(());
    }

    db::bulk_execute(
        &mut *conn,
        "error adding contacts to groups",
        "INSERT INTO contacts_contactgroup_contacts(contact_id, contactgroup_id) ",
        adds,
        " ON CONFLICT (contactgroup_id, contact_id) DO NOTHING",
    )
    .await?;

    let contact_ids: Vec<ContactId> = adds.iter().map(|a| a.contact_id).collect();
    super::contact::touch_contacts(conn, &contact_ids).await
}

/// Removes contacts from groups.
pub async fn remove_contacts_from_groups(
    conn: &mut PgConnection,
    removes: &[GroupMembership],
) -> Result<(), DbError> {
    if removes.is_empty() {
        return Ok(());
    }

    db::bulk_execute(
        &mut *conn,
        "error removing contacts from groups",
        "DELETE FROM contacts_contactgroup_contacts g USING (",
        removes,
        ") AS r(contact_id, group_id) WHERE g.contact_id = r.contact_id AND g.contactgroup_id = r.group_id",
    )
    .await?;

    let contact_ids: Vec<ContactId> = removes.iter().map(|r| r.contact_id).collect();
    super::contact::touch_contacts(conn, &contact_ids).await
}

/// Ids of the active members of the given groups, deduplicated and ordered.
pub async fn group_member_ids(db: &PgPool, group_ids: &[GroupId]) -> Result<Vec<ContactId>, DbError> {
    if group_ids.is_empty() {
        return Ok(Vec::new());
    }
    sqlx::query_scalar(
        r#"
SELECT DISTINCT g.contact_id
  FROM contacts_contactgroup_contacts g
  JOIN contacts_contact c ON c.id = g.contact_id
 WHERE g.contactgroup_id = ANY($1) AND c.is_active = TRUE
 ORDER BY g.contact_id"#,
    )
    .bind(group_ids)
    .fetch_all(db)
    .await
    .context("error loading group members")
}
