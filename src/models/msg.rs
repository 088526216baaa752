//! Messages and their status codes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::query_builder::Separated;
use sqlx::{FromRow, PgConnection, PgExecutor, Postgres};
use uuid::Uuid;

use super::{ChannelId, ContactId, DbContext, DbError, FlowId, MsgId, OrgId, TemplateId, UrnId};
use crate::db::{self, BulkRow};

macro_rules! code_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident = $code:literal),* $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(
                #[serde(rename = $code)]
                $variant,
            )*
        }

        impl $name {
            /// Single letter code stored in the database.
            pub fn code(self) -> &'static str {
                match self {
                    $(Self::$variant => $code,)*
                }
            }

            pub fn from_code(code: &str) -> Option<Self> {
                match code {
                    $($code => Some(Self::$variant),)*
                    _ => None,
                }
            }
        }
    };
}

pub(crate) use code_enum;

code_enum!(
    MsgStatus {
        Initializing = "I",
        Pending = "P",
        Queued = "Q",
        Wired = "W",
        Sent = "S",
        Delivered = "D",
        Errored = "E",
        Failed = "F",
    }
);

code_enum!(
    /// Why a message ended up failed.
    FailedReason {
        Suspended = "S",
        Recipient = "C",
        Looping = "L",
        ErrorLimit = "E",
        TooOld = "O",
        NoDestination = "D",
        ChannelRemoved = "R",
    }
);

code_enum!(
    Direction {
        Incoming = "I",
        Outgoing = "O",
    }
);

/// Statuses of outgoing messages that haven't left the platform yet.
pub const UNSENT_STATUSES: [MsgStatus; 4] = [
    MsgStatus::Initializing,
    MsgStatus::Pending,
    MsgStatus::Queued,
    MsgStatus::Errored,
];

/// A message as persisted in `msgs_msg`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Msg {
    pub id: Option<MsgId>,
    pub uuid: Uuid,
    pub org_id: OrgId,
    pub direction: Direction,
    pub channel_id: Option<ChannelId>,
    pub contact_id: ContactId,
    pub contact_urn_id: Option<UrnId>,
    /// URN identity the message is sent to, e.g. `tel:+250700000000`
    pub urn: Option<String>,
    pub text: String,
    pub attachments: Vec<String>,
    pub quick_replies: Vec<String>,
    pub templating: Option<Value>,
    pub template_id: Option<TemplateId>,
    pub status: MsgStatus,
    pub failed_reason: Option<FailedReason>,
    pub high_priority: bool,
    pub created_on: DateTime<Utc>,
    pub flow_id: Option<FlowId>,
    pub session_uuid: Option<Uuid>,
}

impl Msg {
    /// Marks the message failed; a failed message always carries a reason.
    pub fn fail(&mut self, reason: FailedReason) {
        self.status = MsgStatus::Failed;
        self.failed_reason = Some(reason);
    }

    /// Whether courier should be handed this message after commit.
    pub fn is_sendable(&self) -> bool {
        self.direction == Direction::Outgoing
            && self.status == MsgStatus::Queued
            && self.channel_id.is_some()
            && self.urn.is_some()
    }
}

impl BulkRow for Msg {
    const COLUMNS: usize = 17;

    fn bind_row<'q>(&'q self, row: &mut Separated<'_, 'q, Postgres, &'static str>) {
        row.push_bind(self.uuid)
            .push_bind(self.org_id)
            .push_bind(self.direction.code())
            .push_bind(self.channel_id)
            .push_bind(self.contact_id)
            .push_bind(self.contact_urn_id)
            .push_bind(&self.text)
            .push_bind(&self.attachments)
            .push_bind(&self.quick_replies)
            .push_bind(&self.templating)
            .push_bind(self.status.code())
            .push_bind(self.failed_reason.map(FailedReason::code))
            .push_bind(self.high_priority)
            .push_bind(self.created_on)
            .push_bind(self.flow_id)
            .push_bind(self.template_id)
            .push_bind(self.session_uuid);
    }
}

#[derive(FromRow)]
struct InsertedId {
    id: MsgId,
}

const INSERT_MSGS: &str = r#"INSERT INTO msgs_msg(uuid, org_id, direction, channel_id, contact_id, contact_urn_id, text,
       attachments, quick_replies, templating, status, failed_reason, high_priority, created_on,
       flow_id, template_id, session_uuid) "#;

/// Inserts messages in one statement and assigns the new ids back.
pub async fn insert_messages(conn: &mut PgConnection, msgs: &mut [Msg]) -> Result<(), DbError> {
    let ids: Vec<InsertedId> = db::bulk_returning(
        conn,
        "error inserting messages",
        INSERT_MSGS,
        msgs,
        " RETURNING id",
    )
    .await?;

    for (msg, inserted) in msgs.iter_mut().zip(ids) {
        msg.id = Some(inserted.id);
    }
    Ok(())
}

/// Fails every unsent outgoing message on a channel. Messages already sent,
/// delivered or failed keep their status.
pub async fn fail_channel_messages<'e>(
    db: impl PgExecutor<'e>,
    org_id: OrgId,
    channel_id: ChannelId,
    reason: FailedReason,
) -> Result<u64, DbError> {
    let statuses: Vec<&str> = UNSENT_STATUSES.iter().map(|s| s.code()).collect();
    let result = sqlx::query(
        r#"
UPDATE msgs_msg
   SET status = 'F', failed_reason = $3, modified_on = NOW()
 WHERE org_id = $1 AND channel_id = $2 AND direction = 'O' AND status = ANY($4)"#,
    )
    .bind(org_id)
    .bind(channel_id)
    .bind(reason.code())
    .bind(&statuses)
    .execute(db)
    .await
    .context("error failing channel messages")?;

    Ok(result.rows_affected())
}
