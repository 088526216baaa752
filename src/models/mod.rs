//! Persistent entities and the SQL that reads and writes them.
//!
//! Every writer in here performs a single batched statement over its input
//! and is called either from a commit hook (inside the scene transaction) or
//! from a task.

pub mod assets;
pub mod channel;
pub mod contact;
pub mod flow_start;
pub mod group;
pub mod http_log;
pub mod msg;
pub mod resthook;
pub mod session;

use serde::{Deserialize, Serialize};

macro_rules! id_type {
    ($($(#[$meta:meta])* $name:ident),* $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(
                Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord,
                Serialize, Deserialize, sqlx::Type,
            )]
            #[serde(transparent)]
            #[sqlx(transparent)]
            pub struct $name(pub i64);

            impl std::fmt::Display for $name {
                fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                    write!(f, "{}", self.0)
                }
            }

            impl From<i64> for $name {
                fn from(id: i64) -> Self {
                    Self(id)
                }
            }
        )*
    };
}

id_type!(
    /// Organization (tenant) id
    OrgId,
    ContactId,
    ChannelId,
    FlowId,
    GroupId,
    MsgId,
    /// Id of a row in `contacts_contacturn`
    UrnId,
    StartId,
    UserId,
    TemplateId,
    CallId,
);

/// Errors raised by the SQL layer.
///
/// The context names the operation that failed so that errors surfacing in
/// task logs can be traced back to a writer.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("{context}: {source}")]
    Query {
        context: &'static str,
        #[source]
        source: sqlx::Error,
    },

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("urn {identity} belongs to contact {owner}")]
    UrnTaken { identity: String, owner: ContactId },
}

/// Attaches an operation name to raw sqlx errors.
pub trait DbContext<T> {
    fn context(self, context: &'static str) -> Result<T, DbError>;
}

impl<T> DbContext<T> for Result<T, sqlx::Error> {
    fn context(self, context: &'static str) -> Result<T, DbError> {
        self.map_err(|source| DbError::Query { context, source })
    }
}
