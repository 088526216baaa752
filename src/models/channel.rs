use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use super::{ChannelId, DbContext, DbError, OrgId};

/// Channel type code for Android relayers, which poll for messages instead
/// of being pushed to by courier.
pub const CHANNEL_TYPE_ANDROID: &str = "A";

/// Default sends per second when a channel doesn't configure one.
pub const DEFAULT_TPS: i32 = 10;

/// A channel messages are sent and received through.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Channel {
    pub id: ChannelId,
    pub uuid: Uuid,
    pub org_id: OrgId,
    pub name: String,
    pub channel_type: String,
    pub schemes: Vec<String>,
    pub role: String,
    pub config: Value,
    pub tps: Option<i32>,
}

impl Channel {
    pub fn is_android(&self) -> bool {
        self.channel_type == CHANNEL_TYPE_ANDROID
    }

    /// Throughput used in this channel's courier queue keys.
    pub fn tps(&self) -> i32 {
        self.tps.filter(|t| *t > 0).unwrap_or(DEFAULT_TPS)
    }

    pub fn has_scheme(&self, scheme: &str) -> bool {
        self.schemes.iter().any(|s| s == scheme)
    }

    /// Whether this channel can send (role contains `S`).
    pub fn can_send(&self) -> bool {
        self.role.contains('S')
    }
}

const SELECT_CHANNEL: &str = r#"
SELECT id, uuid, org_id, name, channel_type, schemes, role, config, tps
  FROM channels_channel"#;

/// Loads a channel straight from the database, including inactive ones.
///
/// Used when a channel may already have been released and dropped from the
/// org's cached assets.
pub async fn get_channel_by_id(db: &PgPool, id: ChannelId) -> Result<Channel, DbError> {
    let sql = format!("{SELECT_CHANNEL} WHERE id = $1");
    sqlx::query_as::<_, Channel>(&sql)
        .bind(id)
        .fetch_optional(db)
        .await
        .context("error loading channel")?
        .ok_or_else(|| DbError::NotFound {
            kind: "channel",
            id: id.to_string(),
        })
}

/// Loads the active channels of an org.
pub async fn load_channels(db: &PgPool, org_id: OrgId) -> Result<Vec<Channel>, DbError> {
    let sql = format!("{SELECT_CHANNEL} WHERE org_id = $1 AND is_active = TRUE ORDER BY id");
    sqlx::query_as::<_, Channel>(&sql)
        .bind(org_id)
        .fetch_all(db)
        .await
        .context("error loading channels")
}


#[cfg(test)]
mod tests {
    use super::testdata::channel;

    #[test]
    fn test_tps_defaults() {
        assert_eq!(channel(1, "T", None).tps(), 10);
        assert_eq!(channel(1, "T", Some(0)).tps(), 10);
        assert_eq!(channel(1, "T", Some(25)).tps(), 25);
    }

    #[test]
    fn test_android() {
        assert!(channel(1, "A", None).is_android());
        assert!(!channel(2, "VON", None).is_android());
    }
}
