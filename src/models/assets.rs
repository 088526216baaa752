//! Cached, read-only snapshots of an org's channels, flows, groups and
//! templates.
//!
//! Snapshots are immutable once built. A task that needs fresher data than
//! the cache holds declares a [`Refresh`] and the cache rebuilds only those
//! categories before the task runs.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{FromRow, PgPool};
use tracing::debug;
use uuid::Uuid;

use super::channel::{self, Channel};
use super::{ChannelId, DbContext, DbError, FlowId, GroupId, OrgId, TemplateId};

/// Categories of assets a task can ask to have reloaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Refresh {
    #[default]
    None,
    Channels,
    Flows,
    Groups,
    All,
}

impl Refresh {
    fn channels(self) -> bool {
        matches!(self, Refresh::Channels | Refresh::All)
    }

    fn flows(self) -> bool {
        matches!(self, Refresh::Flows | Refresh::All)
    }

    fn groups(self) -> bool {
        matches!(self, Refresh::Groups | Refresh::All)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Flow {
    pub id: FlowId,
    pub uuid: Uuid,
    pub name: String,
    /// `M` messaging, `V` voice, `B` background, `S` survey
    pub flow_type: String,
    pub definition: Option<Value>,
}

impl Flow {
    pub fn is_voice(&self) -> bool {
        self.flow_type == "V"
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Group {
    pub id: GroupId,
    pub uuid: Uuid,
    pub name: String,
    /// Smart groups carry a query and can't have members added directly
    pub query: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Template {
    pub id: TemplateId,
    pub uuid: Uuid,
    pub name: String,
}

/// Snapshot of one org's assets.
#[derive(Debug, Clone)]
pub struct OrgAssets {
    org_id: OrgId,
    channels: Vec<Channel>,
    flows: Vec<Flow>,
    groups: Vec<Group>,
    templates: Vec<Template>,
    built_on: DateTime<Utc>,
}

impl OrgAssets {
    pub fn new(
        org_id: OrgId,
        channels: Vec<Channel>,
        flows: Vec<Flow>,
        groups: Vec<Group>,
        templates: Vec<Template>,
    ) -> Self {
        Self {
            org_id,
            channels,
            flows,
            groups,
            templates,
            built_on: Utc::now(),
        }
    }

    /// Loads every category from the database.
    pub async fn load(db: &PgPool, org_id: OrgId) -> Result<Self, DbError> {
        Ok(Self::new(
            org_id,
            channel::load_channels(db, org_id).await?,
            load_flows(db, org_id).await?,
            load_groups(db, org_id).await?,
            load_templates(db, org_id).await?,
        ))
    }

    /// Builds a new snapshot reloading only the categories in `refresh`.
    pub async fn refreshed(&self, db: &PgPool, refresh: Refresh) -> Result<Self, DbError> {
        let mut fresh = self.clone();
        if refresh.channels() {
            fresh.channels = channel::load_channels(db, self.org_id).await?;
        }
        if refresh.flows() {
            fresh.flows = load_flows(db, self.org_id).await?;
        }
        if refresh.groups() {
            fresh.groups = load_groups(db, self.org_id).await?;
        }
        fresh.built_on = Utc::now();
        Ok(fresh)
    }

    pub fn org_id(&self) -> OrgId {
        self.org_id
    }

    pub fn built_on(&self) -> DateTime<Utc> {
        self.built_on
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    pub fn channel_by_uuid(&self, uuid: &Uuid) -> Option<&Channel> {
        self.channels.iter().find(|c| &c.uuid == uuid)
    }

    pub fn channel_by_id(&self, id: ChannelId) -> Option<&Channel> {
        self.channels.iter().find(|c| c.id == id)
    }

    /// First sending channel supporting the given URN scheme.
    pub fn channel_for_scheme(&self, scheme: &str) -> Option<&Channel> {
        self.channels
            .iter()
            .find(|c| c.can_send() && c.has_scheme(scheme))
    }

    pub fn flow_by_uuid(&self, uuid: &Uuid) -> Option<&Flow> {
        self.flows.iter().find(|f| &f.uuid == uuid)
    }

    pub fn flow_by_id(&self, id: FlowId) -> Option<&Flow> {
        self.flows.iter().find(|f| f.id == id)
    }

    pub fn group_by_uuid(&self, uuid: &Uuid) -> Option<&Group> {
        self.groups.iter().find(|g| &g.uuid == uuid)
    }

    pub fn group_by_id(&self, id: GroupId) -> Option<&Group> {
        self.groups.iter().find(|g| g.id == id)
    }

    pub fn templates(&self) -> &[Template] {
        &self.templates
    }

    pub fn template_by_uuid(&self, uuid: &Uuid) -> Option<&Template> {
        self.templates.iter().find(|t| &t.uuid == uuid)
    }
}

async fn load_flows(db: &PgPool, org_id: OrgId) -> Result<Vec<Flow>, DbError> {
    sqlx::query_as::<_, Flow>(
        r#"
SELECT f.id, f.uuid, f.name, f.flow_type, r.definition
  FROM flows_flow f
  LEFT JOIN LATERAL (
       SELECT definition FROM flows_flowrevision
        WHERE flow_id = f.id
        ORDER BY revision DESC
        LIMIT 1
  ) r ON TRUE
 WHERE f.org_id = $1 AND f.is_active = TRUE
 ORDER BY f.id"#,
    )
    .bind(org_id)
    .fetch_all(db)
    .await
    .context("error loading flows")
}

async fn load_groups(db: &PgPool, org_id: OrgId) -> Result<Vec<Group>, DbError> {
    sqlx::query_as::<_, Group>(
        "SELECT id, uuid, name, query FROM contacts_contactgroup WHERE org_id = $1 AND is_active = TRUE ORDER BY id",
    )
    .bind(org_id)
    .fetch_all(db)
    .await
    .context("error loading groups")
}

async fn load_templates(db: &PgPool, org_id: OrgId) -> Result<Vec<Template>, DbError> {
    sqlx::query_as::<_, Template>(
        "SELECT id, uuid, name FROM templates_template WHERE org_id = $1 ORDER BY id",
    )
    .bind(org_id)
    .fetch_all(db)
    .await
    .context("error loading templates")
}

/// Process-wide LRU of org snapshots.
pub struct AssetCache {
    entries: Mutex<LruCache<OrgId, Arc<OrgAssets>>>,
}

impl AssetCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn cached(&self, org_id: OrgId) -> Option<Arc<OrgAssets>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&org_id)
            .cloned()
    }

    /// Stores a snapshot, replacing any previous one for the same org.
    pub fn put(&self, oa: Arc<OrgAssets>) {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .put(oa.org_id(), oa);
    }

    /// Returns the org's snapshot, loading or refreshing it as needed.
    pub async fn get(
        &self,
        db: &PgPool,
        org_id: OrgId,
        refresh: Refresh,
    ) -> Result<Arc<OrgAssets>, DbError> {
        let oa = match self.cached(org_id) {
            Some(cached) if refresh == Refresh::None => return Ok(cached),
            Some(cached) => {
                debug!(org_id = %org_id, refresh = ?refresh, "Refreshing org assets");
                Arc::new(cached.refreshed(db, refresh).await?)
            }
            None => {
                debug!(org_id = %org_id, "Loading org assets");
                Arc::new(OrgAssets::load(db, org_id).await?)
            }
        };

        self.put(oa.clone());
        Ok(oa)
    }
}


#[cfg(test)]
mod tests {
    use super::testdata::org_assets;
    use super::*;

    #[test]
    fn test_lookups() {
        let oa = org_assets();
        let twilio = oa.channel_by_id(ChannelId(10)).unwrap();
        assert_eq!(oa.channel_by_uuid(&twilio.uuid).unwrap().id, ChannelId(10));
        assert!(oa.channel_by_uuid(&Uuid::new_v4()).is_none());
        assert_eq!(oa.channel_for_scheme("tel").unwrap().id, ChannelId(10));
        assert!(oa.channel_for_scheme("telegram").is_none());

        let doctors = oa.group_by_id(GroupId(100)).unwrap();
        assert_eq!(oa.group_by_uuid(&doctors.uuid).unwrap().name, "Doctors");
    }

    #[test]
    fn test_refresh_categories() {
        assert!(Refresh::All.channels() && Refresh::All.flows() && Refresh::All.groups());
        assert!(Refresh::Channels.channels());
        assert!(!Refresh::Channels.flows());
        assert!(!Refresh::None.groups());
    }

    #[test]
    fn test_cache_evicts_least_recently_used() {
        let cache = AssetCache::new(1);
        cache.put(Arc::new(org_assets()));
        assert!(cache.cached(OrgId(1)).is_some());

        let other = OrgAssets::new(OrgId(2), vec![], vec![], vec![], vec![]);
        cache.put(Arc::new(other));
        assert!(cache.cached(OrgId(1)).is_none());
        assert!(cache.cached(OrgId(2)).is_some());
    }
}
