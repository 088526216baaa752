use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use super::queue::{self, BATCH_QUEUE, HANDLER_QUEUE};
use super::{RegisteredTask, StartFlowBatchTask, Task, TaskError};
use crate::config::TasksConfig;
use crate::models::assets::OrgAssets;
use crate::models::contact;
use crate::models::flow_start::{self, FlowStart, StartType};
use crate::models::group;
use crate::models::{ContactId, DbContext, StartId};
use crate::runtime::Runtime;

/// Expands a persisted start into recipients and queues batches of them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartFlowTask {
    pub start: FlowStart,
}

impl RegisteredTask for StartFlowTask {
    const TYPE: &'static str = "start_flow";
}

/// Splits recipients into batch tasks of at most `batch_size` contacts.
pub(crate) fn batches(start: &FlowStart, start_id: StartId, contact_ids: &[ContactId], batch_size: usize) -> Vec<StartFlowBatchTask> {
    contact_ids
        .chunks(batch_size.max(1))
        .map(|chunk| StartFlowBatchTask {
            start_id,
            start_type: start.start_type,
            flow_id: start.flow_id,
            contact_ids: chunk.to_vec(),
            params: start.params.clone(),
            created_by_id: start.created_by_id,
        })
        .collect()
}

/// Small user-initiated starts skip the batch queue.
fn batch_queue(start_type: StartType, batch_count: usize) -> (&'static str, bool) {
    match start_type {
        StartType::Manual | StartType::Api if batch_count == 1 => (HANDLER_QUEUE, true),
        _ => (BATCH_QUEUE, false),
    }
}

impl StartFlowTask {
    async fn recipients(&self, rt: &Runtime, oa: &OrgAssets) -> Result<Vec<ContactId>, TaskError> {
        let start = &self.start;
        let mut ids: BTreeSet<ContactId> = start.contact_ids.iter().copied().collect();

        if !start.group_ids.is_empty() {
            ids.extend(group::group_member_ids(&rt.db, &start.group_ids).await?);
        }

        if !start.urns.is_empty() {
            let mut conn = rt.db.acquire().await.context("error acquiring connection")?;
            ids.extend(contact::get_or_create_contacts_for_urns(&mut conn, oa.org_id(), &start.urns).await?);
        }

        if let Some(query) = start.query.as_deref().filter(|q| !q.trim().is_empty()) {
            let results = rt.search.search(oa.org_id(), query, None).await?;
            ids.extend(results.ids);
        }

        let mut ids: Vec<ContactId> = ids.into_iter().collect();
        if !start.exclusions.is_empty() && !ids.is_empty() {
            let now = Utc::now();
            let states = contact::load_contact_states(&rt.db, oa.org_id(), &ids, start.flow_id).await?;
            ids = states
                .iter()
                .filter(|state| start.exclusions.allows(state, now))
                .map(|state| state.id)
                .collect();
        }
        Ok(ids)
    }
}

#[async_trait]
impl Task for StartFlowTask {
    fn task_type(&self) -> &'static str {
        Self::TYPE
    }

    fn timeout(&self, config: &TasksConfig) -> Duration {
        Duration::from_secs(config.start_flow_timeout_secs)
    }

    async fn perform(&self, rt: &Runtime, oa: &OrgAssets) -> Result<(), TaskError> {
        let start_id = self
            .start
            .id
            .ok_or_else(|| TaskError::Invalid(format!("start {} was never saved", self.start.uuid)))?;

        if !flow_start::mark_started(&rt.db, start_id).await? {
            info!(start_id = %start_id, "Start no longer pending, skipping");
            return Ok(());
        }

        if oa.flow_by_id(self.start.flow_id).is_none() {
            flow_start::mark_failed(&rt.db, start_id).await?;
            return Err(TaskError::Invalid(format!("no flow with id {}", self.start.flow_id)));
        }

        let contact_ids = match self.recipients(rt, oa).await {
            Ok(ids) => ids,
            Err(err) => {
                flow_start::mark_failed(&rt.db, start_id).await?;
                return Err(err);
            }
        };

        let tasks = batches(&self.start, start_id, &contact_ids, rt.config.tasks.start_batch_size);
        let (queue_name, high_priority) = batch_queue(self.start.start_type, tasks.len());
        for (i, task) in tasks.iter().enumerate() {
            if let Err(err) = queue::queue_task(&rt.rp, queue_name, oa.org_id(), task, high_priority).await {
                error!(start_id = %start_id, queued = i, batches = tasks.len(), error = %err, "Error queueing start batch");
                let note = format!("queued {i} of {} batches: {err}", tasks.len());
                if let Err(e) = flow_start::set_last_error(&rt.db, start_id, &note).await {
                    error!(start_id = %start_id, error = %e, "Error recording start error");
                }
                return Err(err.into());
            }
        }

        flow_start::mark_complete(&rt.db, start_id, contact_ids.len() as i64).await?;

        info!(
            start_id = %start_id,
            flow_id = %self.start.flow_id,
            contacts = contact_ids.len(),
            batches = tasks.len(),
            queue = queue_name,
            "Queued start batches"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MailroomConfig;
    use crate::db::testdata::test_db;
    use crate::models::assets::testdata::org_assets;
    use crate::models::flow_start::testdata::start_state;
    use crate::models::{FlowId, OrgId};
    use crate::runtime::testdata;
    use serde_json::json;

    fn start(start_type: StartType) -> FlowStart {
        let mut start = FlowStart::new(OrgId(1), start_type, FlowId(1));
        start.id = Some(StartId(33));
        start.params = Some(json!({"source": "api"}));
        start
    }

    #[test]
    fn test_batches() {
        let start = start(StartType::Trigger);
        let ids: Vec<ContactId> = (1..=250).map(ContactId).collect();

        let tasks = batches(&start, StartId(33), &ids, 100);
        assert_eq!(tasks.iter().map(|t| t.contact_ids.len()).collect::<Vec<_>>(), vec![100, 100, 50]);
        assert_eq!(tasks[2].contact_ids.first(), Some(&ContactId(201)));
        assert!(tasks.iter().all(|t| t.start_id == StartId(33) && t.flow_id == FlowId(1)));
        assert_eq!(tasks[0].params, Some(json!({"source": "api"})));

        assert!(batches(&start, StartId(33), &[], 100).is_empty());
        assert_eq!(batches(&start, StartId(33), &ids[..3], 0).len(), 3);
    }

    #[test]
    fn test_batch_queue() {
        assert_eq!(batch_queue(StartType::Manual, 1), (HANDLER_QUEUE, true));
        assert_eq!(batch_queue(StartType::Api, 1), (HANDLER_QUEUE, true));
        assert_eq!(batch_queue(StartType::Manual, 2), (BATCH_QUEUE, false));
        assert_eq!(batch_queue(StartType::Trigger, 1), (BATCH_QUEUE, false));
        assert_eq!(batch_queue(StartType::FlowAction, 1), (BATCH_QUEUE, false));
    }

    #[test]
    fn test_timeout_from_config() {
        let task = StartFlowTask { start: start(StartType::Manual) };
        let config = TasksConfig {
            start_flow_timeout_secs: 90,
            ..Default::default()
        };
        assert_eq!(task.timeout(&config), Duration::from_secs(90));
    }

    #[tokio::test]
    async fn test_queue_failure_keeps_start_with_error() {
        let Some(db) = test_db().await else { return };
        let mut config = MailroomConfig::default();
        config.redis.url = "redis://127.0.0.1:1/0".to_string();
        let rt = testdata::runtime_with_db(config, db.clone());

        let mut start = FlowStart::new(OrgId(1), StartType::Manual, FlowId(1));
        start.contact_ids = vec![ContactId(1), ContactId(2)];
        let mut starts = vec![start];
        let mut conn = db.acquire().await.unwrap();
        flow_start::insert_flow_starts(&mut *conn, &mut starts).await.unwrap();
        drop(conn);

        let start = starts.remove(0);
        let start_id = start.id.unwrap();
        let err = StartFlowTask { start }.perform(&rt, &org_assets()).await.unwrap_err();
        assert!(matches!(err, TaskError::Queue(_)));

        let state = start_state(&db, start_id).await;
        assert_eq!(state.status, "S");
        assert!(state.last_error.unwrap().starts_with("queued 0 of 1 batches: "));
    }
}
