//! Queued tasks.
//!
//! A task is a serializable struct implementing [`Task`]. Tasks are queued by
//! type name with [`queue::queue_task`] and rebuilt from their envelope by the
//! [`TaskRegistry`] when a foreman pops them. Tasks are never retried; their
//! writes are guarded by status so a task repeated by hand is harmless.

pub mod foreman;
pub mod interrupt_channel;
pub mod interrupt_sessions;
pub mod queue;
pub mod start_flow;
pub mod start_flow_batch;

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::config::TasksConfig;
use crate::courier::CourierError;
use crate::engine::EngineError;
use crate::models::assets::{OrgAssets, Refresh};
use crate::models::DbError;
use crate::runner::CommitError;
use crate::runtime::Runtime;
use crate::search::SearchError;

use self::queue::{QueueError, TaskEnvelope};

pub use interrupt_channel::InterruptChannelTask;
pub use interrupt_sessions::InterruptSessionsTask;
pub use start_flow::StartFlowTask;
pub use start_flow_batch::StartFlowBatchTask;

/// Timeout of tasks that don't declare their own.
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("unknown task type: {0}")]
    UnknownType(String),

    #[error("invalid task payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("task timed out after {0:?}")]
    Timeout(Duration),

    #[error("{0}")]
    Invalid(String),

    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Commit(#[from] CommitError),

    #[error(transparent)]
    Courier(#[from] CourierError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Search(#[from] SearchError),
}

#[async_trait]
pub trait Task: Send + Sync + Debug {
    fn task_type(&self) -> &'static str;

    fn timeout(&self, _config: &TasksConfig) -> Duration {
        DEFAULT_TASK_TIMEOUT
    }

    /// Asset categories to reload before the task runs.
    fn with_assets(&self) -> Refresh {
        Refresh::None
    }

    async fn perform(&self, rt: &Runtime, oa: &OrgAssets) -> Result<(), TaskError>;
}

/// A task which can be queued and rebuilt by type name.
pub trait RegisteredTask: Task + Serialize + DeserializeOwned + 'static {
    const TYPE: &'static str;
}

type TaskDecoder = fn(Value) -> Result<Box<dyn Task>, serde_json::Error>;

fn decode<T: RegisteredTask>(value: Value) -> Result<Box<dyn Task>, serde_json::Error> {
    Ok(Box::new(serde_json::from_value::<T>(value)?))
}

/// Frozen mapping of task type names to decoders.
pub struct TaskRegistry {
    decoders: HashMap<&'static str, TaskDecoder>,
}

impl TaskRegistry {
    pub fn builder() -> TaskRegistryBuilder {
        TaskRegistryBuilder::default()
    }

    pub fn task_types(&self) -> Vec<&'static str> {
        let mut types: Vec<_> = self.decoders.keys().copied().collect();
        types.sort_unstable();
        types
    }

    /// Rebuilds the task carried by an envelope.
    pub fn read(&self, envelope: &TaskEnvelope) -> Result<Box<dyn Task>, TaskError> {
        let decoder = self
            .decoders
            .get(envelope.task_type.as_str())
            .ok_or_else(|| TaskError::UnknownType(envelope.task_type.clone()))?;
        Ok(decoder(envelope.task.clone())?)
    }
}

#[derive(Default)]
pub struct TaskRegistryBuilder {
    decoders: HashMap<&'static str, TaskDecoder>,
}

impl TaskRegistryBuilder {
    pub fn register<T: RegisteredTask>(mut self) -> Self {
        debug!(task_type = T::TYPE, "Registering task type");
        self.decoders.insert(T::TYPE, decode::<T>);
        self
    }

    pub fn build(self) -> Arc<TaskRegistry> {
        Arc::new(TaskRegistry {
            decoders: self.decoders,
        })
    }
}

/// Registry with every task type this crate defines.
pub fn default_registry() -> Arc<TaskRegistry> {
    TaskRegistry::builder()
        .register::<InterruptChannelTask>()
        .register::<InterruptSessionsTask>()
        .register::<StartFlowTask>()
        .register::<StartFlowBatchTask>()
        .build()
}
