//! Shared handles used by handlers, hooks, tasks and the web server.

use std::sync::Arc;

use deadpool_redis::{Config as RedisPoolConfig, CreatePoolError, Pool, Runtime as PoolRuntime};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use thiserror::Error;
use tracing::info;

use crate::config::MailroomConfig;
use crate::engine::{DefinitionEngine, Engine};
use crate::handlers::{self, HandlerRegistry};
use crate::http::HttpAccess;
use crate::models::assets::AssetCache;
use crate::search::{ContactSearch, NoSearch};
use crate::tasks::{self, TaskRegistry};

/// Orgs whose assets are kept in memory
const ASSET_CACHE_SIZE: usize = 500;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("unable to connect to database: {0}")]
    Db(#[from] sqlx::Error),

    #[error("unable to create redis pool: {0}")]
    Redis(#[from] CreatePoolError),
}

pub struct Runtime {
    pub db: PgPool,
    pub rp: Pool,
    pub config: Arc<MailroomConfig>,
    pub assets: AssetCache,
    pub http: HttpAccess,
    pub engine: Arc<dyn Engine>,
    pub search: Arc<dyn ContactSearch>,
    pub handlers: Arc<HandlerRegistry>,
    pub tasks: Arc<TaskRegistry>,
}

impl Runtime {
    /// Connects to Postgres and creates the Redis pool.
    pub async fn connect(config: MailroomConfig) -> Result<Self, RuntimeError> {
        let db = PgPoolOptions::new()
            .max_connections(config.db.max_connections)
            .connect(&config.db.url)
            .await?;
        let rp = RedisPoolConfig::from_url(config.redis.url.clone()).create_pool(Some(PoolRuntime::Tokio1))?;

        info!(max_connections = config.db.max_connections, "Connected to database");
        Ok(Self::with_pools(config, db, rp))
    }

    /// Builds a runtime around existing pools with the default engine,
    /// search and registries.
    pub fn with_pools(config: MailroomConfig, db: PgPool, rp: Pool) -> Self {
        let http = HttpAccess::new(config.webhooks.timeout(), config.disallowed_networks());
        Self {
            db,
            rp,
            assets: AssetCache::new(ASSET_CACHE_SIZE),
            http,
            engine: Arc::new(DefinitionEngine),
            search: Arc::new(NoSearch),
            handlers: handlers::default_registry(),
            tasks: tasks::default_registry(),
            config: Arc::new(config),
        }
    }

    pub fn with_search(mut self, search: Arc<dyn ContactSearch>) -> Self {
        self.search = search;
        self
    }

    pub fn with_engine(mut self, engine: Arc<dyn Engine>) -> Self {
        self.engine = engine;
        self
    }
}
