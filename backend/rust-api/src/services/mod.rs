use std::sync::Arc;

use mongodb::{Client as MongoClient, Database};
use redis::aio::ConnectionManager;

use crate::config::{Config, RemoteBackend};
use interaction::InteractionService;
use interaction_store::{InteractionRepository, MemoryInteractionStore, MongoInteractionStore};
use registry::SessionRegistry;
use remote::{MemoryRemoteStore, RedisRemoteStore, RemoteStore};

pub mod dispatcher;
pub mod interaction;
pub mod interaction_store;
pub mod orchestrator;
pub mod play_machine;
pub mod progression;
pub mod reconciler;
pub mod registry;
pub mod remote;
pub mod session_store;
pub mod timers;

pub struct AppState {
    pub config: Config,
    pub remote: Arc<dyn RemoteStore>,
    pub interactions: InteractionService,
    pub registry: SessionRegistry,
    /// Present when interactions are persisted in MongoDB.
    pub mongo: Option<Database>,
}

impl AppState {
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        match config.remote_backend {
            RemoteBackend::Memory => {
                tracing::warn!("Using in-memory remote store; state is lost on restart");
                Ok(Self::in_memory(config))
            }
            RemoteBackend::Redis => {
                let mongo_client = MongoClient::with_uri_str(&config.mongo_uri).await?;
                let mongo = mongo_client.database(&config.mongo_database);
                tracing::info!("MongoDB connected");

                let redis_client = redis::Client::open(config.redis_uri.clone())?;
                let redis = connect_redis(redis_client.clone()).await?;
                let remote = RedisRemoteStore::new(
                    redis_client,
                    redis,
                    config.feed_retry.retry_config(),
                );
                let repository = MongoInteractionStore::new(&mongo);

                let mut state = Self::with_stores(config, Arc::new(remote), Arc::new(repository));
                state.mongo = Some(mongo);
                Ok(state)
            }
        }
    }

    pub fn with_stores(
        config: Config,
        remote: Arc<dyn RemoteStore>,
        repository: Arc<dyn InteractionRepository>,
    ) -> Self {
        let interactions = InteractionService::new(repository, config.scoring);
        Self {
            config,
            remote,
            interactions,
            registry: SessionRegistry::new(),
            mongo: None,
        }
    }

    pub fn in_memory(config: Config) -> Self {
        Self::with_stores(
            config,
            Arc::new(MemoryRemoteStore::new()),
            Arc::new(MemoryInteractionStore::default()),
        )
    }
}

async fn connect_redis(client: redis::Client) -> anyhow::Result<ConnectionManager> {
    tracing::info!("Attempting to connect to Redis...");

    let redis = tokio::time::timeout(
        std::time::Duration::from_secs(30),
        ConnectionManager::new(client),
    )
    .await
    .map_err(|_| anyhow::anyhow!("Redis connection timeout after 30s"))??;

    tracing::info!("Redis ConnectionManager created, testing with PING...");

    let mut conn = redis.clone();
    tokio::time::timeout(
        std::time::Duration::from_secs(5),
        redis::cmd("PING").query_async::<String>(&mut conn),
    )
    .await
    .map_err(|_| anyhow::anyhow!("Redis PING timeout after 5s"))??;

    tracing::info!("Redis connection established successfully");
    Ok(redis)
}
