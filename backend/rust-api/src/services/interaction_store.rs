use anyhow::{Context, Result};
use async_trait::async_trait;
use mongodb::bson::doc;
use mongodb::options::ReplaceOptions;
use mongodb::{Collection, Database};
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::metrics::track_db_operation;
use crate::models::{Interaction, InteractionKey};

const INTERACTIONS_COLLECTION: &str = "interactions";

/// Storage for play-mode interactions, keyed by scope, block and participant.
#[async_trait]
pub trait InteractionRepository: Send + Sync {
    async fn load(&self, key: &InteractionKey) -> Result<Option<Interaction>>;
    async fn save(&self, interaction: &Interaction) -> Result<()>;
    async fn list_for_block(&self, scope_id: &str, block_id: &str) -> Result<Vec<Interaction>>;
}

pub struct MongoInteractionStore {
    collection: Collection<Interaction>,
}

impl MongoInteractionStore {
    pub fn new(db: &Database) -> Self {
        Self {
            collection: db.collection::<Interaction>(INTERACTIONS_COLLECTION),
        }
    }
}

#[async_trait]
impl InteractionRepository for MongoInteractionStore {
    async fn load(&self, key: &InteractionKey) -> Result<Option<Interaction>> {
        track_db_operation("find_one", INTERACTIONS_COLLECTION, async {
            self.collection
                .find_one(doc! { "_id": key.document_id() })
                .await
                .context("Failed to load interaction")
        })
        .await
    }

    async fn save(&self, interaction: &Interaction) -> Result<()> {
        track_db_operation("replace_one", INTERACTIONS_COLLECTION, async {
            self.collection
                .replace_one(doc! { "_id": &interaction.id }, interaction)
                .with_options(ReplaceOptions::builder().upsert(true).build())
                .await
                .context("Failed to save interaction")?;
            Ok(())
        })
        .await
    }

    async fn list_for_block(&self, scope_id: &str, block_id: &str) -> Result<Vec<Interaction>> {
        use futures::TryStreamExt;

        track_db_operation("find", INTERACTIONS_COLLECTION, async {
            let cursor = self
                .collection
                .find(doc! { "scope_id": scope_id, "block_id": block_id })
                .await
                .context("Failed to query interactions")?;
            cursor
                .try_collect()
                .await
                .context("Failed to read interactions")
        })
        .await
    }
}

/// In-process repository used by tests and the memory backend.
#[derive(Default)]
pub struct MemoryInteractionStore {
    items: RwLock<HashMap<String, Interaction>>,
}

#[async_trait]
impl InteractionRepository for MemoryInteractionStore {
    async fn load(&self, key: &InteractionKey) -> Result<Option<Interaction>> {
        Ok(self.items.read().await.get(&key.document_id()).cloned())
    }

    async fn save(&self, interaction: &Interaction) -> Result<()> {
        self.items
            .write()
            .await
            .insert(interaction.id.clone(), interaction.clone());
        Ok(())
    }

    async fn list_for_block(&self, scope_id: &str, block_id: &str) -> Result<Vec<Interaction>> {
        let items = self.items.read().await;
        let mut found: Vec<Interaction> = items
            .values()
            .filter(|i| i.scope_id == scope_id && i.block_id == block_id)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.participant_id.cmp(&b.participant_id));
        Ok(found)
    }
}
