use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use moka::future::Cache;
use tracing::info;

use crate::error::OrchestrateError;
use crate::payload::ConversationContext;

/// Opaque revision token for optimistic concurrency.
pub type Revision = String;

/// Persistence collaborator for per-user conversation context. Loaded at the
/// start of a run and written back at defined checkpoints; a stale revision
/// on save means another run for the same user committed first.
#[async_trait]
pub trait ConversationStore: Send + Sync + Debug {
    /// Returns the stored context and its current revision, if any.
    async fn load(&self, user_key: &str) -> Option<(ConversationContext, Revision)>;

    /// Stores the context. `revision` must be `None` for a fresh user and
    /// must match the stored revision otherwise; returns the new revision.
    async fn save(
        &self,
        user_key: &str,
        context: &ConversationContext,
        revision: Option<Revision>,
    ) -> Result<Revision, OrchestrateError>;

    /// Explicitly removes a stored context.
    async fn remove(&self, user_key: &str);

    /// Clears everything (typically for tests or shutdown).
    fn clear(&self);
}

/// In-memory store with a TTL, keyed by the stable `user._id`.
#[derive(Clone, Debug)]
pub struct InMemoryConversationStore {
    cache: Cache<String, (ConversationContext, Revision)>,
}

impl InMemoryConversationStore {
    /// Creates a new store whose entries idle out after `ttl_secs`.
    pub fn new(ttl_secs: u64) -> Arc<Self> {
        let cache = Cache::builder()
            .time_to_idle(Duration::from_secs(ttl_secs))
            .eviction_listener(|key: Arc<String>, _value: (ConversationContext, Revision), cause| {
                info!("conversation context expired: user={}, cause={:?}", key, cause);
            })
            .build();
        Arc::new(Self { cache })
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn load(&self, user_key: &str) -> Option<(ConversationContext, Revision)> {
        self.cache.get(user_key).await
    }

    async fn save(
        &self,
        user_key: &str,
        context: &ConversationContext,
        revision: Option<Revision>,
    ) -> Result<Revision, OrchestrateError> {
        let stored = self.cache.get(user_key).await.map(|(_, rev)| rev);
        match (&stored, &revision) {
            (None, None) => {}
            (Some(current), Some(given)) if current == given => {}
            _ => {
                return Err(OrchestrateError::conflict(format!(
                    "conversation context for `{}` was modified concurrently",
                    user_key
                )));
            }
        }
        let next = uuid::Uuid::new_v4().to_string();
        self.cache
            .insert(user_key.to_string(), (context.clone(), next.clone()))
            .await;
        Ok(next)
    }

    async fn remove(&self, user_key: &str) {
        self.cache.invalidate(user_key).await;
    }

    fn clear(&self) {
        self.cache.invalidate_all();
    }
}
