//! Storage seams.
//!
//! Entities live behind the [`Repository`] trait; the rate-limit counter lives
//! behind [`CounterStore`]. Soft-deleted rows are invisible through every
//! repository method: implementations filter tombstones in one place so no
//! caller has to.

pub mod counter;
pub mod memory;
pub mod redis_counter;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::model::{
    ApiKey, ApiKeyPatch, Message, MessagePatch, MessageStatus, SubscriptionPatch, TenantId,
    WebhookSubscription,
};

pub use counter::{CounterStore, MemoryCounterStore, WindowPolicy};
pub use memory::{MemoryApiKeys, MemoryMessages, MemoryRepository, MemorySubscriptions};
pub use redis_counter::{RedisCounterConfig, RedisCounterStore};

/// Errors raised by storage backends.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The backend answered with an error.
    #[error("store backend error: {0}")]
    Backend(String),

    /// A uniqueness constraint was violated.
    #[error("conflict: {0}")]
    Conflict(String),
}

/// A persisted row with an owner, a creation time and a tombstone.
pub trait Entity: Clone + Send + Sync + 'static {
    type Patch: Send + Sync;

    fn id(&self) -> Uuid;
    fn tenant_id(&self) -> TenantId;
    fn created_at(&self) -> DateTime<Utc>;
    fn deleted_at(&self) -> Option<DateTime<Utc>>;
    fn mark_deleted(&mut self, at: DateTime<Utc>);
    fn apply(&mut self, patch: &Self::Patch);

    /// Value that must be unique across all rows, tombstoned ones included.
    fn unique_key(&self) -> Option<&str> {
        None
    }

    fn is_live(&self) -> bool {
        self.deleted_at().is_none()
    }
}

/// Row-store operations shared by every entity.
#[async_trait]
pub trait Repository<T: Entity>: Send + Sync {
    /// All live rows of a tenant, oldest first.
    async fn find_by_tenant(&self, tenant: TenantId) -> Result<Vec<T>, StoreError>;

    async fn find_by_id(&self, tenant: TenantId, id: Uuid) -> Result<Option<T>, StoreError>;

    async fn create(&self, entity: T) -> Result<T, StoreError>;

    /// Apply `patch` to a live row. Returns the updated row, or `None` when
    /// no live row matched.
    async fn update(
        &self,
        tenant: TenantId,
        id: Uuid,
        patch: T::Patch,
    ) -> Result<Option<T>, StoreError>;

    /// Tombstone a live row. Returns `false` when nothing matched.
    async fn soft_delete(&self, tenant: TenantId, id: Uuid) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait ApiKeyRepository: Repository<ApiKey> {
    async fn find_by_key_hash(&self, key_hash: &str) -> Result<Option<ApiKey>, StoreError>;
}

#[async_trait]
pub trait MessageRepository: Repository<Message> {
    /// Live rows answering to a provider identifier, oldest first.
    async fn find_by_provider_id(&self, provider_id: &str) -> Result<Vec<Message>, StoreError>;

    async fn list(&self, tenant: TenantId, query: &MessageQuery) -> Result<MessagePage, StoreError>;
}

#[async_trait]
pub trait SubscriptionRepository: Repository<WebhookSubscription> {
    async fn find_active_by_tenant(
        &self,
        tenant: TenantId,
    ) -> Result<Vec<WebhookSubscription>, StoreError>;
}

// =============================================================================
// Message listing
// =============================================================================

pub const DEFAULT_PAGE_LIMIT: u32 = 50;
pub const MAX_PAGE_LIMIT: u32 = 100;

/// Filters and pagination for listing a tenant's messages.
#[derive(Debug, Clone, Default)]
pub struct MessageQuery {
    pub status: Option<MessageStatus>,
    /// Case-insensitive substring of the recipient address.
    pub recipient: Option<String>,
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

impl MessageQuery {
    /// Effective `(page, limit)`: page starts at 1, limit is capped.
    pub fn window(&self) -> (u32, u32) {
        let page = self.page.unwrap_or(1).max(1);
        let limit = self
            .limit
            .filter(|l| *l > 0)
            .unwrap_or(DEFAULT_PAGE_LIMIT)
            .min(MAX_PAGE_LIMIT);
        (page, limit)
    }

    pub fn matches(&self, message: &Message) -> bool {
        if let Some(status) = self.status {
            if message.status != status {
                return false;
            }
        }
        if let Some(recipient) = self.recipient.as_deref().filter(|r| !r.is_empty()) {
            if !message
                .to
                .to_ascii_lowercase()
                .contains(&recipient.to_ascii_lowercase())
            {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct MessagePage {
    pub messages: Vec<Message>,
    pub page: u32,
    pub limit: u32,
    pub total: usize,
}

// =============================================================================
// Entity impls
// =============================================================================

impl Entity for ApiKey {
    type Patch = ApiKeyPatch;

    fn id(&self) -> Uuid {
        self.id
    }
    fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }
    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
    fn deleted_at(&self) -> Option<DateTime<Utc>> {
        self.deleted_at
    }
    fn mark_deleted(&mut self, at: DateTime<Utc>) {
        self.deleted_at = Some(at);
    }
    fn apply(&mut self, patch: &ApiKeyPatch) {
        self.apply_patch(patch);
    }
    fn unique_key(&self) -> Option<&str> {
        Some(&self.key_hash)
    }
}

impl Entity for Message {
    type Patch = MessagePatch;

    fn id(&self) -> Uuid {
        self.id
    }
    fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }
    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
    fn deleted_at(&self) -> Option<DateTime<Utc>> {
        self.deleted_at
    }
    fn mark_deleted(&mut self, at: DateTime<Utc>) {
        self.deleted_at = Some(at);
    }
    fn apply(&mut self, patch: &MessagePatch) {
        self.apply_patch(patch);
    }
}

impl Entity for WebhookSubscription {
    type Patch = SubscriptionPatch;

    fn id(&self) -> Uuid {
        self.id
    }
    fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }
    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
    fn deleted_at(&self) -> Option<DateTime<Utc>> {
        self.deleted_at
    }
    fn mark_deleted(&mut self, at: DateTime<Utc>) {
        self.deleted_at = Some(at);
    }
    fn apply(&mut self, patch: &SubscriptionPatch) {
        self.apply_patch(patch);
    }
}
