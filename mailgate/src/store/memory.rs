//! In-process repositories.
//!
//! Rows live in a `HashMap` behind a tokio `RwLock`. Every read goes through
//! [`MemoryRepository::select`], which is the single place tombstoned rows
//! are filtered out.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    ApiKeyRepository, Entity, MessagePage, MessageQuery, MessageRepository, Repository,
    StoreError, SubscriptionRepository,
};
use crate::model::{ApiKey, Message, TenantId, WebhookSubscription};

pub type MemoryApiKeys = MemoryRepository<ApiKey>;
pub type MemoryMessages = MemoryRepository<Message>;
pub type MemorySubscriptions = MemoryRepository<WebhookSubscription>;

/// Generic in-memory row store.
#[derive(Debug)]
pub struct MemoryRepository<T: Entity> {
    rows: RwLock<HashMap<Uuid, T>>,
}

impl<T: Entity> Default for MemoryRepository<T> {
    fn default() -> Self {
        Self {
            rows: RwLock::new(HashMap::new()),
        }
    }
}

impl<T: Entity> MemoryRepository<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live rows matching `pred`, oldest first.
    async fn select<F>(&self, pred: F) -> Vec<T>
    where
        F: Fn(&T) -> bool,
    {
        let rows = self.rows.read().await;
        let mut selected: Vec<T> = rows
            .values()
            .filter(|row| row.is_live() && pred(row))
            .cloned()
            .collect();
        selected.sort_by_key(|row| (row.created_at(), row.id()));
        selected
    }
}

#[async_trait]
impl<T: Entity> Repository<T> for MemoryRepository<T> {
    async fn find_by_tenant(&self, tenant: TenantId) -> Result<Vec<T>, StoreError> {
        Ok(self.select(|row| row.tenant_id() == tenant).await)
    }

    async fn find_by_id(&self, tenant: TenantId, id: Uuid) -> Result<Option<T>, StoreError> {
        Ok(self
            .select(|row| row.id() == id && row.tenant_id() == tenant)
            .await
            .into_iter()
            .next())
    }

    async fn create(&self, entity: T) -> Result<T, StoreError> {
        let mut rows = self.rows.write().await;

        if rows.contains_key(&entity.id()) {
            return Err(StoreError::Conflict(format!("duplicate id {}", entity.id())));
        }
        if let Some(key) = entity.unique_key() {
            if rows.values().any(|row| row.unique_key() == Some(key)) {
                return Err(StoreError::Conflict("duplicate unique key".to_string()));
            }
        }

        rows.insert(entity.id(), entity.clone());
        Ok(entity)
    }

    async fn update(
        &self,
        tenant: TenantId,
        id: Uuid,
        patch: T::Patch,
    ) -> Result<Option<T>, StoreError> {
        let mut rows = self.rows.write().await;
        match rows.get_mut(&id) {
            Some(row) if row.is_live() && row.tenant_id() == tenant => {
                row.apply(&patch);
                Ok(Some(row.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn soft_delete(&self, tenant: TenantId, id: Uuid) -> Result<bool, StoreError> {
        let mut rows = self.rows.write().await;
        match rows.get_mut(&id) {
            Some(row) if row.is_live() && row.tenant_id() == tenant => {
                row.mark_deleted(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl ApiKeyRepository for MemoryRepository<ApiKey> {
    async fn find_by_key_hash(&self, key_hash: &str) -> Result<Option<ApiKey>, StoreError> {
        Ok(self
            .select(|key| key.key_hash == key_hash)
            .await
            .into_iter()
            .next())
    }
}

#[async_trait]
impl MessageRepository for MemoryRepository<Message> {
    async fn find_by_provider_id(&self, provider_id: &str) -> Result<Vec<Message>, StoreError> {
        Ok(self
            .select(|message| message.matches_provider_id(provider_id))
            .await)
    }

    async fn list(&self, tenant: TenantId, query: &MessageQuery) -> Result<MessagePage, StoreError> {
        let (page, limit) = query.window();
        let mut matching = self
            .select(|message| message.tenant_id == tenant && query.matches(message))
            .await;
        matching.reverse();

        let total = matching.len();
        let offset = ((page - 1) as usize).saturating_mul(limit as usize);
        let messages = matching
            .into_iter()
            .skip(offset)
            .take(limit as usize)
            .collect();

        Ok(MessagePage {
            messages,
            page,
            limit,
            total,
        })
    }
}

#[async_trait]
impl SubscriptionRepository for MemoryRepository<WebhookSubscription> {
    async fn find_active_by_tenant(
        &self,
        tenant: TenantId,
    ) -> Result<Vec<WebhookSubscription>, StoreError> {
        Ok(self
            .select(|sub| sub.tenant_id == tenant && sub.is_active)
            .await)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use chrono::Duration;

    use super::*;
    use crate::model::{MessagePatch, MessageStatus, SubscriptionPatch};

    fn message(tenant: TenantId, to: &str, provider_id: &str, offset_secs: i64) -> Message {
        let created = Utc::now() + Duration::seconds(offset_secs);
        Message {
            id: Uuid::new_v4(),
            tenant_id: tenant,
            client_message_id: Uuid::new_v4(),
            provider_message_id: Some(provider_id.to_string()),
            provider_recipient_id: None,
            from: "sender@example.com".to_string(),
            to: to.to_string(),
            subject: "Subject".to_string(),
            status: MessageStatus::Sent,
            error_message: None,
            opened_at: None,
            clicked_at: None,
            bounced_at: None,
            delivered_at: None,
            created_at: created,
            updated_at: created,
            deleted_at: None,
        }
    }

    fn subscription(tenant: TenantId, active: bool) -> WebhookSubscription {
        WebhookSubscription {
            id: Uuid::new_v4(),
            tenant_id: tenant,
            url: "https://example.com/hook".to_string(),
            event_filter: BTreeSet::new(),
            secret: "whsec_abc".to_string(),
            is_active: active,
            last_triggered_at: None,
            created_at: Utc::now(),
            deleted_at: None,
        }
    }

    #[tokio::test]
    async fn test_soft_deleted_rows_are_invisible() {
        let repo = MemoryMessages::new();
        let tenant = TenantId::new();
        let row = repo.create(message(tenant, "a@example.com", "p1", 0)).await.unwrap();

        assert!(repo.soft_delete(tenant, row.id).await.unwrap());
        assert!(!repo.soft_delete(tenant, row.id).await.unwrap());

        assert!(repo.find_by_id(tenant, row.id).await.unwrap().is_none());
        assert!(repo.find_by_tenant(tenant).await.unwrap().is_empty());
        assert!(repo.find_by_provider_id("p1").await.unwrap().is_empty());
        assert!(repo
            .update(tenant, row.id, MessagePatch::default())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_rows_are_tenant_scoped() {
        let repo = MemoryMessages::new();
        let owner = TenantId::new();
        let other = TenantId::new();
        let row = repo.create(message(owner, "a@example.com", "p1", 0)).await.unwrap();

        assert!(repo.find_by_id(other, row.id).await.unwrap().is_none());
        assert!(!repo.soft_delete(other, row.id).await.unwrap());
        assert_eq!(repo.find_by_tenant(owner).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_provider_lookup_is_oldest_first() {
        let repo = MemoryMessages::new();
        let tenant = TenantId::new();
        let second = repo.create(message(tenant, "b@example.com", "shared", 5)).await.unwrap();
        let first = repo.create(message(tenant, "a@example.com", "shared", 0)).await.unwrap();

        let found = repo.find_by_provider_id("shared").await.unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].id, first.id);
        assert_eq!(found[1].id, second.id);
    }

    #[tokio::test]
    async fn test_list_filters_and_paginates_newest_first() {
        let repo = MemoryMessages::new();
        let tenant = TenantId::new();
        for i in 0..5 {
            repo.create(message(tenant, &format!("user{}@example.com", i), "p", i))
                .await
                .unwrap();
        }
        repo.create(message(TenantId::new(), "user9@example.com", "p", 0))
            .await
            .unwrap();

        let page = repo
            .list(
                tenant,
                &MessageQuery {
                    page: Some(1),
                    limit: Some(2),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(page.messages.len(), 2);
        assert_eq!(page.messages[0].to, "user4@example.com");

        let page = repo
            .list(
                tenant,
                &MessageQuery {
                    recipient: Some("USER2".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(page.total, 1);

        let page = repo
            .list(
                tenant,
                &MessageQuery {
                    status: Some(MessageStatus::Delivered),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(page.total, 0);
    }

    #[tokio::test]
    async fn test_active_subscriptions_only() {
        let repo = MemorySubscriptions::new();
        let tenant = TenantId::new();
        let active = repo.create(subscription(tenant, true)).await.unwrap();
        repo.create(subscription(tenant, false)).await.unwrap();
        let deleted = repo.create(subscription(tenant, true)).await.unwrap();
        repo.soft_delete(tenant, deleted.id).await.unwrap();

        let found = repo.find_active_by_tenant(tenant).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, active.id);

        let patched = repo
            .update(
                tenant,
                active.id,
                SubscriptionPatch {
                    last_triggered_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert!(patched.last_triggered_at.is_some());
    }
}
