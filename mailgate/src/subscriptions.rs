//! Tenant webhook subscription management.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::info;
use url::Url;
use uuid::Uuid;

use crate::error::GatewayError;
use crate::model::{EventKind, TenantId, WebhookSubscription};
use crate::store::SubscriptionRepository;

pub const SECRET_PREFIX: &str = "whsec_";

/// Body of `POST /api/webhooks`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateSubscription {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub events: Vec<String>,
}

/// Returned once at creation; the only time the secret is shown.
#[derive(Debug, Clone, Serialize)]
pub struct CreatedSubscription {
    #[serde(flatten)]
    pub subscription: WebhookSubscription,
    pub secret: String,
}

pub fn generate_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("{}{}", SECRET_PREFIX, hex::encode(bytes))
}

fn parse_subscriber_url(raw: &str) -> Result<Url, GatewayError> {
    let url = Url::parse(raw.trim())
        .map_err(|e| GatewayError::validation(format!("invalid url: {}", e)))?;
    match url.scheme() {
        "http" | "https" if url.host_str().is_some() => Ok(url),
        _ => Err(GatewayError::validation("url must be an absolute http(s) URL")),
    }
}

fn parse_filter(names: &[String]) -> Result<BTreeSet<EventKind>, GatewayError> {
    names
        .iter()
        .map(|name| {
            EventKind::parse_filter_name(name)
                .ok_or_else(|| GatewayError::validation(format!("unknown event type: {}", name)))
        })
        .collect()
}

#[derive(Clone)]
pub struct SubscriptionService {
    subscriptions: Arc<dyn SubscriptionRepository>,
}

impl SubscriptionService {
    pub fn new(subscriptions: Arc<dyn SubscriptionRepository>) -> Self {
        Self { subscriptions }
    }

    pub async fn create(
        &self,
        tenant_id: TenantId,
        request: &CreateSubscription,
    ) -> Result<CreatedSubscription, GatewayError> {
        let url = parse_subscriber_url(&request.url)?;
        let event_filter = parse_filter(&request.events)?;
        let secret = generate_secret();

        let subscription = self
            .subscriptions
            .create(WebhookSubscription {
                id: Uuid::new_v4(),
                tenant_id,
                url: url.to_string(),
                event_filter,
                secret: secret.clone(),
                is_active: true,
                last_triggered_at: None,
                created_at: Utc::now(),
                deleted_at: None,
            })
            .await?;

        info!(
            tenant_id = %tenant_id,
            subscription_id = %subscription.id,
            events = subscription.event_filter.len(),
            "webhook_subscription_created"
        );

        Ok(CreatedSubscription {
            subscription,
            secret,
        })
    }

    pub async fn list(&self, tenant_id: TenantId) -> Result<Vec<WebhookSubscription>, GatewayError> {
        Ok(self.subscriptions.find_by_tenant(tenant_id).await?)
    }

    pub async fn delete(&self, tenant_id: TenantId, id: Uuid) -> Result<(), GatewayError> {
        if self.subscriptions.soft_delete(tenant_id, id).await? {
            info!(tenant_id = %tenant_id, subscription_id = %id, "webhook_subscription_deleted");
            Ok(())
        } else {
            Err(GatewayError::NotFound("Webhook"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemorySubscriptions;

    fn service() -> SubscriptionService {
        SubscriptionService::new(Arc::new(MemorySubscriptions::new()))
    }

    fn request(url: &str, events: &[&str]) -> CreateSubscription {
        CreateSubscription {
            url: url.to_string(),
            events: events.iter().map(|e| e.to_string()).collect(),
        }
    }

    #[test]
    fn test_generate_secret_format() {
        let secret = generate_secret();
        assert!(secret.starts_with("whsec_"));
        assert_eq!(secret.len(), 6 + 64);
        assert_ne!(secret, generate_secret());
    }

    #[tokio::test]
    async fn test_create_persists_filter_and_hides_secret() {
        let service = service();
        let tenant = TenantId::new();

        let created = service
            .create(tenant, &request("https://hooks.example.com/mail", &["delivered", "Bounced"]))
            .await
            .unwrap();
        assert!(created.secret.starts_with("whsec_"));
        assert_eq!(created.subscription.secret, created.secret);

        let listed = service.list(tenant).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(
            listed[0].event_filter,
            [EventKind::Delivered, EventKind::Bounced].into_iter().collect()
        );

        let value = serde_json::to_value(&listed[0]).unwrap();
        assert!(value.get("secret").is_none());

        let value = serde_json::to_value(&created).unwrap();
        assert_eq!(value["secret"], created.secret.as_str());
    }

    #[tokio::test]
    async fn test_create_validates_url_and_events() {
        let service = service();
        let tenant = TenantId::new();

        for bad in ["", "not a url", "ftp://example.com/x", "mailto:a@example.com"] {
            assert!(matches!(
                service.create(tenant, &request(bad, &[])).await,
                Err(GatewayError::Validation(_))
            ));
        }
        assert!(matches!(
            service
                .create(tenant, &request("https://example.com", &["unknown"]))
                .await,
            Err(GatewayError::Validation(_))
        ));
        assert!(service.list(tenant).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_is_tenant_scoped() {
        let service = service();
        let tenant = TenantId::new();
        let created = service
            .create(tenant, &request("http://localhost:9000/hook", &[]))
            .await
            .unwrap();
        let id = created.subscription.id;

        assert!(matches!(
            service.delete(TenantId::new(), id).await,
            Err(GatewayError::NotFound("Webhook"))
        ));
        service.delete(tenant, id).await.unwrap();
        assert!(service.list(tenant).await.unwrap().is_empty());
    }
}
