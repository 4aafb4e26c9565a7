//! HTTP delivery of forward jobs.
//!
//! Every attempt is bounded by a per-request timeout and by a shared
//! concurrency limit. A failure affects only its own job. The subscription's
//! `last_triggered_at` is stamped after each attempt, successful or not.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use reqwest::Client;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{info, warn};

use super::types::ForwardJob;
use crate::model::SubscriptionPatch;
use crate::store::SubscriptionRepository;

pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";
pub const EVENT_HEADER: &str = "X-Webhook-Event";
pub const ID_HEADER: &str = "X-Webhook-Id";

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("subscriber returned status {0}")]
    Status(u16),
}

#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    pub timeout: Duration,
    pub max_concurrency: usize,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            max_concurrency: 32,
        }
    }
}

#[derive(Clone)]
pub struct Forwarder {
    client: Client,
    permits: Arc<Semaphore>,
    subscriptions: Arc<dyn SubscriptionRepository>,
}

impl Forwarder {
    pub fn new(
        config: &ForwarderConfig,
        subscriptions: Arc<dyn SubscriptionRepository>,
    ) -> Result<Self, ForwardError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .pool_max_idle_per_host(16)
            .build()?;

        Ok(Self {
            client,
            permits: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            subscriptions,
        })
    }

    /// Wait for a free delivery slot. The slot is released when the permit
    /// is dropped.
    pub async fn reserve(&self) -> Option<OwnedSemaphorePermit> {
        // Only fails once closed, which never happens here.
        self.permits.clone().acquire_owned().await.ok()
    }

    /// Attempt one delivery, waiting for a slot first.
    pub async fn deliver(&self, job: &ForwardJob) -> Result<(), ForwardError> {
        let permit = self.reserve().await;
        self.deliver_reserved(job, permit).await
    }

    /// Attempt one delivery in a slot already taken with [`Forwarder::reserve`].
    pub async fn deliver_reserved(
        &self,
        job: &ForwardJob,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Result<(), ForwardError> {
        let result = self.post(job).await;
        drop(permit);

        match &result {
            Ok(()) => info!(
                tenant_id = %job.tenant_id,
                subscription_id = %job.subscription_id,
                job_id = %job.job_id,
                event = %job.event,
                "webhook_forwarded"
            ),
            Err(e) => warn!(
                tenant_id = %job.tenant_id,
                subscription_id = %job.subscription_id,
                job_id = %job.job_id,
                event = %job.event,
                error = %e,
                "webhook_forward_failed"
            ),
        }

        self.mark_triggered(job).await;
        result
    }

    async fn post(&self, job: &ForwardJob) -> Result<(), ForwardError> {
        let response = self
            .client
            .post(&job.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(SIGNATURE_HEADER, &job.signature)
            .header(EVENT_HEADER, job.event.as_str())
            .header(ID_HEADER, job.job_id.to_string())
            .body(job.body.clone())
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(ForwardError::Status(status.as_u16()))
        }
    }

    async fn mark_triggered(&self, job: &ForwardJob) {
        let patch = SubscriptionPatch {
            last_triggered_at: Some(Utc::now()),
            ..Default::default()
        };
        if let Err(e) = self
            .subscriptions
            .update(job.tenant_id, job.subscription_id, patch)
            .await
        {
            warn!(
                subscription_id = %job.subscription_id,
                error = %e,
                "webhook_subscription_touch_failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use uuid::Uuid;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::events::{sign_payload, verify_signature};
    use crate::model::{EventKind, TenantId, WebhookSubscription};
    use crate::store::{MemorySubscriptions, Repository};

    async fn subscription(
        repo: &MemorySubscriptions,
        tenant: TenantId,
        url: &str,
    ) -> WebhookSubscription {
        repo.create(WebhookSubscription {
            id: Uuid::new_v4(),
            tenant_id: tenant,
            url: url.to_string(),
            event_filter: BTreeSet::new(),
            secret: format!("whsec_{}", Uuid::new_v4().simple()),
            is_active: true,
            last_triggered_at: None,
            created_at: Utc::now(),
            deleted_at: None,
        })
        .await
        .unwrap()
    }

    fn job_for(sub: &WebhookSubscription, body: &str) -> ForwardJob {
        ForwardJob {
            job_id: Uuid::new_v4(),
            tenant_id: sub.tenant_id,
            subscription_id: sub.id,
            url: sub.url.clone(),
            event: EventKind::Delivered,
            body: body.to_string(),
            signature: sign_payload(body.as_bytes(), &sub.secret),
        }
    }

    fn forwarder(repo: Arc<MemorySubscriptions>, timeout: Duration) -> Forwarder {
        Forwarder::new(
            &ForwarderConfig {
                timeout,
                max_concurrency: 8,
            },
            repo,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_deliver_sends_signed_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(header(EVENT_HEADER, "delivered"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let repo = Arc::new(MemorySubscriptions::new());
        let tenant = TenantId::new();
        let sub = subscription(&repo, tenant, &format!("{}/hook", server.uri())).await;
        let job = job_for(&sub, r#"{"event":"delivered"}"#);

        forwarder(repo.clone(), Duration::from_secs(5))
            .deliver(&job)
            .await
            .unwrap();

        let requests = server.received_requests().await.unwrap();
        let request = &requests[0];
        let signature = request
            .headers
            .get(SIGNATURE_HEADER)
            .unwrap()
            .to_str()
            .unwrap();
        assert!(verify_signature(&request.body, signature, &sub.secret));

        let stored = repo.find_by_id(tenant, sub.id).await.unwrap().unwrap();
        assert!(stored.last_triggered_at.is_some());
    }

    #[tokio::test]
    async fn test_non_success_status_is_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let repo = Arc::new(MemorySubscriptions::new());
        let tenant = TenantId::new();
        let sub = subscription(&repo, tenant, &server.uri()).await;

        let err = forwarder(repo.clone(), Duration::from_secs(5))
            .deliver(&job_for(&sub, "{}"))
            .await
            .unwrap_err();
        assert!(matches!(err, ForwardError::Status(500)));

        // Stamped even on failure.
        let stored = repo.find_by_id(tenant, sub.id).await.unwrap().unwrap();
        assert!(stored.last_triggered_at.is_some());
    }

    #[tokio::test]
    async fn test_slow_subscriber_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;

        let repo = Arc::new(MemorySubscriptions::new());
        let sub = subscription(&repo, TenantId::new(), &server.uri()).await;

        let err = forwarder(repo, Duration::from_millis(200))
            .deliver(&job_for(&sub, "{}"))
            .await
            .unwrap_err();
        assert!(matches!(err, ForwardError::Http(_)));
    }
}
