//! Background fan-out of delivery events to tenant subscriptions.

use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::sink::ForwardSink;
use super::types::{ForwardJob, ForwardPayload};
use crate::events::sign_payload;
use crate::model::{DeliveryEvent, TenantId};
use crate::store::{StoreError, SubscriptionRepository};

/// Build one signed job per active subscription of `tenant_id` that accepts
/// the event's kind.
pub async fn prepare_jobs(
    subscriptions: &dyn SubscriptionRepository,
    tenant_id: TenantId,
    event: &DeliveryEvent,
) -> Result<Vec<ForwardJob>, StoreError> {
    let targets: Vec<_> = subscriptions
        .find_active_by_tenant(tenant_id)
        .await?
        .into_iter()
        .filter(|s| s.accepts(event.kind))
        .collect();

    if targets.is_empty() {
        return Ok(Vec::new());
    }

    let body = serde_json::to_string(&ForwardPayload::from_event(event))
        .map_err(|e| StoreError::Backend(format!("failed to encode forward payload: {}", e)))?;

    Ok(targets
        .into_iter()
        .map(|sub| ForwardJob {
            job_id: Uuid::new_v4(),
            tenant_id,
            subscription_id: sub.id,
            signature: sign_payload(body.as_bytes(), &sub.secret),
            url: sub.url,
            event: event.kind,
            body: body.clone(),
        })
        .collect())
}

struct DispatchRequest {
    tenant_id: TenantId,
    event: DeliveryEvent,
}

/// Handle for enqueueing events. Cheap to clone.
#[derive(Clone)]
pub struct WebhookDispatcher {
    tx: mpsc::Sender<DispatchRequest>,
}

impl WebhookDispatcher {
    /// Start the background fan-out task.
    ///
    /// The task runs until every handle is dropped and the channel drains.
    pub fn spawn(
        subscriptions: Arc<dyn SubscriptionRepository>,
        sink: Arc<dyn ForwardSink>,
        capacity: usize,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        info!(sink = sink.name(), capacity = capacity, "webhook_dispatcher_started");
        let handle = tokio::spawn(run(rx, subscriptions, sink));
        (Self { tx }, handle)
    }

    /// Queue an event for fan-out without waiting.
    ///
    /// Returns `false` when the event was dropped because the queue is full
    /// or the background task is gone.
    pub fn dispatch(&self, tenant_id: TenantId, event: DeliveryEvent) -> bool {
        match self.tx.try_send(DispatchRequest { tenant_id, event }) {
            Ok(()) => true,
            Err(TrySendError::Full(req)) => {
                warn!(
                    tenant_id = %req.tenant_id,
                    provider_message_id = %req.event.provider_message_id,
                    "webhook_dispatch_queue_full"
                );
                false
            }
            Err(TrySendError::Closed(req)) => {
                error!(tenant_id = %req.tenant_id, "webhook_dispatcher_closed");
                false
            }
        }
    }
}

async fn run(
    mut rx: mpsc::Receiver<DispatchRequest>,
    subscriptions: Arc<dyn SubscriptionRepository>,
    sink: Arc<dyn ForwardSink>,
) {
    while let Some(DispatchRequest { tenant_id, event }) = rx.recv().await {
        let jobs = match prepare_jobs(subscriptions.as_ref(), tenant_id, &event).await {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!(tenant_id = %tenant_id, error = %e, "webhook_dispatch_prepare_failed");
                continue;
            }
        };

        debug!(
            tenant_id = %tenant_id,
            kind = %event.kind,
            jobs = jobs.len(),
            "webhook_dispatch_prepared"
        );

        for job in jobs {
            let subscription_id = job.subscription_id;
            if let Err(e) = sink.submit(job).await {
                warn!(
                    tenant_id = %tenant_id,
                    subscription_id = %subscription_id,
                    sink = sink.name(),
                    error = %e,
                    "webhook_forward_submit_failed"
                );
            }
        }
    }

    info!("webhook_dispatcher_stopped");
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::json;
    use tokio::sync::Mutex;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::dispatch::{DirectSink, Forwarder, ForwarderConfig};
    use crate::events::verify_signature;
    use crate::model::{EventKind, SubscriptionPatch, WebhookSubscription};
    use crate::store::{MemorySubscriptions, Repository};

    #[derive(Default)]
    struct RecordingSink {
        jobs: Mutex<Vec<ForwardJob>>,
    }

    #[async_trait]
    impl ForwardSink for RecordingSink {
        async fn submit(&self, job: ForwardJob) -> anyhow::Result<()> {
            self.jobs.lock().await.push(job);
            Ok(())
        }

        fn name(&self) -> &'static str {
            "recording"
        }
    }

    async fn subscribe(
        repo: &MemorySubscriptions,
        tenant: TenantId,
        filter: &[EventKind],
        secret: &str,
    ) -> WebhookSubscription {
        repo.create(WebhookSubscription {
            id: Uuid::new_v4(),
            tenant_id: tenant,
            url: format!("https://hooks.example.com/{}", secret),
            event_filter: filter.iter().copied().collect::<BTreeSet<_>>(),
            secret: secret.to_string(),
            is_active: true,
            last_triggered_at: None,
            created_at: Utc::now(),
            deleted_at: None,
        })
        .await
        .unwrap()
    }

    fn event(kind: EventKind) -> DeliveryEvent {
        DeliveryEvent {
            kind,
            provider_message_id: "p-1".to_string(),
            occurred_at: Utc::now(),
            provider_event_id: Some("evt".to_string()),
            raw_payload: json!({ "payload": { "message_id": "p-1" } }),
        }
    }

    #[tokio::test]
    async fn test_prepare_filters_and_signs_per_subscription() {
        let repo = MemorySubscriptions::new();
        let tenant = TenantId::new();
        let all = subscribe(&repo, tenant, &[], "whsec_all").await;
        let bounces = subscribe(&repo, tenant, &[EventKind::Bounced], "whsec_bounce").await;
        let inactive = subscribe(&repo, tenant, &[], "whsec_off").await;
        repo.update(
            tenant,
            inactive.id,
            SubscriptionPatch {
                is_active: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        subscribe(&repo, TenantId::new(), &[], "whsec_other_tenant").await;

        let jobs = prepare_jobs(&repo, tenant, &event(EventKind::Delivered)).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].subscription_id, all.id);
        assert!(verify_signature(jobs[0].body.as_bytes(), &jobs[0].signature, "whsec_all"));

        let jobs = prepare_jobs(&repo, tenant, &event(EventKind::Bounced)).await.unwrap();
        assert_eq!(jobs.len(), 2);
        let bounce_job = jobs.iter().find(|j| j.subscription_id == bounces.id).unwrap();
        assert!(verify_signature(
            bounce_job.body.as_bytes(),
            &bounce_job.signature,
            "whsec_bounce"
        ));
        assert!(!verify_signature(
            bounce_job.body.as_bytes(),
            &bounce_job.signature,
            "whsec_all"
        ));
    }

    #[tokio::test]
    async fn test_unknown_events_are_never_forwarded() {
        let repo = MemorySubscriptions::new();
        let tenant = TenantId::new();
        subscribe(&repo, tenant, &[], "whsec_all").await;

        let jobs = prepare_jobs(&repo, tenant, &event(EventKind::Unknown)).await.unwrap();
        assert!(jobs.is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_reaches_sink_in_background() {
        let repo = Arc::new(MemorySubscriptions::new());
        let tenant = TenantId::new();
        subscribe(&repo, tenant, &[], "whsec_a").await;
        subscribe(&repo, tenant, &[], "whsec_b").await;

        let sink = Arc::new(RecordingSink::default());
        let (dispatcher, handle) = WebhookDispatcher::spawn(repo, sink.clone(), 8);

        assert!(dispatcher.dispatch(tenant, event(EventKind::Opened)));
        drop(dispatcher);
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();

        let jobs = sink.jobs.lock().await;
        assert_eq!(jobs.len(), 2);
        assert!(jobs.iter().all(|j| j.event == EventKind::Opened));
    }

    #[tokio::test]
    async fn test_dispatch_drops_when_queue_full() {
        let (tx, _rx) = mpsc::channel(1);
        let dispatcher = WebhookDispatcher { tx };

        assert!(dispatcher.dispatch(TenantId::new(), event(EventKind::Sent)));
        assert!(!dispatcher.dispatch(TenantId::new(), event(EventKind::Sent)));
    }

    // -- Through the in-process delivery path --------------------------------

    async fn subscribe_at(repo: &MemorySubscriptions, tenant: TenantId, url: &str) -> WebhookSubscription {
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

    fn direct_sink(repo: Arc<MemorySubscriptions>, max_concurrency: usize) -> Arc<DirectSink> {
        let forwarder = Forwarder::new(
            &ForwarderConfig {
                timeout: Duration::from_secs(2),
                max_concurrency,
            },
            repo,
        )
        .unwrap();
        Arc::new(DirectSink::new(forwarder))
    }

    #[tokio::test]
    async fn test_unreachable_subscriber_does_not_block_others() {
        let ok_a = MockServer::start().await;
        let ok_b = MockServer::start().await;
        for server in [&ok_a, &ok_b] {
            Mock::given(method("POST"))
                .respond_with(ResponseTemplate::new(200))
                .expect(1)
                .mount(server)
                .await;
        }

        let repo = Arc::new(MemorySubscriptions::new());
        let tenant = TenantId::new();
        let subs = vec![
            subscribe_at(&repo, tenant, &ok_a.uri()).await,
            subscribe_at(&repo, tenant, "http://127.0.0.1:1/unreachable").await,
            subscribe_at(&repo, tenant, &ok_b.uri()).await,
        ];

        let (dispatcher, _handle) =
            WebhookDispatcher::spawn(repo.clone(), direct_sink(repo.clone(), 8), 8);
        assert!(dispatcher.dispatch(tenant, event(EventKind::Delivered)));

        // Every attempt, failed or not, stamps its subscription.
        let mut stamped = 0;
        for _ in 0..50 {
            stamped = 0;
            for sub in &subs {
                let stored = repo.find_by_id(tenant, sub.id).await.unwrap().unwrap();
                if stored.last_triggered_at.is_some() {
                    stamped += 1;
                }
            }
            if stamped == subs.len() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(stamped, 3);

        assert_eq!(ok_a.received_requests().await.unwrap().len(), 1);
        assert_eq!(ok_b.received_requests().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_slow_subscribers_fill_the_queue() {
        let slow = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&slow)
            .await;

        let repo = Arc::new(MemorySubscriptions::new());
        let tenant = TenantId::new();
        subscribe_at(&repo, tenant, &slow.uri()).await;

        let (dispatcher, _handle) =
            WebhookDispatcher::spawn(repo.clone(), direct_sink(repo.clone(), 1), 1);

        let mut dropped = false;
        for _ in 0..10 {
            if !dispatcher.dispatch(tenant, event(EventKind::Delivered)) {
                dropped = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(dropped);
    }
}
