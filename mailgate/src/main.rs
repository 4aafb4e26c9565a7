//! Mailgate server.
//!
//! Serves the send API and the Postal webhook endpoint, and runs the webhook
//! fan-out in the background of the same process.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::{net::TcpListener, signal, sync::watch};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use mailgate::dispatch::consumer;
use mailgate::events::signature::is_signature_verification_enabled;
use mailgate::model::TenantId;
use mailgate::store::{
    CounterStore, MemoryApiKeys, MemoryCounterStore, MemoryMessages, MemorySubscriptions,
    RedisCounterConfig, RedisCounterStore,
};
use mailgate::{
    router, AppState, Config, DirectSink, ForwardQueueMode, ForwardSink, Forwarder,
    ForwarderConfig, Gateway, GatewayDeps, PostalClient, Publisher, WebhookDispatcher,
};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    info!("mailgate_starting");

    let config = Config::from_env();
    info!(
        port = config.port,
        redis_configured = config.redis_url.is_some(),
        postal_api_url = %config.postal_api_url,
        postal_api_key_set = !config.postal_api_key.is_empty(),
        window_secs = config.rate_limit_window_secs,
        window_mode = config.rate_limit_window_mode.as_str(),
        fan_out_policy = config.fan_out_policy.as_str(),
        forward_queue = ?config.webhook_forward_queue,
        "config_loaded"
    );

    if !is_signature_verification_enabled(&config.postal_webhook_secret) {
        warn!("postal_webhook_signature_not_enforced");
    }

    let counters: Arc<dyn CounterStore> = match &config.redis_url {
        Some(url) => {
            let store = RedisCounterStore::new(&RedisCounterConfig {
                url: url.clone(),
                pool_size: config.redis_pool_size,
                ..Default::default()
            })
            .context("Failed to create Redis pool")?;
            info!(pool_size = config.redis_pool_size, "redis_counter_store_ready");
            Arc::new(store)
        }
        None => {
            warn!("redis_not_configured_using_memory_counters");
            Arc::new(MemoryCounterStore::new())
        }
    };

    let api_keys = Arc::new(MemoryApiKeys::new());
    let messages = Arc::new(MemoryMessages::new());
    let subscriptions = Arc::new(MemorySubscriptions::new());

    let provider = PostalClient::new(
        config.postal_api_url.clone(),
        config.postal_api_key.clone(),
        config.provider_timeout(),
    )
    .context("Failed to create Postal client")?;

    let forwarder = Forwarder::new(
        &ForwarderConfig {
            timeout: config.webhook_forward_timeout(),
            max_concurrency: config.webhook_max_concurrency,
        },
        subscriptions.clone(),
    )
    .context("Failed to create webhook forwarder")?;

    // Tells the forward consumer to stop once the server has drained.
    let (stop_tx, mut stop_rx) = watch::channel(false);

    let mut publisher = None;
    let mut consumer_task = None;
    let sink: Arc<dyn ForwardSink> = match config.webhook_forward_queue {
        ForwardQueueMode::Direct => Arc::new(DirectSink::new(forwarder)),
        ForwardQueueMode::Amqp => {
            let amqp = Publisher::new(config.cloudamqp_url.clone());
            let url = config.cloudamqp_url.clone();
            let prefetch = u16::try_from(config.webhook_max_concurrency).unwrap_or(u16::MAX);
            consumer_task = Some(tokio::spawn(async move {
                let shutdown = async move {
                    let _ = stop_rx.changed().await;
                };
                if let Err(e) = consumer::run(&url, prefetch, forwarder, shutdown).await {
                    error!(error = %e, "forward_consumer_failed");
                }
            }));
            publisher = Some(amqp.clone());
            Arc::new(amqp)
        }
    };

    let (dispatcher, dispatcher_task) =
        WebhookDispatcher::spawn(subscriptions.clone(), sink, config.webhook_queue_capacity);

    let gateway = Gateway::new(GatewayDeps {
        api_keys,
        messages,
        subscriptions,
        counters,
        provider: Arc::new(provider),
        dispatcher,
        rate_limit_window: config.rate_limit_window(),
        window_policy: config.rate_limit_window_mode,
        fan_out_policy: config.fan_out_policy,
        inbound_webhook_secret: config.postal_webhook_secret.clone(),
    });

    bootstrap_api_key(&gateway, &config).await?;

    let state = AppState::new(gateway, config.default_rate_limit);
    let app = router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    info!(address = %addr, "web_server_listening");

    // Run server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    // The router held the last dispatcher handle; the task drains and exits.
    match tokio::time::timeout(DRAIN_TIMEOUT, dispatcher_task).await {
        Ok(Err(e)) => warn!(error = %e, "webhook_dispatcher_join_failed"),
        Err(_) => warn!("webhook_dispatcher_drain_timeout"),
        Ok(Ok(())) => {}
    }

    let _ = stop_tx.send(true);
    if let Some(task) = consumer_task {
        if let Err(e) = task.await {
            warn!(error = %e, "forward_consumer_join_failed");
        }
    }
    if let Some(publisher) = publisher {
        publisher.close().await;
    }

    info!("mailgate_shutdown_complete");

    Ok(())
}

/// Issue a first API key so a fresh in-memory deployment is usable.
async fn bootstrap_api_key(gateway: &Gateway, config: &Config) -> Result<()> {
    let Some(raw_tenant) = config.bootstrap_tenant_id.as_deref() else {
        return Ok(());
    };

    let tenant: TenantId = match raw_tenant.parse() {
        Ok(tenant) => tenant,
        Err(e) => {
            warn!(value = %raw_tenant, error = %e, "bootstrap_tenant_id_invalid");
            return Ok(());
        }
    };

    let name = config
        .bootstrap_api_key_name
        .as_deref()
        .unwrap_or("bootstrap");

    let (key, raw) = gateway
        .credentials()
        .create(tenant, name, config.default_rate_limit)
        .await
        .context("Failed to create bootstrap API key")?;

    info!(
        tenant_id = %tenant,
        api_key_id = %key.id,
        key_prefix = %key.key_prefix,
        "bootstrap_api_key_created"
    );
    // Shown once, outside the structured log stream.
    eprintln!("bootstrap API key for tenant {}: {}", tenant, raw);

    Ok(())
}

/// Create a future that completes when a shutdown signal is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }

    info!("web_server_shutting_down");
}
