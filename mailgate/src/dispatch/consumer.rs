//! RabbitMQ consumer for forward jobs.
//!
//! Runs inside the gateway process. Each delivery is handled on its own task
//! and acknowledged once the forward attempt finishes, whatever its outcome.
//! Undecodable messages are dropped rather than requeued.

use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::StreamExt;
use lapin::{
    options::{BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions},
    types::FieldTable,
    Channel, Connection, ConnectionProperties,
};
use tracing::{error, info, warn};

use super::forwarder::Forwarder;
use super::publisher::declare_forward_queue;
use super::types::{ForwardJob, FORWARD_QUEUE};

const CONSUMER_TAG: &str = "mailgate-forwarder";

/// Consume the forward queue until `shutdown` resolves or the broker closes
/// the consumer.
pub async fn run<F>(url: &str, prefetch: u16, forwarder: Forwarder, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send,
{
    info!(url_length = url.len(), "rabbitmq_consumer_connecting");

    let conn = Connection::connect(url, ConnectionProperties::default())
        .await
        .context("Failed to connect to RabbitMQ")?;

    let channel = conn.create_channel().await.context("Failed to create channel")?;

    channel
        .basic_qos(prefetch, BasicQosOptions::default())
        .await
        .context("Failed to set QoS")?;

    declare_forward_queue(&channel).await?;

    let mut consumer = channel
        .basic_consume(
            FORWARD_QUEUE,
            CONSUMER_TAG,
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await
        .context("Failed to start consumer")?;

    info!(queue = FORWARD_QUEUE, prefetch = prefetch, "rabbitmq_consumer_started");

    let channel = Arc::new(channel);
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("rabbitmq_consumer_stopping");
                break;
            }
            delivery = consumer.next() => {
                match delivery {
                    Some(Ok(delivery)) => {
                        let channel = Arc::clone(&channel);
                        let forwarder = forwarder.clone();
                        tokio::spawn(async move {
                            handle_delivery(&channel, &forwarder, delivery.delivery_tag, &delivery.data).await;
                        });
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "rabbitmq_delivery_error");
                    }
                    None => {
                        warn!("rabbitmq_consumer_closed");
                        break;
                    }
                }
            }
        }
    }

    if let Err(e) = conn.close(200, "Normal shutdown").await {
        warn!(error = %e, "rabbitmq_connection_close_error");
    }
    info!("rabbitmq_consumer_shutdown_complete");
    Ok(())
}

async fn handle_delivery(channel: &Channel, forwarder: &Forwarder, delivery_tag: u64, data: &[u8]) {
    let job: ForwardJob = match serde_json::from_slice(data) {
        Ok(job) => job,
        Err(e) => {
            error!(delivery_tag = delivery_tag, error = %e, "rabbitmq_forward_decode_failed");
            if let Err(nack_err) = channel
                .basic_nack(
                    delivery_tag,
                    BasicNackOptions {
                        requeue: false,
                        ..Default::default()
                    },
                )
                .await
            {
                error!(delivery_tag = delivery_tag, error = %nack_err, "rabbitmq_nack_failed");
            }
            return;
        }
    };

    // No redelivery on a failed forward; the forwarder already logged it.
    let _ = forwarder.deliver(&job).await;

    if let Err(e) = channel
        .basic_ack(delivery_tag, BasicAckOptions::default())
        .await
    {
        error!(delivery_tag = delivery_tag, error = %e, "rabbitmq_ack_failed");
    }
}
