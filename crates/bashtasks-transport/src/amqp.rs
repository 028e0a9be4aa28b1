//! AMQP 0.9.1 sessions over `lapin`.
//!
//! Each destination becomes a durable fanout exchange bound to a durable queue
//! of the same name, plus a `<queue>.dlx` exchange and `<queue>.dlq` queue for
//! rejected messages. The channel runs in publisher-confirm mode so a publish
//! only returns once the broker has taken responsibility for the message.

use crate::{BrokerConfig, Deliveries, Delivery, DeliveryTag, Result, Session, Transport, TransportError};
use async_trait::async_trait;
use bashtasks_core::Destination;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions, BasicRejectOptions,
    ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

const REPLY_SUCCESS: u16 = 200;
const DELIVERY_MODE_TRANSIENT: u8 = 1;
const DELIVERY_MODE_PERSISTENT: u8 = 2;

/// [`Transport`] that opens one AMQP connection and channel per session.
#[derive(Debug, Clone, Copy, Default)]
pub struct AmqpTransport;

#[async_trait]
impl Transport for AmqpTransport {
    async fn connect(&self, config: &BrokerConfig) -> Result<Arc<dyn Session>> {
        let session = AmqpSession::open(config).await?;
        Ok(Arc::new(session))
    }

    fn name(&self) -> &'static str {
        "amqp"
    }
}

pub struct AmqpSession {
    connection: Connection,
    channel: Channel,
    closed: AtomicBool,
}

impl AmqpSession {
    pub async fn open(config: &BrokerConfig) -> Result<Self> {
        let connection = Connection::connect(
            &config.amqp_uri(),
            ConnectionProperties::default().with_connection_name(config.connection_name.clone().into()),
        )
        .await
        .map_err(|e| {
            TransportError::Connection(format!("AMQP connection to {} failed: {}", config.redacted_uri(), e))
        })?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| TransportError::Connection(format!("AMQP channel creation failed: {}", e)))?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| TransportError::Connection(format!("Failed to enable publisher confirms: {}", e)))?;

        debug!(broker = %config.redacted_uri(), channel = channel.id(), "AMQP session opened");

        Ok(AmqpSession {
            connection,
            channel,
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(TransportError::SessionClosed)
        }
    }

    async fn declare_destination(&self, destination: &Destination) -> Result<()> {
        let declare_err = |e: lapin::Error| TransportError::Declare {
            destination: destination.name().to_string(),
            reason: e.to_string(),
        };
        let dlx = format!("{}.dlx", destination.queue());
        let dlq = format!("{}.dlq", destination.queue());

        self.channel
            .exchange_declare(&dlx, ExchangeKind::Fanout, durable_exchange(), FieldTable::default())
            .await
            .map_err(declare_err)?;
        self.channel
            .queue_declare(&dlq, durable_queue(), FieldTable::default())
            .await
            .map_err(declare_err)?;
        self.channel
            .queue_bind(&dlq, &dlx, "", QueueBindOptions::default(), FieldTable::default())
            .await
            .map_err(declare_err)?;

        let mut args = FieldTable::default();
        args.insert("x-dead-letter-exchange".into(), AMQPValue::LongString(dlx.into()));

        self.channel
            .exchange_declare(
                destination.exchange(),
                ExchangeKind::Fanout,
                durable_exchange(),
                FieldTable::default(),
            )
            .await
            .map_err(declare_err)?;
        self.channel
            .queue_declare(destination.queue(), durable_queue(), args)
            .await
            .map_err(declare_err)?;
        self.channel
            .queue_bind(
                destination.queue(),
                destination.exchange(),
                "",
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(declare_err)?;

        Ok(())
    }
}

fn durable_exchange() -> ExchangeDeclareOptions {
    ExchangeDeclareOptions {
        durable: true,
        ..Default::default()
    }
}

fn durable_queue() -> QueueDeclareOptions {
    QueueDeclareOptions {
        durable: true,
        ..Default::default()
    }
}

#[async_trait]
impl Session for AmqpSession {
    async fn declare(&self, destinations: &[Destination]) -> Result<()> {
        self.ensure_open()?;
        for destination in destinations {
            self.declare_destination(destination).await?;
        }
        Ok(())
    }

    async fn publish(&self, destination: &Destination, payload: &[u8], persistent: bool) -> Result<()> {
        self.ensure_open()?;
        let publish_err = |reason: String| TransportError::Publish {
            destination: destination.name().to_string(),
            reason,
        };

        let delivery_mode = if persistent {
            DELIVERY_MODE_PERSISTENT
        } else {
            DELIVERY_MODE_TRANSIENT
        };

        let confirm = self
            .channel
            .basic_publish(
                destination.exchange(),
                "",
                BasicPublishOptions::default(),
                payload,
                BasicProperties::default()
                    .with_delivery_mode(delivery_mode)
                    .with_content_type("application/json".into()),
            )
            .await
            .map_err(|e| publish_err(format!("publish failed: {}", e)))?;

        let confirmation = confirm
            .await
            .map_err(|e| publish_err(format!("publish confirmation failed: {}", e)))?;

        if confirmation.is_nack() {
            return Err(publish_err("broker refused the message".to_string()));
        }

        Ok(())
    }

    async fn consume(&self, destination: &Destination, prefetch: u16) -> Result<Deliveries> {
        self.ensure_open()?;
        let consume_err = |e: lapin::Error| TransportError::Consume {
            destination: destination.name().to_string(),
            reason: e.to_string(),
        };

        self.channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(consume_err)?;

        let consumer = self
            .channel
            .basic_consume(
                destination.queue(),
                &format!("bashtasks-{}", self.channel.id()),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(consume_err)?;

        let name = destination.name().to_string();
        let deliveries = consumer.map(move |item| {
            item.map(|delivery| Delivery {
                tag: delivery.delivery_tag,
                body: delivery.data,
                redelivered: delivery.redelivered,
            })
            .map_err(|e| TransportError::Consume {
                destination: name.clone(),
                reason: e.to_string(),
            })
        });

        Ok(deliveries.boxed())
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<()> {
        self.ensure_open()?;
        self.channel
            .basic_ack(tag, BasicAckOptions::default())
            .await
            .map_err(|e| TransportError::Settle {
                tag,
                reason: format!("ack failed: {}", e),
            })
    }

    async fn reject(&self, tag: DeliveryTag, requeue: bool) -> Result<()> {
        self.ensure_open()?;
        self.channel
            .basic_reject(tag, BasicRejectOptions { requeue })
            .await
            .map_err(|e| TransportError::Settle {
                tag,
                reason: format!("reject failed: {}", e),
            })
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Err(e) = self.channel.close(REPLY_SUCCESS, "bashtasks shutdown").await {
            warn!(channel = self.channel.id(), error = %e, "Error closing AMQP channel");
        }
        self.connection
            .close(REPLY_SUCCESS, "bashtasks shutdown")
            .await
            .map_err(|e| TransportError::Connection(format!("Failed to close connection: {}", e)))
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.channel.status().connected()
    }
}
