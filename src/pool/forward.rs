//! The AMQP operations a [`ReusableChannel`] forwards to its [`lapin::Channel`].
//!
//! Every method checks that the handle has not been released and then calls the `lapin` method
//! with the same name, verbatim. Errors raised by `lapin` are returned as [`Error::Amqp`].
use amq_protocol_types::FieldTable;
use lapin::{
    message::{BasicGetMessage, BasicReturnMessage},
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicGetOptions,
        BasicNackOptions, BasicPublishOptions, BasicQosOptions, BasicRecoverOptions,
        BasicRejectOptions, ChannelFlowOptions, ConfirmSelectOptions, ExchangeBindOptions,
        ExchangeDeclareOptions, ExchangeDeleteOptions, ExchangeUnbindOptions,
        QueueBindOptions, QueueDeclareOptions, QueueDeleteOptions, QueuePurgeOptions,
    },
    publisher_confirm::PublisherConfirm,
    BasicProperties, Channel, ChannelStatus, Consumer, ExchangeKind, Queue,
};

use super::{Error, ReusableChannel};

impl ReusableChannel<Channel> {
    /// Publish a payload on an exchange.
    ///
    /// The returned [`PublisherConfirm`] resolves once the broker confirms the message, if
    /// publisher confirms are enabled on the channel (see [`ReusableChannel::confirm_select`]).
    #[tracing::instrument(level = "debug", skip(self, payload, properties), fields(channel_id = %self.id()))]
    pub async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        options: BasicPublishOptions,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<PublisherConfirm, Error> {
        Ok(self
            .channel()?
            .basic_publish(exchange, routing_key, options, payload, properties)
            .await?)
    }

    pub async fn basic_ack(&self, delivery_tag: u64, options: BasicAckOptions) -> Result<(), Error> {
        Ok(self.channel()?.basic_ack(delivery_tag, options).await?)
    }

    pub async fn basic_nack(
        &self,
        delivery_tag: u64,
        options: BasicNackOptions,
    ) -> Result<(), Error> {
        Ok(self.channel()?.basic_nack(delivery_tag, options).await?)
    }

    pub async fn basic_reject(
        &self,
        delivery_tag: u64,
        options: BasicRejectOptions,
    ) -> Result<(), Error> {
        Ok(self.channel()?.basic_reject(delivery_tag, options).await?)
    }

    /// Fetch a single message from `queue`, if there is one.
    pub async fn basic_get(
        &self,
        queue: &str,
        options: BasicGetOptions,
    ) -> Result<Option<BasicGetMessage>, Error> {
        Ok(self.channel()?.basic_get(queue, options).await?)
    }

    /// Start consuming from `queue`.
    ///
    /// The returned [`Consumer`] keeps working after the handle is released: releasing only
    /// guards the operations issued through this handle.
    pub async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: BasicConsumeOptions,
        arguments: FieldTable,
    ) -> Result<Consumer, Error> {
        Ok(self
            .channel()?
            .basic_consume(queue, consumer_tag, options, arguments)
            .await?)
    }

    pub async fn basic_cancel(
        &self,
        consumer_tag: &str,
        options: BasicCancelOptions,
    ) -> Result<(), Error> {
        Ok(self.channel()?.basic_cancel(consumer_tag, options).await?)
    }

    pub async fn basic_qos(
        &self,
        prefetch_count: u16,
        options: BasicQosOptions,
    ) -> Result<(), Error> {
        Ok(self.channel()?.basic_qos(prefetch_count, options).await?)
    }

    pub async fn basic_recover(&self, options: BasicRecoverOptions) -> Result<(), Error> {
        Ok(self.channel()?.basic_recover(options).await?)
    }

    /// Enable publisher confirms on the channel.
    pub async fn confirm_select(&self, options: ConfirmSelectOptions) -> Result<(), Error> {
        Ok(self.channel()?.confirm_select(options).await?)
    }

    /// Wait for all the pending publisher confirms, returning the messages the broker
    /// handed back.
    pub async fn wait_for_confirms(&self) -> Result<Vec<BasicReturnMessage>, Error> {
        Ok(self.channel()?.wait_for_confirms().await?)
    }

    #[tracing::instrument(name = "rabbitmq_declare_queue", skip(self, arguments), fields(channel_id = %self.id()))]
    pub async fn queue_declare(
        &self,
        queue: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<Queue, Error> {
        Ok(self
            .channel()?
            .queue_declare(queue, options, arguments)
            .await?)
    }

    #[tracing::instrument(name = "rabbitmq_bind_queue", skip(self, arguments), fields(channel_id = %self.id()))]
    pub async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        options: QueueBindOptions,
        arguments: FieldTable,
    ) -> Result<(), Error> {
        Ok(self
            .channel()?
            .queue_bind(queue, exchange, routing_key, options, arguments)
            .await?)
    }

    #[tracing::instrument(name = "rabbitmq_unbind_queue", skip(self, arguments), fields(channel_id = %self.id()))]
    pub async fn queue_unbind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<(), Error> {
        Ok(self
            .channel()?
            .queue_unbind(queue, exchange, routing_key, arguments)
            .await?)
    }

    /// Purge `queue`, returning the number of messages that were dropped.
    pub async fn queue_purge(&self, queue: &str, options: QueuePurgeOptions) -> Result<u32, Error> {
        Ok(self.channel()?.queue_purge(queue, options).await?)
    }

    /// Delete `queue`, returning the number of messages it held.
    pub async fn queue_delete(
        &self,
        queue: &str,
        options: QueueDeleteOptions,
    ) -> Result<u32, Error> {
        Ok(self.channel()?.queue_delete(queue, options).await?)
    }

    #[tracing::instrument(name = "rabbitmq_declare_exchange", skip(self, arguments), fields(channel_id = %self.id()))]
    pub async fn exchange_declare(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), Error> {
        Ok(self
            .channel()?
            .exchange_declare(exchange, kind, options, arguments)
            .await?)
    }

    pub async fn exchange_bind(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
        options: ExchangeBindOptions,
        arguments: FieldTable,
    ) -> Result<(), Error> {
        Ok(self
            .channel()?
            .exchange_bind(destination, source, routing_key, options, arguments)
            .await?)
    }

    pub async fn exchange_unbind(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
        options: ExchangeUnbindOptions,
        arguments: FieldTable,
    ) -> Result<(), Error> {
        Ok(self
            .channel()?
            .exchange_unbind(destination, source, routing_key, options, arguments)
            .await?)
    }

    pub async fn exchange_delete(
        &self,
        exchange: &str,
        options: ExchangeDeleteOptions,
    ) -> Result<(), Error> {
        Ok(self.channel()?.exchange_delete(exchange, options).await?)
    }

    /// Ask the broker to pause (`active: false`) or resume deliveries on this channel.
    pub async fn channel_flow(&self, options: ChannelFlowOptions) -> Result<bool, Error> {
        Ok(self.channel()?.channel_flow(options).await?)
    }

    pub async fn tx_select(&self) -> Result<(), Error> {
        Ok(self.channel()?.tx_select().await?)
    }

    pub async fn tx_commit(&self) -> Result<(), Error> {
        Ok(self.channel()?.tx_commit().await?)
    }

    pub async fn tx_rollback(&self) -> Result<(), Error> {
        Ok(self.channel()?.tx_rollback().await?)
    }

    /// Register a callback invoked when the underlying channel fails.
    pub fn on_error<E: FnMut(lapin::Error) + Send + 'static>(&self, handler: E) -> Result<(), Error> {
        self.channel()?.on_error(handler);
        Ok(())
    }

    /// The status of the underlying channel.
    pub fn status(&self) -> Result<ChannelStatus, Error> {
        Ok(self.channel()?.status().clone())
    }
}
