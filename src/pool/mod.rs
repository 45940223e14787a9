//! A bounded pool of reusable [`lapin::Channel`]s sharing a single connection.
//!
//! This module provides three key guarantees:
//! - at most `capacity` channels are open at any time, and each is checked out by at most one
//!   caller;
//! - a channel handed back to the pool can no longer be used through the handle that released it;
//! - a connection dropped by the broker is re-established, and the pooled channels with it.
//!
//! ```rust
//! use carrot_cake_channel_pool::amqp::configuration::RabbitMqSettings;
//! use carrot_cake_channel_pool::amqp::options::BasicPublishOptions;
//! use carrot_cake_channel_pool::amqp::BasicProperties;
//! use carrot_cake_channel_pool::pool::{ChannelPool, PoolSettings};
//!
//! // Function for asyncness.
//! async fn example() -> anyhow::Result<()> {
//!     // initialize rabbitmq connection details and config.
//!     let settings = RabbitMqSettings::default();
//!
//!     let pool = ChannelPool::from_config(&settings, PoolSettings::default()).await?;
//!
//!     // get a channel from the pool, use it, then give it back.
//!     let channel = pool.get().await?;
//!     channel
//!         .basic_publish(
//!             "exchange_name",
//!             "routing_key",
//!             BasicPublishOptions::default(),
//!             b"payload",
//!             BasicProperties::default(),
//!         )
//!         .await?;
//!     channel.release();
//!
//!     pool.close().await?;
//!     Ok(())
//! }
//! ```

mod channel;
mod channel_pool;
mod configuration;
mod error;
mod forward;
mod watchdog;

pub use channel::{ChannelId, ReusableChannel};
pub use channel_pool::{ChannelOf, ChannelPool, ChannelPoolBuilder, PoolStatus};
pub use configuration::{PoolSettings, ReconnectSettings};
pub use error::Error;
pub use watchdog::ConnectionHealth;
