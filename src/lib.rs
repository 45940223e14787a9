//! `carrot-cake-channel-pool` lets many concurrent publishers and consumers share a bounded
//! set of RabbitMq channels, multiplexed over a single connection, built on top of [`lapin`].
//!
//! [`ChannelPool`](crate::pool::ChannelPool) is the best starting point: it hands out
//! [`ReusableChannel`](crate::pool::ReusableChannel)s, refuses operations on channels that have
//! been given back, and reconnects on its own when the broker drops the connection.
//!
//! ## Examples
//!
//! Check the `demos` directory to see the pool in action.

pub mod amqp;
pub mod broker;
pub mod pool;
