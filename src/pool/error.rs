use super::ChannelId;

/// Error returned by [`ChannelPool`](super::ChannelPool) and
/// [`ReusableChannel`](super::ReusableChannel).
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Failed to establish a connection with the RabbitMq broker")]
    Connection(#[source] anyhow::Error),
    #[error("Failed to get a reusable channel, all channels in the pool are in use")]
    AllChannelsInUse,
    #[error("Tried to use channel {0} after it was released back to the pool")]
    UseReleasedChannel(ChannelId),
    #[error("There is no released channel with id {0} in the pool")]
    ChannelNotFound(ChannelId),
    #[error("The channel pool has been closed")]
    PoolClosed,
    #[error("A channel pool must be able to hold at least one channel")]
    InvalidCapacity,
    #[error("Generic error encountered when interacting with the RabbitMq broker")]
    Broker(#[source] anyhow::Error),
    /// A forwarded operation failed, the client error is passed through untouched.
    #[error(transparent)]
    Amqp(#[from] lapin::Error),
}
