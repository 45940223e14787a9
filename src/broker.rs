//! The seams between [`ChannelPool`](crate::pool::ChannelPool) and the AMQP client.
//!
//! The pool never talks to `lapin` directly: it dials through a [`Connector`], opens channels
//! through a [`BrokerConnection`] and closes them through a [`BrokerChannel`].
//! [`ConnectionFactory`](crate::amqp::ConnectionFactory), [`lapin::Connection`] and
//! [`lapin::Channel`] are the production implementations.
use anyhow::Context;
use std::fmt;
use tokio::sync::mpsc::UnboundedSender;
use tracing::warn;

/// Reply code sent to the broker when we close a connection or a channel on purpose.
/// See https://www.rabbitmq.com/amqp-0-9-1-reference.html#constants.
pub(crate) const REPLY_SUCCESS: u16 = 200;

/// Something that knows how to establish a new connection to the broker.
///
/// The pool dials once at construction and again every time the connection is lost.
#[async_trait::async_trait]
pub trait Connector: Send + Sync + 'static {
    type Connection: BrokerConnection;

    /// Establish a new connection to the broker.
    async fn connect(&self) -> Result<Self::Connection, anyhow::Error>;
}

/// A single logical connection to the broker, channels are multiplexed over it.
#[async_trait::async_trait]
pub trait BrokerConnection: Send + Sync + 'static {
    type Channel: BrokerChannel;

    /// Open a new channel on this connection.
    async fn open_channel(&self) -> Result<Self::Channel, anyhow::Error>;

    /// Close the connection.
    async fn close(&self) -> Result<(), anyhow::Error>;

    /// Register `notifier` to be triggered when the connection is closed unexpectedly.
    ///
    /// Implementations should notify at most once per connection.
    fn on_close(&self, notifier: CloseNotifier);
}

/// A channel opened on a [`BrokerConnection`].
#[async_trait::async_trait]
pub trait BrokerChannel: Send + Sync + 'static {
    /// Close the channel.
    async fn close(&self) -> Result<(), anyhow::Error>;
}

/// Notification emitted when a connection goes away without us asking for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionClosed {
    /// The generation of the connection that was closed.
    pub generation: u64,
    /// What the broker (or the client library) told us about the closure.
    pub reason: CloseReason,
}

/// Why a connection went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    /// `true` if the broker closed the connection, `false` if the client gave up on it
    /// (e.g. an I/O error or a missed heartbeat).
    pub server: bool,
    /// The AMQP reply code sent by the broker, if any.
    pub code: Option<u16>,
    pub text: String,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} ({})", self.text, code),
            None => self.text.fmt(f),
        }
    }
}

impl From<String> for CloseReason {
    fn from(text: String) -> Self {
        Self {
            server: false,
            code: None,
            text,
        }
    }
}

impl From<&str> for CloseReason {
    fn from(text: &str) -> Self {
        text.to_owned().into()
    }
}

impl From<&lapin::Error> for CloseReason {
    fn from(e: &lapin::Error) -> Self {
        match e {
            lapin::Error::ProtocolError(e) => Self {
                server: true,
                code: Some(e.get_id()),
                text: e.get_message().to_string(),
            },
            e => e.to_string().into(),
        }
    }
}

/// Handed to [`BrokerConnection::on_close`] to report an unexpected closure back to the pool.
///
/// Each notifier is stamped with the generation of the connection it was registered on, so
/// late notifications from a connection that has already been replaced can be told apart.
#[derive(Debug, Clone)]
pub struct CloseNotifier {
    generation: u64,
    sender: UnboundedSender<ConnectionClosed>,
}

impl CloseNotifier {
    pub(crate) fn new(generation: u64, sender: UnboundedSender<ConnectionClosed>) -> Self {
        Self { generation, sender }
    }

    /// The generation of the connection this notifier is attached to.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Report that the connection was closed.
    pub fn notify(&self, reason: impl Into<CloseReason>) {
        let event = ConnectionClosed {
            generation: self.generation,
            reason: reason.into(),
        };
        // The watchdog is gone once the pool is closed, nobody is left to care.
        if self.sender.send(event).is_err() {
            tracing::debug!(
                generation = self.generation,
                "Connection closed after the pool shut down"
            );
        }
    }
}

#[async_trait::async_trait]
impl BrokerConnection for lapin::Connection {
    type Channel = lapin::Channel;

    #[tracing::instrument(name = "rabbitmq_create_channel", skip(self))]
    async fn open_channel(&self) -> Result<lapin::Channel, anyhow::Error> {
        self.create_channel()
            .await
            .context("Failed to open a channel on the RabbitMq connection.")
    }

    async fn close(&self) -> Result<(), anyhow::Error> {
        lapin::Connection::close(self, REPLY_SUCCESS, "closing channel pool")
            .await
            .context("Failed to close the RabbitMq connection.")
    }

    fn on_close(&self, notifier: CloseNotifier) {
        self.on_error(move |e| {
            warn!("RabbitMQ broken connection: {:?}", e);
            notifier.notify(&e);
        });
    }
}

#[async_trait::async_trait]
impl BrokerChannel for lapin::Channel {
    async fn close(&self) -> Result<(), anyhow::Error> {
        lapin::Channel::close(self, REPLY_SUCCESS, "closing pooled channel")
            .await
            .context("Failed to close the RabbitMq channel.")
    }
}
