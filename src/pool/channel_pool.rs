use futures_util::future::try_join_all;
use std::collections::BTreeMap;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, PoisonError};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::amqp::configuration::RabbitMqSettings;
use crate::amqp::ConnectionFactory;
use crate::broker::{BrokerChannel, BrokerConnection, CloseNotifier, ConnectionClosed, Connector};

use super::channel::Slot;
use super::configuration::{PoolSettings, ReconnectSettings};
use super::watchdog::{watch_connection, ConnectionHealth};
use super::{ChannelId, Error, ReusableChannel};

/// The channel type produced by the connections of a [`Connector`].
pub type ChannelOf<F> = <<F as Connector>::Connection as BrokerConnection>::Channel;

/// A bounded pool of [`ReusableChannel`]s multiplexed over a single broker connection.
///
/// # Lifecycle
///
/// When built, the pool dials the broker once and eagerly opens `capacity` channels, with ids
/// `1..=capacity`, all available. [`ChannelPool::get`] hands out an available channel (or opens
/// a new one if some were closed via [`ChannelPool::close_channel`]); releasing or dropping the
/// [`ReusableChannel`] gives it back.
///
/// # Fault tolerance
///
/// A background task watches the connection. If the broker drops it, the pool reconnects with
/// an exponential backoff and re-opens every channel on the new connection, keeping their ids
/// and whether they are checked out or not. [`ChannelPool::health`] tells you where it is at.
///
/// `ChannelPool` is cheap to clone: all clones share the same channels.
/// Call [`ChannelPool::close`] to shut it down.
pub struct ChannelPool<F: Connector = ConnectionFactory> {
    inner: Arc<Inner<F>>,
}

impl<F: Connector> Clone for ChannelPool<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// The front of the pool, owned by the `ChannelPool` clones only.
///
/// Dropping it drops the shutdown sender, which stops the background tasks.
struct Inner<F: Connector> {
    shared: Arc<Shared<F>>,
    release_signal: UnboundedSender<ChannelId>,
    shutdown: watch::Sender<bool>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

/// State shared between the pool front and its background tasks.
pub(super) struct Shared<F: Connector> {
    pub(super) connector: F,
    pub(super) capacity: usize,
    pub(super) reconnect: ReconnectSettings,
    pub(super) state: Mutex<PoolState<F>>,
    pub(super) health: watch::Sender<ConnectionHealth>,
    /// The generation handed to the next dialed connection.
    pub(super) next_generation: AtomicU64,
    /// Handed to every new connection so it can report its own death to the watchdog.
    pub(super) close_signal: UnboundedSender<ConnectionClosed>,
}

/// Everything guarded by the pool lock: the live connection and the channel bookkeeping.
pub(super) struct PoolState<F: Connector> {
    pub(super) connection: Arc<F::Connection>,
    /// Bumped every time the connection is replaced.
    pub(super) generation: u64,
    next_id: u64,
    pub(super) in_use: BTreeMap<ChannelId, Arc<Slot<ChannelOf<F>>>>,
    pub(super) available: BTreeMap<ChannelId, Arc<Slot<ChannelOf<F>>>>,
    pub(super) closed: bool,
}

impl<F: Connector> PoolState<F> {
    fn len(&self) -> usize {
        self.in_use.len() + self.available.len()
    }

    fn allocate_id(&mut self) -> ChannelId {
        let id = ChannelId::new(self.next_id);
        self.next_id += 1;
        id
    }

    /// Move channels whose handle has already been released back to the available set,
    /// without waiting for the release listener to catch up.
    fn reclaim_released(&mut self) {
        let released: Vec<_> = self
            .in_use
            .iter()
            .filter(|(_, slot)| slot.is_released())
            .map(|(id, _)| *id)
            .collect();
        for id in released {
            if let Some(slot) = self.in_use.remove(&id) {
                self.available.insert(id, slot);
            }
        }
    }

    /// Every live slot, checked out or not.
    pub(super) fn slots(&self) -> Vec<Arc<Slot<ChannelOf<F>>>> {
        self.in_use
            .values()
            .chain(self.available.values())
            .cloned()
            .collect()
    }
}

/// A snapshot of the pool occupancy, see [`ChannelPool::status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// The maximum number of channels the pool can hold.
    pub capacity: usize,
    /// Channels ready to be handed out.
    pub available: usize,
    /// Channels currently checked out.
    pub in_use: usize,
}

impl ChannelPool<ConnectionFactory> {
    /// Build a pool connected to the RabbitMq broker described by `settings`.
    pub async fn from_config(
        settings: &RabbitMqSettings,
        pool_settings: PoolSettings,
    ) -> Result<Self, Error> {
        let factory = ConnectionFactory::new_from_config(settings).map_err(Error::Connection)?;
        Self::new(factory, pool_settings).await
    }
}

impl<F: Connector> ChannelPool<F> {
    /// Start building a [`ChannelPool`].
    ///
    /// # Example
    ///
    /// ```rust
    /// use carrot_cake_channel_pool::amqp::configuration::RabbitMqSettings;
    /// use carrot_cake_channel_pool::amqp::ConnectionFactory;
    /// use carrot_cake_channel_pool::pool::ChannelPool;
    ///
    /// async fn get_pool() -> anyhow::Result<ChannelPool> {
    ///     let settings = RabbitMqSettings::default();
    ///     let pool = ChannelPool::builder(ConnectionFactory::new_from_config(&settings)?)
    ///         .capacity(16)
    ///         .build()
    ///         .await?;
    ///     Ok(pool)
    /// }
    /// ```
    pub fn builder(connector: F) -> ChannelPoolBuilder<F> {
        ChannelPoolBuilder::new(connector)
    }

    /// Connect to the broker and open `settings.capacity` channels.
    ///
    /// Fails with [`Error::Connection`] if the broker cannot be reached and with
    /// [`Error::Broker`] if any of the channels cannot be opened: there is no such thing as a
    /// partially built pool.
    #[tracing::instrument(name = "channel_pool_new", skip_all, fields(capacity = settings.capacity))]
    pub async fn new(connector: F, settings: PoolSettings) -> Result<Self, Error> {
        let capacity = settings.capacity;
        if capacity == 0 {
            return Err(Error::InvalidCapacity);
        }

        let generation = 1;
        let (close_signal, close_notifications) = mpsc::unbounded_channel();
        let connection = connector.connect().await.map_err(Error::Connection)?;
        // Anything that happens to the connection from now on is picked up by the watchdog.
        connection.on_close(CloseNotifier::new(generation, close_signal.clone()));
        let channels =
            match try_join_all((0..capacity).map(|_| connection.open_channel())).await {
                Ok(channels) => channels,
                Err(e) => {
                    if let Err(close_error) = connection.close().await {
                        warn!(error = ?close_error, "Failed to close the connection of a pool that could not be built");
                    }
                    return Err(Error::Broker(e));
                }
            };

        let available: BTreeMap<_, _> = (1..)
            .map(ChannelId::new)
            .zip(channels)
            .map(|(id, channel)| (id, Arc::new(Slot::new(id, channel))))
            .collect();

        let (health, _) = watch::channel(ConnectionHealth::Connected);
        let shared = Arc::new(Shared {
            connector,
            capacity,
            reconnect: settings.reconnect,
            state: Mutex::new(PoolState {
                connection: Arc::new(connection),
                generation,
                next_id: capacity as u64 + 1,
                in_use: BTreeMap::new(),
                available,
                closed: false,
            }),
            health,
            next_generation: AtomicU64::new(generation + 1),
            close_signal,
        });

        let (release_signal, releases) = mpsc::unbounded_channel();
        let (shutdown, shutdown_signal) = watch::channel(false);
        let tasks = vec![
            tokio::spawn(watch_connection(
                Arc::clone(&shared),
                close_notifications,
                shutdown_signal.clone(),
            )),
            tokio::spawn(listen_for_releases(
                Arc::clone(&shared),
                releases,
                shutdown_signal,
            )),
        ];

        Ok(Self {
            inner: Arc::new(Inner {
                shared,
                release_signal,
                shutdown,
                tasks: std::sync::Mutex::new(tasks),
            }),
        })
    }

    /// The maximum number of channels this pool keeps open.
    pub fn capacity(&self) -> usize {
        self.inner.shared.capacity
    }

    /// Get a channel from the pool.
    ///
    /// An available channel is preferred; if there is none, a new channel is opened as long as
    /// the pool holds fewer than `capacity` channels. Otherwise it fails right away with
    /// [`Error::AllChannelsInUse`]: `get` never waits for a channel to be released.
    pub async fn get(&self) -> Result<ReusableChannel<ChannelOf<F>>, Error> {
        let mut state = self.inner.shared.state.lock().await;
        if state.closed {
            return Err(Error::PoolClosed);
        }

        if state.available.is_empty() {
            state.reclaim_released();
        }

        let slot = if let Some((_, slot)) = state.available.pop_first() {
            slot
        } else if state.len() < self.capacity() {
            let channel = state
                .connection
                .open_channel()
                .await
                .map_err(Error::Broker)?;
            let id = state.allocate_id();
            debug!(channel_id = %id, "Opened a new channel");
            Arc::new(Slot::new(id, channel))
        } else {
            return Err(Error::AllChannelsInUse);
        };

        let lease = slot.check_out();
        state.in_use.insert(slot.id(), Arc::clone(&slot));
        Ok(ReusableChannel::new(
            slot,
            lease,
            self.inner.release_signal.clone(),
        ))
    }

    /// Close the channel with the given id and remove it from the pool.
    ///
    /// Only released channels can be closed: if the channel is checked out, release it first.
    /// Fails with [`Error::ChannelNotFound`] otherwise. Once closed, the id is never handed out
    /// again. If the broker refuses to close the channel, it stays in the pool.
    pub async fn close_channel(&self, id: ChannelId) -> Result<(), Error> {
        let mut state = self.inner.shared.state.lock().await;
        if state.closed {
            return Err(Error::PoolClosed);
        }
        state.reclaim_released();

        let slot = state
            .available
            .get(&id)
            .cloned()
            .ok_or(Error::ChannelNotFound(id))?;
        slot.channel().close().await.map_err(Error::Broker)?;
        state.available.remove(&id);
        info!(channel_id = %id, "Closed pooled channel");
        Ok(())
    }

    /// Close the connection with the broker and stop the background tasks.
    ///
    /// Channels still checked out are not closed one by one, they go away with the connection;
    /// releasing them afterwards is harmless. Closing twice is a no-op.
    pub async fn close(&self) -> Result<(), Error> {
        {
            let mut state = self.inner.shared.state.lock().await;
            if state.closed {
                return Ok(());
            }
            state.closed = true;
        }

        // Stop the watchdog first, so that closing the connection is not mistaken for a failure.
        self.inner.shutdown.send_replace(true);
        let tasks = std::mem::take(
            &mut *self
                .inner
                .tasks
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = ?e, "Channel pool background task did not shut down cleanly");
            }
        }
        self.inner
            .shared
            .health
            .send_replace(ConnectionHealth::Closed);

        let connection = Arc::clone(&self.inner.shared.state.lock().await.connection);
        connection.close().await.map_err(Error::Broker)?;
        info!("Channel pool closed");
        Ok(())
    }

    /// How many channels are available and in use right now.
    pub async fn status(&self) -> PoolStatus {
        let mut state = self.inner.shared.state.lock().await;
        state.reclaim_released();
        PoolStatus {
            capacity: self.capacity(),
            available: state.available.len(),
            in_use: state.in_use.len(),
        }
    }

    /// The current state of the connection with the broker.
    pub fn health(&self) -> ConnectionHealth {
        *self.inner.shared.health.borrow()
    }

    /// Subscribe to changes of the connection state.
    pub fn health_watch(&self) -> watch::Receiver<ConnectionHealth> {
        self.inner.shared.health.subscribe()
    }
}

impl<F: Connector> Shared<F> {
    /// Move a released channel from the in-use set back to the available set, unless `get` or
    /// `status` already did.
    async fn check_in(&self, id: ChannelId) {
        let mut state = self.state.lock().await;
        match state.in_use.remove(&id) {
            Some(slot) if slot.is_released() => {
                state.available.insert(id, slot);
                debug!(channel_id = %id, "Channel is available again");
            }
            // Reclaimed by `get` and handed out again before the notification got here.
            Some(slot) => {
                debug!(channel_id = %id, "Ignoring release notification, the channel was checked out again");
                state.in_use.insert(id, slot);
            }
            // Already available or closed.
            None => debug!(channel_id = %id, "Ignoring duplicate release notification"),
        }
    }

    pub(super) async fn generation(&self) -> u64 {
        self.state.lock().await.generation
    }
}

/// Consume release notifications until the pool shuts down.
///
/// This is the only place where channels move from in-use to available.
async fn listen_for_releases<F: Connector>(
    shared: Arc<Shared<F>>,
    mut releases: UnboundedReceiver<ChannelId>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("Start listening for released channels");
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            released = releases.recv() => match released {
                Some(id) => shared.check_in(id).await,
                None => break,
            },
        }
    }

    releases.close();
    while let Ok(id) = releases.try_recv() {
        debug!(channel_id = %id, "Dropping release notification, the pool is shutting down");
    }
    info!("Stop listening for released channels");
}

/// A builder for [`ChannelPool`].
///
/// Use [`ChannelPool::builder`] as entrypoint.
pub struct ChannelPoolBuilder<F> {
    connector: F,
    settings: PoolSettings,
}

impl<F: Connector> ChannelPoolBuilder<F> {
    fn new(connector: F) -> Self {
        Self {
            connector,
            settings: PoolSettings::default(),
        }
    }

    /// The maximum number of channels the pool keeps open.
    /// Defaults to 10 if left unspecified.
    #[must_use]
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.settings.capacity = capacity;
        self
    }

    /// How to back off between reconnection attempts.
    #[must_use]
    pub fn reconnect(mut self, reconnect: ReconnectSettings) -> Self {
        self.settings.reconnect = reconnect;
        self
    }

    /// Replace all the settings at once.
    #[must_use]
    pub fn settings(mut self, settings: PoolSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Connect to the broker and get an instance of [`ChannelPool`].
    pub async fn build(self) -> Result<ChannelPool<F>, Error> {
        ChannelPool::new(self.connector, self.settings).await
    }
}
