//! An in-memory broker implementing the pool collaborator traits, with knobs to break it.
use carrot_cake_channel_pool::broker::{
    BrokerChannel, BrokerConnection, CloseNotifier, Connector,
};
use carrot_cake_channel_pool::pool::{
    ChannelPool, ConnectionHealth, PoolSettings, ReconnectSettings, ReusableChannel,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<BrokerState>,
}

#[derive(Default)]
struct BrokerState {
    refuse_connections: AtomicBool,
    fail_channel_opens: AtomicBool,
    fail_channel_closes: AtomicBool,
    drop_after_next_channel_open: AtomicBool,
    dial_attempts: AtomicUsize,
    connections: Mutex<Vec<Arc<ConnectionState>>>,
}

pub struct ConnectionState {
    number: usize,
    open: AtomicBool,
    channels: Mutex<Vec<Arc<ChannelState>>>,
    notifier: Mutex<Option<CloseNotifier>>,
}

#[derive(Default)]
struct ChannelState {
    closed: AtomicBool,
    published: AtomicUsize,
}

pub struct InMemoryConnection {
    state: Arc<ConnectionState>,
    broker: Arc<BrokerState>,
}

pub struct InMemoryChannel {
    connection: Arc<ConnectionState>,
    state: Arc<ChannelState>,
    broker: Arc<BrokerState>,
}

impl InMemoryBroker {
    pub fn refuse_connections(&self, refuse: bool) {
        self.state.refuse_connections.store(refuse, Ordering::SeqCst);
    }

    pub fn fail_channel_opens(&self, fail: bool) {
        self.state.fail_channel_opens.store(fail, Ordering::SeqCst);
    }

    pub fn fail_channel_closes(&self, fail: bool) {
        self.state.fail_channel_closes.store(fail, Ordering::SeqCst);
    }

    /// The next successful channel open kills the connection it was opened on right after.
    pub fn drop_connection_after_next_channel_open(&self) {
        self.state
            .drop_after_next_channel_open
            .store(true, Ordering::SeqCst);
    }

    /// Every call to `connect`, successful or not.
    pub fn dial_attempts(&self) -> usize {
        self.state.dial_attempts.load(Ordering::SeqCst)
    }

    /// Connections successfully established so far.
    pub fn connections(&self) -> usize {
        self.state.connections.lock().unwrap().len()
    }

    pub fn connection(&self, number: usize) -> Arc<ConnectionState> {
        Arc::clone(&self.state.connections.lock().unwrap()[number - 1])
    }

    /// Drop the most recent connection, as a broker restart would.
    pub fn kill_latest_connection(&self, reason: &str) {
        let latest = self.connections();
        self.kill_connection(latest, reason);
    }

    pub fn kill_connection(&self, number: usize, reason: &str) {
        let connection = self.connection(number);
        connection.open.store(false, Ordering::SeqCst);
        connection.notify_closed(reason);
    }
}

impl ConnectionState {
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub fn channels_opened(&self) -> usize {
        self.channels.lock().unwrap().len()
    }

    pub fn channels_closed(&self) -> usize {
        self.channels
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.closed.load(Ordering::SeqCst))
            .count()
    }

    /// Messages published across every channel of this connection.
    pub fn published(&self) -> usize {
        self.channels
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.published.load(Ordering::SeqCst))
            .sum()
    }

    /// Fire the close notification without touching the connection state.
    pub fn notify_closed(&self, reason: &str) {
        if let Some(notifier) = self.notifier.lock().unwrap().as_ref() {
            notifier.notify(reason);
        }
    }
}

impl InMemoryChannel {
    pub fn publish(&self) -> Result<(), anyhow::Error> {
        if !self.connection.is_open() {
            anyhow::bail!("connection {} is closed", self.connection.number);
        }
        if self.state.closed.load(Ordering::SeqCst) {
            anyhow::bail!("channel is closed");
        }
        self.state.published.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    pub fn connection_number(&self) -> usize {
        self.connection.number
    }
}

#[async_trait::async_trait]
impl Connector for InMemoryBroker {
    type Connection = InMemoryConnection;

    async fn connect(&self) -> Result<InMemoryConnection, anyhow::Error> {
        self.state.dial_attempts.fetch_add(1, Ordering::SeqCst);
        if self.state.refuse_connections.load(Ordering::SeqCst) {
            anyhow::bail!("connection refused");
        }
        let mut connections = self.state.connections.lock().unwrap();
        let connection = Arc::new(ConnectionState {
            number: connections.len() + 1,
            open: AtomicBool::new(true),
            channels: Mutex::new(Vec::new()),
            notifier: Mutex::new(None),
        });
        connections.push(Arc::clone(&connection));
        Ok(InMemoryConnection {
            state: connection,
            broker: Arc::clone(&self.state),
        })
    }
}

#[async_trait::async_trait]
impl BrokerConnection for InMemoryConnection {
    type Channel = InMemoryChannel;

    async fn open_channel(&self) -> Result<InMemoryChannel, anyhow::Error> {
        if !self.state.is_open() {
            anyhow::bail!("connection {} is closed", self.state.number);
        }
        if self.broker.fail_channel_opens.load(Ordering::SeqCst) {
            anyhow::bail!("channel limit reached");
        }
        let channel = Arc::new(ChannelState::default());
        self.state.channels.lock().unwrap().push(Arc::clone(&channel));
        if self
            .broker
            .drop_after_next_channel_open
            .swap(false, Ordering::SeqCst)
        {
            self.state.open.store(false, Ordering::SeqCst);
            self.state.notify_closed("connection dropped while setting up");
        }
        Ok(InMemoryChannel {
            connection: Arc::clone(&self.state),
            state: channel,
            broker: Arc::clone(&self.broker),
        })
    }

    async fn close(&self) -> Result<(), anyhow::Error> {
        self.state.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn on_close(&self, notifier: CloseNotifier) {
        *self.state.notifier.lock().unwrap() = Some(notifier);
    }
}

#[async_trait::async_trait]
impl BrokerChannel for InMemoryChannel {
    async fn close(&self) -> Result<(), anyhow::Error> {
        if self.broker.fail_channel_closes.load(Ordering::SeqCst) {
            anyhow::bail!("channel close timed out");
        }
        self.state.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Publish through a pooled channel, as long as the handle has not been released.
pub fn publish(handle: &ReusableChannel<InMemoryChannel>) -> Result<(), anyhow::Error> {
    handle.with_channel(InMemoryChannel::publish)?
}

/// The number of the connection the pooled channel is currently bound to.
pub fn connection_number(handle: &ReusableChannel<InMemoryChannel>) -> usize {
    handle
        .with_channel(InMemoryChannel::connection_number)
        .expect("The channel has been released")
}

/// Retry quickly, tests should not wait for seconds.
pub fn fast_reconnect() -> ReconnectSettings {
    ReconnectSettings {
        initial_interval_ms: 1,
        max_interval_ms: 5,
        multiplier: 2.0,
        max_elapsed_seconds: None,
    }
}

pub async fn get_pool(capacity: usize) -> (ChannelPool<InMemoryBroker>, InMemoryBroker) {
    let broker = InMemoryBroker::default();
    let pool = ChannelPool::new(
        broker.clone(),
        PoolSettings {
            capacity,
            reconnect: fast_reconnect(),
        },
    )
    .await
    .expect("Failed to build the channel pool");
    (pool, broker)
}

/// Poll `condition` until it holds, failing the test after a few seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("Condition was not met in time");
}

/// Wait for the release listener to move released channels back to the available set.
pub async fn wait_for_available(pool: &ChannelPool<InMemoryBroker>, available: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while pool.status().await.available != available {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("Channels were not released in time");
}

pub async fn wait_for_health(pool: &ChannelPool<InMemoryBroker>, expected: ConnectionHealth) {
    let mut health = pool.health_watch();
    tokio::time::timeout(Duration::from_secs(5), async {
        while *health.borrow_and_update() != expected {
            health
                .changed()
                .await
                .expect("The pool stopped reporting its health");
        }
    })
    .await
    .expect("The pool did not reach the expected health in time");
}
