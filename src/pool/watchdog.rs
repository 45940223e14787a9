//! Keeps the pool connected: when the broker drops the connection, dial again and move every
//! channel over to the new connection.
use anyhow::Context;
use backoff::backoff::Backoff;
use futures_util::future::try_join_all;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerConnection, CloseNotifier, ConnectionClosed, Connector};

use super::channel_pool::Shared;

/// The state of the connection between a [`ChannelPool`](super::ChannelPool) and the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionHealth {
    /// The connection is up.
    Connected,
    /// The connection was lost, the pool is trying to re-establish it.
    Reconnecting,
    /// Reconnection was given up after exhausting the configured backoff.
    /// Channels handed out by the pool will fail until the pool is rebuilt.
    Failed,
    /// The pool has been closed.
    Closed,
}

/// Wait for connection-closed notifications and reconnect, until the pool shuts down.
///
/// Notifications coming from a connection that has already been replaced are ignored.
pub(super) async fn watch_connection<F: Connector>(
    shared: Arc<Shared<F>>,
    mut closed: UnboundedReceiver<ConnectionClosed>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("Start watching the connection with the broker");
    loop {
        let event = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            event = closed.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        let current = shared.generation().await;
        if event.generation != current {
            debug!(
                generation = event.generation,
                current, "Ignoring close notification from a replaced connection"
            );
            continue;
        }

        warn!(
            generation = event.generation,
            server = event.reason.server,
            code = ?event.reason.code,
            reason = %event.reason.text,
            "Connection with the broker was closed, trying to reconnect"
        );
        shared.health.send_replace(ConnectionHealth::Reconnecting);

        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            outcome = shared.reconnect() => match outcome {
                Ok(generation) => {
                    info!(generation, "Reconnected to the broker");
                    shared.health.send_replace(ConnectionHealth::Connected);
                }
                Err(e) => {
                    error!(error = ?e, "Giving up on reconnecting to the broker");
                    shared.health.send_replace(ConnectionHealth::Failed);
                }
            },
        }
    }
    info!("Stop watching the connection with the broker");
}

impl<F: Connector> Shared<F> {
    /// Retry [`Shared::try_reconnect`] following the configured backoff.
    ///
    /// Returns the generation of the new connection.
    async fn reconnect(&self) -> Result<u64, anyhow::Error> {
        let mut backoff = self.reconnect.build();
        loop {
            let error = match self.try_reconnect().await {
                Ok(generation) => return Ok(generation),
                Err(e) => e,
            };
            match backoff.next_backoff() {
                Some(delay) => {
                    warn!(
                        error = ?error,
                        retry_in = ?delay,
                        "Reconnecting to the broker failed, retrying after backoff"
                    );
                    tokio::time::sleep(delay).await;
                }
                None => return Err(error.context("Reconnection backoff elapsed")),
            }
        }
    }

    /// Dial the broker and re-open every live channel on the new connection.
    ///
    /// Channels keep their id and lease, so handles held by callers stay valid and the
    /// in-use/available bookkeeping is untouched. The swap happens under the pool lock: nobody
    /// can open a channel against a connection that is being replaced.
    ///
    /// Every dialed connection gets a generation of its own, even if the attempt fails, so a
    /// late notification from a discarded connection never matches the live one.
    async fn try_reconnect(&self) -> Result<u64, anyhow::Error> {
        let connection = self
            .connector
            .connect()
            .await
            .context("Failed to dial the broker")?;
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        connection.on_close(CloseNotifier::new(generation, self.close_signal.clone()));

        let mut state = self.state.lock().await;
        let slots = state.slots();
        let channels =
            match try_join_all(slots.iter().map(|_| connection.open_channel())).await {
                Ok(channels) => channels,
                Err(e) => {
                    drop(state);
                    if let Err(close_error) = connection.close().await {
                        debug!(error = ?close_error, "Failed to close a half-recovered connection");
                    }
                    return Err(e.context("Failed to re-open the pooled channels"));
                }
            };

        for (slot, channel) in slots.iter().zip(channels) {
            // The previous channel died with its connection.
            drop(slot.rebind(channel));
        }
        state.generation = generation;
        state.connection = Arc::new(connection);
        Ok(generation)
    }
}
