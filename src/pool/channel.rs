use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::mpsc::UnboundedSender;

use super::Error;

/// Identifies a channel within a [`ChannelPool`](super::ChannelPool).
///
/// Ids start from 1 and are never reused by the same pool, even after the channel they
/// pointed at has been closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChannelId(u64);

impl ChannelId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<u64> for ChannelId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// The pool-side half of a channel: the broker channel plus its checkout state.
///
/// The lease counter is even while the slot sits in the pool and odd while a caller holds it.
/// Every checkout and every release bumps it by one, so a [`ReusableChannel`] can tell whether
/// the lease it was given is still the current one.
pub(crate) struct Slot<C> {
    id: ChannelId,
    lease: AtomicU64,
    channel: RwLock<Arc<C>>,
}

impl<C> Slot<C> {
    pub(crate) fn new(id: ChannelId, channel: C) -> Self {
        Self {
            id,
            lease: AtomicU64::new(0),
            channel: RwLock::new(Arc::new(channel)),
        }
    }

    pub(crate) fn id(&self) -> ChannelId {
        self.id
    }

    pub(crate) fn is_released(&self) -> bool {
        self.lease.load(Ordering::Acquire) % 2 == 0
    }

    /// Hand the slot out, returning the lease the caller is going to hold.
    ///
    /// Must only be called on a released slot, under the pool state lock.
    pub(crate) fn check_out(&self) -> u64 {
        let lease = self.lease.fetch_add(1, Ordering::AcqRel) + 1;
        debug_assert!(lease % 2 == 1, "checked out a slot that was not released");
        lease
    }

    /// Give `lease` back. Returns `false` if `lease` was not the current one,
    /// i.e. the channel had already been released.
    fn check_in(&self, lease: u64) -> bool {
        self.lease
            .compare_exchange(lease, lease + 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn holds_lease(&self, lease: u64) -> bool {
        self.lease.load(Ordering::Acquire) == lease
    }

    pub(crate) fn channel(&self) -> Arc<C> {
        Arc::clone(&self.channel.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Swap in a channel opened on a new connection, returning the old one.
    pub(crate) fn rebind(&self, channel: C) -> Arc<C> {
        let mut current = self.channel.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *current, Arc::new(channel))
    }
}

/// A channel borrowed from a [`ChannelPool`](super::ChannelPool).
///
/// Every operation is forwarded to the underlying channel as long as the handle has not been
/// released. Once [`ReusableChannel::release`] has been called, or the handle has been dropped,
/// the channel goes back to the pool and any further operation through this handle fails with
/// [`Error::UseReleasedChannel`] without reaching the broker.
///
/// The broker channel survives reconnections: if the connection is re-established while you are
/// holding a `ReusableChannel`, the handle transparently forwards to a channel opened on the new
/// connection.
pub struct ReusableChannel<C> {
    slot: Arc<Slot<C>>,
    lease: u64,
    release_signal: UnboundedSender<ChannelId>,
}

impl<C> ReusableChannel<C> {
    pub(crate) fn new(
        slot: Arc<Slot<C>>,
        lease: u64,
        release_signal: UnboundedSender<ChannelId>,
    ) -> Self {
        Self {
            slot,
            lease,
            release_signal,
        }
    }

    /// The id of the channel within its pool.
    pub fn id(&self) -> ChannelId {
        self.slot.id()
    }

    /// Whether this handle has been released back to the pool.
    pub fn is_released(&self) -> bool {
        !self.slot.holds_lease(self.lease)
    }

    /// Give the channel back to the pool.
    ///
    /// Releasing an already released handle does nothing.
    /// This never blocks, not even if the pool has been closed in the meantime.
    pub fn release(&self) {
        if !self.slot.check_in(self.lease) {
            return;
        }
        let id = self.id();
        if self.release_signal.send(id).is_err() {
            tracing::debug!(channel_id = %id, "Channel released after the pool was closed");
        } else {
            tracing::debug!(channel_id = %id, "Channel released");
        }
    }

    /// Run `operation` against the underlying channel.
    ///
    /// Fails with [`Error::UseReleasedChannel`], without calling `operation`, if the handle has
    /// been released. The channel is only lent for the duration of the call.
    pub fn with_channel<R>(&self, operation: impl FnOnce(&C) -> R) -> Result<R, Error> {
        let channel = self.channel()?;
        Ok(operation(&channel))
    }

    /// The underlying channel, for forwarded operations that need to hold it across an await.
    pub(crate) fn channel(&self) -> Result<Arc<C>, Error> {
        if self.is_released() {
            return Err(Error::UseReleasedChannel(self.id()));
        }
        Ok(self.slot.channel())
    }
}

impl<C> Drop for ReusableChannel<C> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<C> fmt::Debug for ReusableChannel<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReusableChannel")
            .field("id", &self.id())
            .field("released", &self.is_released())
            .finish()
    }
}
