//! Transport providers.
//!
//! Every provider implements the same small contract: send a channel-tagged
//! payload, receive the next message with an optional deadline, expose a
//! readiness descriptor, and release its resources on close.
//!
//! Receiving providers consult the [`ChannelFilter`] in their
//! [`ProviderContext`] and drop traffic on channels the broker does not
//! subscribe to, so neither `receive` nor readiness ever reports it.
//!
//! | scheme | provider | transport |
//! |--------|----------|-----------|
//! | `memq` | [`MemQueueProvider`] | in-process FIFO shared through a [`MemQueueRegistry`] |
//! | `udpm` | [`MulticastProvider`] | UDP multicast with fragmentation |
//! | `file` | [`FileProvider`] | event log record/replay |

pub mod file;
mod inbox;
pub mod memq;
pub mod udpm;

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Instant;

use crate::clock::{Clock, SystemClock};
use crate::config::ProviderConfig;
use crate::matcher::ChannelFilter;
use crate::notifier::Readiness;
use crate::{Error, Message, Result};

pub use file::FileProvider;
pub use memq::{MemQueueProvider, MemQueueRegistry};
pub use udpm::MulticastProvider;

pub trait Provider: Send + Sync {
    fn send(&self, channel: &str, payload: &[u8]) -> Result<()>;

    /// Waits for the next message until `deadline` (forever when `None`).
    /// `Ok(None)` means the deadline passed with nothing to deliver.
    fn receive(&self, deadline: Option<Instant>) -> Result<Option<Message>>;

    /// Readable exactly when a zero-deadline `receive` would return a
    /// message.
    fn readiness_handle(&self) -> &Readiness;

    /// Called after the filter changed. Drops pending traffic no longer
    /// wanted and brings readiness up to date.
    fn filter_changed(&self) -> Result<()>;

    /// Wakes blocked receivers with `Error::Closed` and fails later calls.
    fn close(&self);
}

/// Shared state handed to providers at construction.
#[derive(Clone)]
pub struct ProviderContext {
    pub registry: MemQueueRegistry,
    pub clock: Arc<dyn Clock>,
    pub filter: ChannelFilter,
}

impl Default for ProviderContext {
    fn default() -> Self {
        Self {
            registry: MemQueueRegistry::new(),
            clock: Arc::new(SystemClock),
            filter: ChannelFilter::accept_all(),
        }
    }
}

pub fn open(config: &ProviderConfig, context: &ProviderContext) -> Result<Box<dyn Provider>> {
    let provider: Box<dyn Provider> = match config {
        ProviderConfig::MemQueue(config) => {
            Box::new(MemQueueProvider::open(&config.key, context)?)
        }
        ProviderConfig::Multicast(config) => {
            Box::new(MulticastProvider::open(config.clone(), context)?)
        }
        ProviderConfig::File(config) => Box::new(FileProvider::open(config, context)?),
    };
    Ok(provider)
}

/// A poisoned lock means a thread panicked mid-update; the provider is no
/// longer usable.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex.lock().map_err(|_| Error::Closed)
}

/// Blocks on `condvar` until notified or `deadline`. The flag is `true` once
/// the deadline has already passed and nothing was waited for.
pub(crate) fn wait_until<'a, T>(
    condvar: &Condvar,
    guard: MutexGuard<'a, T>,
    deadline: Option<Instant>,
) -> Result<(MutexGuard<'a, T>, bool)> {
    match deadline {
        None => {
            let guard = condvar.wait(guard).map_err(|_| Error::Closed)?;
            Ok((guard, false))
        }
        Some(deadline) => {
            let now = Instant::now();
            if now >= deadline {
                return Ok((guard, true));
            }
            let (guard, _) = condvar
                .wait_timeout(guard, deadline - now)
                .map_err(|_| Error::Closed)?;
            Ok((guard, false))
        }
    }
}
