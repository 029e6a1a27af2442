//! Subscription routing and dispatch.
//!
//! A [`Broker`] owns one provider and a set of subscriptions. Publishing goes
//! straight to the provider and may run from any thread. Dispatching
//! (`handle`, `handle_timeout`) is exclusive: one call at a time receives
//! from the provider, routes each message into the queue of every
//! subscription whose pattern matches, and then runs the handlers on the
//! calling thread until every touched queue is empty.
//!
//! ```text
//!  publish ─► Provider::send
//!
//!  handle ─► [dispatch token] ─► Provider::receive ─► match patterns
//!                                                      │
//!                    ┌─────────────────────────────────┤
//!                    ▼                                 ▼
//!           SubscriptionQueue A               SubscriptionQueue B
//!                    │                                 │
//!                    ▼                                 ▼
//!               handler A(msg)                    handler B(msg)
//! ```
//!
//! # Example
//!
//! ```no_run
//! use chanbus::{Broker, MemQueueRegistry};
//!
//! let registry = MemQueueRegistry::new();
//! let broker = Broker::builder().url("memq://").registry(&registry).build()?;
//! let sub = broker.subscribe("POSE.*", |msg| {
//!     println!("{}: {} bytes", msg.channel, msg.payload.len());
//! })?;
//! sub.set_capacity(Some(30))?;
//!
//! broker.publish("POSE_FRONT", b"...")?;
//! broker.handle_timeout(100)?;
//! broker.unsubscribe(&sub)?;
//! # Ok::<(), chanbus::Error>(())
//! ```

use std::fmt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, trace, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::ProviderConfig;
use crate::matcher::{ChannelFilter, ChannelMatcher};
use crate::notifier::Readiness;
use crate::provider::{self, lock, MemQueueRegistry, Provider, ProviderContext};
use crate::queue::SubscriptionQueue;
use crate::{Error, Message, Result};

/// Most messages `handle_timeout` routes in one call before delivering, so a
/// fast producer cannot keep a dispatch from ever reaching its handlers.
pub const DISPATCH_BATCH_LIMIT: usize = 1024;

type Handler = Box<dyn FnMut(&Message) + Send>;

struct SubscriptionState {
    id: u64,
    matcher: ChannelMatcher,
    queue: Mutex<SubscriptionQueue>,
    handler: Mutex<Handler>,
    active: AtomicBool,
}

/// Handle on one registration. Cloning it refers to the same subscription.
#[derive(Clone)]
pub struct Subscription {
    state: Arc<SubscriptionState>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.state.id
    }

    pub fn pattern(&self) -> &str {
        self.state.matcher.pattern()
    }

    /// Bounds the queue of undelivered messages. `None` removes the bound.
    /// A full queue rejects new messages for this subscription only.
    ///
    /// # Errors
    ///
    /// - `Error::Closed`: the queue lock was poisoned by a panicking handler
    pub fn set_capacity(&self, capacity: Option<usize>) -> Result<()> {
        lock(&self.state.queue)?.set_capacity(capacity);
        Ok(())
    }

    pub fn capacity(&self) -> Option<usize> {
        self.state.queue.lock().ok().and_then(|q| q.capacity())
    }

    /// Messages routed here but not yet handed to the handler.
    pub fn queued(&self) -> usize {
        self.state.queue.lock().map(|q| q.len()).unwrap_or(0)
    }

    /// Messages rejected because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.state.queue.lock().map(|q| q.dropped()).unwrap_or(0)
    }

    pub fn is_active(&self) -> bool {
        self.state.active.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.state.id)
            .field("pattern", &self.pattern())
            .field("active", &self.is_active())
            .finish()
    }
}

pub struct BrokerBuilder {
    url: Option<String>,
    registry: Option<MemQueueRegistry>,
    clock: Arc<dyn Clock>,
    default_capacity: Option<usize>,
}

impl Default for BrokerBuilder {
    fn default() -> Self {
        Self {
            url: None,
            registry: None,
            clock: Arc::new(SystemClock),
            default_capacity: None,
        }
    }
}

impl BrokerBuilder {
    /// Provider URL. Without one, `CHANBUS_DEFAULT_URL` or the built-in
    /// default is used.
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Registry that `memq` URLs resolve their bus in. Without one the
    /// broker gets a private registry and shares its bus with nobody.
    pub fn registry(mut self, registry: &MemQueueRegistry) -> Self {
        self.registry = Some(registry.clone());
        self
    }

    pub fn clock(mut self, clock: impl Clock) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Capacity given to new subscriptions. Unbounded by default.
    pub fn default_capacity(mut self, capacity: Option<usize>) -> Self {
        self.default_capacity = capacity;
        self
    }

    pub fn build(self) -> Result<Broker> {
        let config = match &self.url {
            Some(url) => ProviderConfig::parse(url)?,
            None => ProviderConfig::from_env()?,
        };
        let filter = ChannelFilter::new();
        let context = ProviderContext {
            registry: self.registry.unwrap_or_default(),
            clock: self.clock,
            filter: filter.clone(),
        };
        let provider = provider::open(&config, &context)?;
        debug!("broker: opened {} provider", config.scheme());
        Ok(Broker::with_provider(provider, filter, self.default_capacity))
    }
}

pub struct Broker {
    provider: Box<dyn Provider>,
    /// Patterns of the live subscriptions, shared with the provider.
    filter: ChannelFilter,
    subscriptions: Mutex<Vec<Arc<SubscriptionState>>>,
    next_id: AtomicU64,
    default_capacity: Option<usize>,
    dispatching: AtomicBool,
    closed: AtomicBool,
}

/// Exclusive right to dispatch; released on drop, including on unwind out
/// of a handler.
struct DispatchToken<'a> {
    flag: &'a AtomicBool,
}

impl Drop for DispatchToken<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

impl Broker {
    pub fn builder() -> BrokerBuilder {
        BrokerBuilder::default()
    }

    pub fn open(url: &str) -> Result<Self> {
        Self::builder().url(url).build()
    }

    pub fn from_env() -> Result<Self> {
        Self::builder().build()
    }

    /// Wraps an already constructed provider. `filter` must be the one the
    /// provider was opened with; the broker keeps it in step with its
    /// subscriptions.
    pub fn with_provider(
        provider: Box<dyn Provider>,
        filter: ChannelFilter,
        default_capacity: Option<usize>,
    ) -> Self {
        Self {
            provider,
            filter,
            subscriptions: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            default_capacity,
            dispatching: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        Ok(())
    }

    /// Sends `payload` on `channel`. Provider errors are returned as is.
    pub fn publish(&self, channel: &str, payload: &[u8]) -> Result<()> {
        self.ensure_open()?;
        if channel.is_empty() {
            return Err(Error::invalid("channel must not be empty"));
        }
        self.provider.send(channel, payload)
    }

    /// Registers `handler` for every channel that `pattern` matches in full.
    pub fn subscribe<F>(&self, pattern: &str, handler: F) -> Result<Subscription>
    where
        F: FnMut(&Message) + Send + 'static,
    {
        self.ensure_open()?;
        let matcher = ChannelMatcher::new(pattern)?;
        let state = Arc::new(SubscriptionState {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            matcher: matcher.clone(),
            queue: Mutex::new(SubscriptionQueue::new(self.default_capacity)),
            handler: Mutex::new(Box::new(handler)),
            active: AtomicBool::new(true),
        });
        lock(&self.subscriptions)?.push(Arc::clone(&state));
        self.filter.insert(state.id, matcher);
        self.provider.filter_changed()?;
        debug!("broker: subscription {} on {pattern:?}", state.id);
        Ok(Subscription { state })
    }

    /// Removes a subscription and discards its undelivered messages.
    pub fn unsubscribe(&self, subscription: &Subscription) -> Result<()> {
        self.ensure_open()?;
        let removed = {
            let mut subs = lock(&self.subscriptions)?;
            let before = subs.len();
            subs.retain(|s| !Arc::ptr_eq(s, &subscription.state));
            before != subs.len()
        };
        if !removed {
            return Err(Error::invalid(format!(
                "subscription {} is not registered with this broker",
                subscription.id()
            )));
        }
        subscription.state.active.store(false, Ordering::Release);
        lock(&subscription.state.queue)?.clear();
        self.filter.remove(subscription.id());
        self.provider.filter_changed()?;
        debug!("broker: removed subscription {}", subscription.id());
        Ok(())
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().map(|s| s.len()).unwrap_or(0)
    }

    /// Blocks until one message arrives, routes it, and runs the handlers
    /// of every subscription it was queued for.
    ///
    /// # Errors
    ///
    /// - `Error::AlreadyBusy`: another dispatch is in progress
    /// - `Error::Closed`: the broker was closed, including while waiting
    /// - any provider receive error (`WriteOnlyViolation`, `EndOfLog`, ...)
    pub fn handle(&self) -> Result<()> {
        let _token = self.acquire()?;
        let mut touched = Vec::new();
        loop {
            let message = match self.provider.receive(None)? {
                Some(message) => message,
                None => continue,
            };
            if self.filter.wants(&message.channel) {
                self.route(message, &mut touched)?;
                break;
            }
            trace!("broker: no subscribers on {}, discarding", message.channel);
        }
        self.deliver(&touched)
    }

    /// Like [`Broker::handle`] but waits at most `timeout_ms` for a message
    /// that some subscription accepts. Messages nobody accepts are discarded
    /// and the wait goes on. After the first accepted message, everything
    /// the provider already holds is routed as well before the handlers run.
    ///
    /// Returns the number of received messages that were accepted by at
    /// least one subscription queue; 0 if the deadline passed first.
    ///
    /// A provider error after the first accepted message ends the batch.
    /// The routed messages are still delivered; then the error is returned,
    /// unless it is one the provider keeps reporting (`EndOfLog`, `Closed`,
    /// ...), which the next call returns instead.
    ///
    /// # Errors
    ///
    /// - `Error::InvalidArgument`: `timeout_ms` is negative
    /// - as [`Broker::handle`]
    pub fn handle_timeout(&self, timeout_ms: i64) -> Result<usize> {
        if timeout_ms < 0 {
            return Err(Error::invalid(format!("negative timeout {timeout_ms}ms")));
        }
        let _token = self.acquire()?;
        let deadline = Instant::now() + Duration::from_millis(timeout_ms as u64);

        let mut touched = Vec::new();
        let mut dispatched = 0;
        let mut discarded = 0;
        while dispatched == 0 {
            let message = match self.provider.receive(Some(deadline))? {
                Some(message) => message,
                None => return Ok(0),
            };
            if self.route(message, &mut touched)? {
                dispatched = 1;
            } else {
                discarded += 1;
                // A flood of rejected messages must not outlast the deadline.
                if discarded >= DISPATCH_BATCH_LIMIT && Instant::now() >= deadline {
                    return Ok(0);
                }
            }
        }

        let mut deferred = None;
        for _ in 1..DISPATCH_BATCH_LIMIT {
            match self.provider.receive(Some(Instant::now())) {
                Ok(Some(message)) => dispatched += usize::from(self.route(message, &mut touched)?),
                Ok(None) => break,
                Err(err) if is_sticky(&err) => {
                    trace!("broker: batch ended early: {err}");
                    break;
                }
                Err(err) => {
                    warn!("broker: receive failed mid-batch after {dispatched} messages: {err}");
                    deferred = Some(err);
                    break;
                }
            }
        }

        self.deliver(&touched)?;
        match deferred {
            Some(err) => Err(err),
            None => Ok(dispatched),
        }
    }

    /// Provider readiness: readable exactly when `handle_timeout(0)` would
    /// dispatch at least one message. Traffic on channels nobody subscribes
    /// to never makes it readable, nor does the end of a replayed log.
    pub fn readiness(&self) -> &Readiness {
        self.provider.readiness_handle()
    }

    /// Releases the provider. A dispatch blocked in `handle` wakes with
    /// `Error::Closed`; every later call fails the same way.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.provider.close();
        if let Ok(mut subs) = self.subscriptions.lock() {
            for sub in subs.drain(..) {
                sub.active.store(false, Ordering::Release);
            }
        }
        debug!("broker: closed");
    }

    fn acquire(&self) -> Result<DispatchToken<'_>> {
        self.ensure_open()?;
        if self
            .dispatching
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::AlreadyBusy);
        }
        Ok(DispatchToken {
            flag: &self.dispatching,
        })
    }

    /// Queues `message` on every matching subscription. Returns whether any
    /// queue accepted it.
    fn route(&self, message: Message, touched: &mut Vec<Arc<SubscriptionState>>) -> Result<bool> {
        let matching: Vec<Arc<SubscriptionState>> = lock(&self.subscriptions)?
            .iter()
            .filter(|s| s.matcher.matches(&message.channel))
            .cloned()
            .collect();
        if matching.is_empty() {
            trace!("broker: no subscribers on {}, discarding", message.channel);
            return Ok(false);
        }

        let mut accepted = false;
        for sub in matching {
            if lock(&sub.queue)?.push(message.clone()) {
                accepted = true;
                if !touched.iter().any(|t| Arc::ptr_eq(t, &sub)) {
                    touched.push(sub);
                }
            } else {
                debug!(
                    "broker: subscription {} queue full, dropping message on {}",
                    sub.id, message.channel
                );
            }
        }
        Ok(accepted)
    }

    fn deliver(&self, touched: &[Arc<SubscriptionState>]) -> Result<()> {
        for sub in touched {
            loop {
                if !sub.active.load(Ordering::Acquire) {
                    break;
                }
                // The queue lock is not held while the handler runs, so a
                // handler may unsubscribe or resize its own queue.
                let message = match lock(&sub.queue)?.pop() {
                    Some(message) => message,
                    None => break,
                };
                let mut handler = lock(&sub.handler)?;
                (*handler)(&message);
            }
        }
        Ok(())
    }
}

/// Errors a provider reports again on every receive once they occur.
fn is_sticky(err: &Error) -> bool {
    matches!(
        err,
        Error::EndOfLog | Error::Closed | Error::WriteOnlyViolation | Error::NetworkUnavailable(_)
    )
}

impl AsRawFd for Broker {
    fn as_raw_fd(&self) -> RawFd {
        self.readiness().as_raw_fd()
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        self.close();
    }
}
