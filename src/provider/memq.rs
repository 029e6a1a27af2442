use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use log::debug;

use super::inbox::Inbox;
use super::{lock, Provider, ProviderContext};
use crate::clock::Clock;
use crate::notifier::Readiness;
use crate::{Error, Message, Result};

/// One in-process bus. Every message sent on it is offered to the inbox of
/// every provider attached to it; each inbox keeps only the channels its
/// broker subscribes to.
#[derive(Default)]
pub struct MemQueue {
    inboxes: Mutex<Vec<Weak<Inbox>>>,
}

impl MemQueue {
    fn attach(&self, inbox: &Arc<Inbox>) -> Result<()> {
        let mut inboxes = lock(&self.inboxes)?;
        inboxes.retain(|i| i.strong_count() > 0);
        inboxes.push(Arc::downgrade(inbox));
        Ok(())
    }

    fn deliver(&self, message: &Message) -> Result<()> {
        let live: Vec<Arc<Inbox>> = {
            let mut inboxes = lock(&self.inboxes)?;
            inboxes.retain(|i| i.strong_count() > 0);
            inboxes.iter().filter_map(Weak::upgrade).collect()
        };
        for inbox in live {
            inbox.push(message.clone())?;
        }
        Ok(())
    }

    /// Providers currently attached.
    pub fn attached(&self) -> Result<usize> {
        Ok(lock(&self.inboxes)?
            .iter()
            .filter(|i| i.strong_count() > 0)
            .count())
    }
}

/// Explicit owner of the in-process buses.
///
/// Brokers opened against the same registry and key observe one shared
/// bus. Cloning the registry shares it; a bus lives until it is removed or
/// the last clone of the registry and every provider using it are dropped.
#[derive(Clone, Default)]
pub struct MemQueueRegistry {
    buses: Arc<Mutex<HashMap<String, Arc<MemQueue>>>>,
}

impl MemQueueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the bus for `key`, creating it on first use.
    pub fn bus(&self, key: &str) -> Result<Arc<MemQueue>> {
        let mut buses = lock(&self.buses)?;
        if let Some(bus) = buses.get(key) {
            return Ok(Arc::clone(bus));
        }
        let bus = Arc::new(MemQueue::default());
        buses.insert(key.to_string(), Arc::clone(&bus));
        debug!("memq: created bus {key:?}");
        Ok(bus)
    }

    /// Detaches the bus for `key`. Providers already attached keep using it;
    /// later lookups create a fresh, empty bus.
    pub fn remove(&self, key: &str) -> Result<bool> {
        Ok(lock(&self.buses)?.remove(key).is_some())
    }

    pub fn len(&self) -> Result<usize> {
        Ok(lock(&self.buses)?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

pub struct MemQueueProvider {
    bus: Arc<MemQueue>,
    inbox: Arc<Inbox>,
    clock: Arc<dyn Clock>,
}

impl MemQueueProvider {
    pub fn open(key: &str, context: &ProviderContext) -> Result<Self> {
        let bus = context.registry.bus(key)?;
        let inbox = Arc::new(Inbox::new(context.filter.clone(), None)?);
        bus.attach(&inbox)?;
        Ok(Self {
            bus,
            inbox,
            clock: Arc::clone(&context.clock),
        })
    }
}

impl Provider for MemQueueProvider {
    fn send(&self, channel: &str, payload: &[u8]) -> Result<()> {
        if self.inbox.is_closed() {
            return Err(Error::Closed);
        }
        self.bus
            .deliver(&Message::new(channel, payload, self.clock.now_us()))
    }

    fn receive(&self, deadline: Option<Instant>) -> Result<Option<Message>> {
        self.inbox.receive(deadline)
    }

    fn readiness_handle(&self) -> &Readiness {
        self.inbox.readiness()
    }

    fn filter_changed(&self) -> Result<()> {
        self.inbox.retain_wanted()
    }

    fn close(&self) {
        self.inbox.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::matcher::{ChannelFilter, ChannelMatcher};
    use std::time::Duration;

    fn provider(registry: &MemQueueRegistry, key: &str) -> MemQueueProvider {
        let context = ProviderContext {
            registry: registry.clone(),
            clock: Arc::new(SystemClock),
            filter: ChannelFilter::accept_all(),
        };
        MemQueueProvider::open(key, &context).unwrap()
    }

    #[test]
    fn same_key_shares_one_bus() {
        let registry = MemQueueRegistry::new();
        let producer = provider(&registry, "pair");
        let consumer = provider(&registry, "pair");
        let stranger = provider(&registry, "other");

        producer.send("CHAN", b"hello").unwrap();
        assert!(stranger.receive(Some(Instant::now())).unwrap().is_none());

        let message = consumer.receive(Some(Instant::now())).unwrap().unwrap();
        assert_eq!(message.channel, "CHAN");
        assert_eq!(message.payload, b"hello");
        assert_eq!(registry.len().unwrap(), 2);
        assert_eq!(registry.bus("pair").unwrap().attached().unwrap(), 2);
    }

    #[test]
    fn readiness_follows_queue_contents() {
        let registry = MemQueueRegistry::new();
        let p = provider(&registry, "");
        let ready = p.readiness_handle();
        assert!(!ready.wait(Some(Duration::ZERO)).unwrap());

        p.send("A", b"1").unwrap();
        p.send("A", b"2").unwrap();
        assert!(ready.wait(Some(Duration::ZERO)).unwrap());

        p.receive(None).unwrap().unwrap();
        assert!(ready.wait(Some(Duration::ZERO)).unwrap());
        p.receive(None).unwrap().unwrap();
        assert!(!ready.wait(Some(Duration::ZERO)).unwrap());
    }

    #[test]
    fn unsubscribed_traffic_is_not_queued() {
        let filter = ChannelFilter::new();
        let context = ProviderContext {
            filter: filter.clone(),
            ..ProviderContext::default()
        };
        let p = MemQueueProvider::open("", &context).unwrap();

        p.send("NOBODY", b"x").unwrap();
        assert!(!p.readiness_handle().wait(Some(Duration::ZERO)).unwrap());
        assert!(p.receive(Some(Instant::now())).unwrap().is_none());

        filter.insert(1, ChannelMatcher::new("A").unwrap());
        p.send("A", b"y").unwrap();
        assert!(p.readiness_handle().wait(Some(Duration::ZERO)).unwrap());
        filter.remove(1);
        p.filter_changed().unwrap();
        assert!(!p.readiness_handle().is_raised());
    }

    #[test]
    fn deadline_elapses_without_message() {
        let registry = MemQueueRegistry::new();
        let p = provider(&registry, "");
        let start = Instant::now();
        let got = p
            .receive(Some(start + Duration::from_millis(20)))
            .unwrap();
        assert!(got.is_none());
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn close_wakes_blocked_receiver() {
        let registry = MemQueueRegistry::new();
        let p = Arc::new(provider(&registry, ""));
        let waiter = Arc::clone(&p);
        let handle = std::thread::spawn(move || waiter.receive(None));

        std::thread::sleep(Duration::from_millis(20));
        p.close();
        assert!(matches!(handle.join().unwrap(), Err(Error::Closed)));
        assert!(matches!(p.send("A", b""), Err(Error::Closed)));
    }

    #[test]
    fn removed_bus_is_replaced() {
        let registry = MemQueueRegistry::new();
        let old = provider(&registry, "k");
        let old_peer = provider(&registry, "k");
        old.send("A", b"stale").unwrap();
        assert!(registry.remove("k").unwrap());

        let fresh = provider(&registry, "k");
        assert!(fresh.receive(Some(Instant::now())).unwrap().is_none());
        assert!(old_peer.receive(Some(Instant::now())).unwrap().is_some());
    }
}
