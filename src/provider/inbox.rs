use std::collections::VecDeque;
use std::io::{self, ErrorKind};
use std::sync::{Condvar, Mutex};
use std::time::Instant;

use log::{trace, warn};

use super::{lock, wait_until};
use crate::matcher::ChannelFilter;
use crate::notifier::Readiness;
use crate::{Error, Message, Result};

/// Received messages waiting for the owning broker to dispatch them.
///
/// Only channels the filter wants are admitted, and readiness is raised
/// exactly while a wanted message is queued.
pub(crate) struct Inbox {
    state: Mutex<InboxState>,
    available: Condvar,
    readiness: Readiness,
    filter: ChannelFilter,
    limit: Option<usize>,
}

#[derive(Default)]
struct InboxState {
    messages: VecDeque<Message>,
    closed: bool,
    /// Set when the feeding transport died.
    failure: Option<(ErrorKind, String)>,
}

impl Inbox {
    pub(crate) fn new(filter: ChannelFilter, limit: Option<usize>) -> Result<Self> {
        Ok(Self {
            state: Mutex::new(InboxState::default()),
            available: Condvar::new(),
            readiness: Readiness::new()?,
            filter,
            limit,
        })
    }

    pub(crate) fn readiness(&self) -> &Readiness {
        &self.readiness
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().map(|s| s.closed).unwrap_or(true)
    }

    /// Queues `message` if its channel is wanted. Returns whether it was
    /// queued.
    pub(crate) fn push(&self, message: Message) -> Result<bool> {
        if !self.filter.wants(&message.channel) {
            trace!("inbox: no subscribers on {}, dropping", message.channel);
            return Ok(false);
        }
        let mut state = lock(&self.state)?;
        if state.closed {
            return Ok(false);
        }
        if self.limit.map_or(false, |limit| state.messages.len() >= limit) {
            warn!("inbox: full, dropping message on {}", message.channel);
            return Ok(false);
        }
        state.messages.push_back(message);
        self.readiness.raise()?;
        self.available.notify_all();
        Ok(true)
    }

    /// Records a transport failure; the next receive on an empty inbox
    /// reports it.
    pub(crate) fn fail(&self, err: &io::Error) {
        if let Ok(mut state) = self.state.lock() {
            state.failure = Some((err.kind(), err.to_string()));
        }
        self.available.notify_all();
    }

    pub(crate) fn receive(&self, deadline: Option<Instant>) -> Result<Option<Message>> {
        let mut state = lock(&self.state)?;
        loop {
            if state.closed {
                return Err(Error::Closed);
            }
            while let Some(message) = state.messages.pop_front() {
                if self.filter.wants(&message.channel) {
                    if state.messages.is_empty() {
                        self.readiness.lower()?;
                    }
                    return Ok(Some(message));
                }
                trace!("inbox: {} no longer subscribed, dropping", message.channel);
            }
            self.readiness.lower()?;
            if let Some((kind, msg)) = &state.failure {
                return Err(Error::NetworkUnavailable(io::Error::new(*kind, msg.clone())));
            }
            let (guard, expired) = wait_until(&self.available, state, deadline)?;
            if expired {
                return Ok(None);
            }
            state = guard;
        }
    }

    /// Drops queued messages the filter no longer wants.
    pub(crate) fn retain_wanted(&self) -> Result<()> {
        let mut state = lock(&self.state)?;
        let before = state.messages.len();
        state.messages.retain(|m| self.filter.wants(&m.channel));
        if before != state.messages.len() {
            trace!("inbox: dropped {} unsubscribed messages", before - state.messages.len());
        }
        if state.messages.is_empty() {
            self.readiness.lower()?;
        }
        Ok(())
    }

    /// Wakes blocked receivers with `Error::Closed` and discards the queue.
    pub(crate) fn close(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.closed = true;
            state.messages.clear();
        }
        if let Err(err) = self.readiness.lower() {
            warn!("inbox: cannot clear readiness: {err}");
        }
        self.available.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::ChannelMatcher;
    use std::time::Duration;

    fn msg(channel: &str) -> Message {
        Message::new(channel, b"x".to_vec(), 0)
    }

    #[test]
    fn unwanted_channels_never_raise_readiness() {
        let filter = ChannelFilter::new();
        let inbox = Inbox::new(filter.clone(), None).unwrap();
        assert!(!inbox.push(msg("NOBODY")).unwrap());
        assert!(!inbox.readiness().wait(Some(Duration::ZERO)).unwrap());

        filter.insert(1, ChannelMatcher::new("A").unwrap());
        assert!(inbox.push(msg("A")).unwrap());
        assert!(inbox.readiness().wait(Some(Duration::ZERO)).unwrap());
    }

    #[test]
    fn removing_a_pattern_purges_queued_messages() {
        let filter = ChannelFilter::new();
        filter.insert(1, ChannelMatcher::new("A").unwrap());
        filter.insert(2, ChannelMatcher::new("B").unwrap());
        let inbox = Inbox::new(filter.clone(), None).unwrap();
        inbox.push(msg("A")).unwrap();
        inbox.push(msg("B")).unwrap();

        filter.remove(1);
        inbox.retain_wanted().unwrap();
        assert!(inbox.readiness().is_raised());
        assert_eq!(inbox.receive(Some(Instant::now())).unwrap().unwrap().channel, "B");
        assert!(!inbox.readiness().is_raised());

        inbox.push(msg("B")).unwrap();
        filter.remove(2);
        inbox.retain_wanted().unwrap();
        assert!(!inbox.readiness().is_raised());
        assert!(inbox.receive(Some(Instant::now())).unwrap().is_none());
    }

    #[test]
    fn limit_drops_overflow() {
        let inbox = Inbox::new(ChannelFilter::accept_all(), Some(1)).unwrap();
        assert!(inbox.push(msg("A")).unwrap());
        assert!(!inbox.push(msg("A")).unwrap());
    }

    #[test]
    fn failure_surfaces_once_drained() {
        let inbox = Inbox::new(ChannelFilter::accept_all(), None).unwrap();
        inbox.push(msg("A")).unwrap();
        inbox.fail(&io::Error::new(ErrorKind::Other, "socket gone"));
        assert!(inbox.receive(None).unwrap().is_some());
        assert!(matches!(
            inbox.receive(None),
            Err(Error::NetworkUnavailable(_))
        ));
    }
}
