//! UDP multicast provider.
//!
//! Every provider owns two sockets: an ephemeral-port sender and, unless
//! configured transmit-only, a receiver joined to the group. A background
//! thread drains the receiver continuously into an inbox so datagrams keep
//! flowing while the consumer runs handler code; `receive` only pops the
//! inbox.
//!
//! ```text
//!  send() ──► encode ──► [LC02] or [LC03 × n] ──► group:port
//!
//!  group:port ──► recv thread ──► decode ──┬─► short ───────────┐
//!                                          └─► Reassembler ─────┴─► inbox ──► receive()
//! ```

pub mod reassembly;
pub mod socket;
pub mod wire;

use std::io::ErrorKind;
use std::net::{SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, trace, warn};

use self::reassembly::Reassembler;
use self::wire::Datagram;
use super::inbox::Inbox;
use super::{lock, Provider, ProviderContext};
use crate::clock::Clock;
use crate::config::MulticastConfig;
use crate::notifier::Readiness;
use crate::{Error, Message, Result};

/// Complete messages buffered between the receive thread and `receive`.
pub const MAX_INBOX_MESSAGES: usize = 65_536;
const RECV_POLL_INTERVAL: Duration = Duration::from_millis(100);
const RECV_BUFFER_SIZE: usize = 65_536;

pub struct MulticastProvider {
    config: MulticastConfig,
    destination: SocketAddrV4,
    sender: UdpSocket,
    /// Next message sequence. Held across all fragments of one message so
    /// they leave back to back.
    send_seq: Mutex<u32>,
    inbox: Arc<Inbox>,
    stop: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl MulticastProvider {
    /// Binds the sockets and starts the receive thread.
    ///
    /// # Errors
    ///
    /// - `Error::NetworkUnavailable`: a socket could not be created, bound,
    ///   or joined to the group
    pub fn open(config: MulticastConfig, context: &ProviderContext) -> Result<Self> {
        if config.ttl == 0 {
            debug!("udpm: ttl=0, traffic stays on this host");
        }
        let sender = socket::bind_sender(config.ttl).map_err(Error::NetworkUnavailable)?;
        let inbox = Arc::new(Inbox::new(context.filter.clone(), Some(MAX_INBOX_MESSAGES))?);
        let stop = Arc::new(AtomicBool::new(false));

        let worker = if config.transmit_only {
            debug!("udpm: transmit-only, receive path disabled");
            None
        } else {
            let receiver = socket::bind_receiver(
                config.group,
                config.port,
                config.recv_buf_size,
                RECV_POLL_INTERVAL,
            )
            .map_err(Error::NetworkUnavailable)?;
            let reassembler = Reassembler::new(config.fragment_timeout);
            let inbox = Arc::clone(&inbox);
            let stop = Arc::clone(&stop);
            let clock = Arc::clone(&context.clock);
            let handle = thread::Builder::new()
                .name("chanbus-udpm-recv".to_string())
                .spawn(move || receive_loop(receiver, reassembler, inbox, stop, clock))?;
            Some(handle)
        };

        debug!(
            "udpm: joined {}:{} (ttl {}, mtu {})",
            config.group, config.port, config.ttl, config.mtu
        );
        Ok(Self {
            destination: SocketAddrV4::new(config.group, config.port),
            config,
            sender,
            send_seq: Mutex::new(0),
            inbox,
            stop,
            worker: Mutex::new(worker),
        })
    }

    pub fn config(&self) -> &MulticastConfig {
        &self.config
    }
}

impl Provider for MulticastProvider {
    fn send(&self, channel: &str, payload: &[u8]) -> Result<()> {
        if self.stop.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        if channel.is_empty() || channel.len() > wire::MAX_CHANNEL_LEN {
            return Err(Error::invalid(format!(
                "channel length {} outside 1..={}",
                channel.len(),
                wire::MAX_CHANNEL_LEN
            )));
        }

        let mut seq = lock(&self.send_seq)?;
        let datagrams = wire::encode_message(*seq, channel, payload, self.config.mtu)
            .ok_or_else(|| {
                Error::invalid(format!(
                    "{} byte payload needs more than {} fragments",
                    payload.len(),
                    wire::MAX_FRAGMENTS
                ))
            })?;
        if datagrams.len() > 1 {
            trace!(
                "udpm: sending {} bytes on {channel} in {} fragments",
                payload.len(),
                datagrams.len()
            );
        }
        for datagram in &datagrams {
            self.sender.send_to(datagram, self.destination)?;
        }
        *seq = seq.wrapping_add(1);
        Ok(())
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
        if self.stop.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inbox.close();
        let worker = self.worker.lock().ok().and_then(|mut w| w.take());
        if let Some(handle) = worker {
            if handle.join().is_err() {
                warn!("udpm: receive thread panicked");
            }
        }
    }
}

impl Drop for MulticastProvider {
    fn drop(&mut self) {
        self.close();
    }
}

fn receive_loop(
    socket: UdpSocket,
    mut reassembler: Reassembler,
    inbox: Arc<Inbox>,
    stop: Arc<AtomicBool>,
    clock: Arc<dyn Clock>,
) {
    let mut buf = vec![0u8; RECV_BUFFER_SIZE];
    while !stop.load(Ordering::Acquire) {
        let (len, from) = match socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(err)
                if matches!(
                    err.kind(),
                    ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                ) =>
            {
                reassembler.evict_stale(Instant::now());
                continue;
            }
            Err(err) => {
                warn!("udpm: receive failed, stopping receive thread: {err}");
                inbox.fail(&err);
                return;
            }
        };
        let recv_us = clock.now_us();

        let message = match wire::decode(&buf[..len]) {
            Ok(Datagram::Short {
                channel, payload, ..
            }) => Some(Message::new(channel, payload, recv_us)),
            Ok(Datagram::Fragment(fragment)) => reassembler
                .insert(from, fragment, Instant::now(), recv_us)
                .map(|done| Message::new(done.channel, done.payload, done.recv_timestamp_us)),
            Err(err) => {
                debug!("udpm: dropping malformed datagram from {from}: {err}");
                None
            }
        };
        if let Some(message) = message {
            if let Err(err) = inbox.push(message) {
                warn!("udpm: inbox unusable, stopping receive thread: {err}");
                return;
            }
        }
    }
}
