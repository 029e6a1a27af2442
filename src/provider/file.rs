use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use log::{debug, trace, warn};

use super::{lock, wait_until, Provider, ProviderContext};
use crate::clock::Clock;
use crate::config::FileConfig;
use crate::eventlog::{EventLog, LogMode, Record};
use crate::matcher::ChannelFilter;
use crate::notifier::Readiness;
use crate::{Error, Message, Result};

/// Records published messages to an event log, or replays one.
///
/// A write-mode provider never receives; a read-mode provider never sends.
/// Running out of records is reported as `Error::EndOfLog` rather than as an
/// empty receive, because a replayed file does not refill.
///
/// Replay skips records on channels the filter does not want. Readiness is
/// raised while a wanted record remains; under pacing that record may not be
/// due yet.
pub struct FileProvider {
    mode: LogMode,
    speed: f64,
    state: Mutex<ReplayState>,
    wake: Condvar,
    readiness: Readiness,
    filter: ChannelFilter,
    clock: Arc<dyn Clock>,
    closed: AtomicBool,
}

struct ReplayState {
    log: EventLog,
    /// Next record to hand out, read ahead so readiness can be kept exact.
    pending: Option<Record>,
    /// Wall instant and log timestamp of the first replayed record.
    anchor: Option<(Instant, i64)>,
}

impl FileProvider {
    pub fn open(config: &FileConfig, context: &ProviderContext) -> Result<Self> {
        let mut log = EventLog::open(&config.path, config.mode)?;
        if config.mode.is_read() {
            if let Some(ts) = config.start_timestamp {
                debug!("file: seeking {} to timestamp {ts}", config.path.display());
                log.seek_to_timestamp(ts)?;
            }
        }
        debug!(
            "file: opened {} in {:?} mode",
            config.path.display(),
            config.mode
        );
        let provider = Self {
            mode: config.mode,
            speed: config.speed,
            state: Mutex::new(ReplayState {
                log,
                pending: None,
                anchor: None,
            }),
            wake: Condvar::new(),
            readiness: Readiness::new()?,
            filter: context.filter.clone(),
            clock: Arc::clone(&context.clock),
            closed: AtomicBool::new(false),
        };
        if provider.mode.is_read() {
            let mut state = lock(&provider.state)?;
            provider.refresh_readiness(&mut state)?;
        }
        Ok(provider)
    }

    pub fn mode(&self) -> LogMode {
        self.mode
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Instant at which `timestamp_us` is due under the configured pacing.
    fn due_at(&self, anchor: (Instant, i64), timestamp_us: i64) -> Instant {
        let (wall, log_ts) = anchor;
        let delta_us = timestamp_us.saturating_sub(log_ts).max(0) as f64 / self.speed;
        wall + Duration::from_micros(delta_us as u64)
    }

    fn wanted(&self, record: &Record) -> bool {
        self.filter.wants(&record.channel)
    }

    /// Makes `pending` the next wanted record, consuming the unwanted ones
    /// before it. Leaves `pending` empty at the end of the log.
    fn advance(&self, state: &mut ReplayState) -> Result<()> {
        loop {
            if let Some(record) = &state.pending {
                if self.wanted(record) {
                    return Ok(());
                }
                trace!("file: skipping unsubscribed record on {}", record.channel);
            }
            state.pending = state.log.read_next_record()?;
            if state.pending.is_none() {
                return Ok(());
            }
        }
    }

    /// Raises readiness iff a wanted record lies ahead, without consuming
    /// anything: subscriptions made later may still want what is skipped here.
    fn refresh_readiness(&self, state: &mut ReplayState) -> Result<()> {
        let mut found = state.pending.as_ref().map_or(false, |r| self.wanted(r));
        if !found {
            let resume = state.log.tell();
            while let Some(record) = state.log.read_next_record()? {
                if self.wanted(&record) {
                    found = true;
                    break;
                }
            }
            state.log.seek(resume)?;
        }
        if found {
            self.readiness.raise()
        } else {
            self.readiness.lower()
        }
    }
}

impl Provider for FileProvider {
    fn send(&self, channel: &str, payload: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        if self.mode.is_read() {
            return Err(Error::ReadOnlyViolation);
        }
        let mut state = lock(&self.state)?;
        state.log.write_record(self.clock.now_us(), channel, payload)?;
        state.log.flush()
    }

    fn receive(&self, deadline: Option<Instant>) -> Result<Option<Message>> {
        if !self.mode.is_read() {
            return Err(Error::WriteOnlyViolation);
        }
        let mut state = lock(&self.state)?;
        loop {
            if self.is_closed() {
                return Err(Error::Closed);
            }
            self.advance(&mut state)?;
            let timestamp_us = match &state.pending {
                Some(record) => record.timestamp_us,
                None => {
                    self.readiness.lower()?;
                    return Err(Error::EndOfLog);
                }
            };

            if self.speed > 0.0 {
                let anchor = *state.anchor.get_or_insert((Instant::now(), timestamp_us));
                let due = self.due_at(anchor, timestamp_us);
                if Instant::now() < due {
                    let wake_at = match deadline {
                        Some(deadline) if deadline < due => deadline,
                        _ => due,
                    };
                    let (guard, expired) = wait_until(&self.wake, state, Some(wake_at))?;
                    state = guard;
                    if expired && deadline.map_or(false, |d| Instant::now() >= d) {
                        return Ok(None);
                    }
                    continue;
                }
            }

            let record = state.pending.take();
            // Unwanted records up to the next wanted one are dropped here,
            // the same as the dispatch that asked for this one would.
            self.advance(&mut state)?;
            if state.pending.is_some() {
                self.readiness.raise()?;
            } else {
                self.readiness.lower()?;
            }
            return Ok(record.map(|r| Message::new(r.channel, r.payload, r.timestamp_us)));
        }
    }

    fn readiness_handle(&self) -> &Readiness {
        &self.readiness
    }

    fn filter_changed(&self) -> Result<()> {
        if !self.mode.is_read() {
            return Ok(());
        }
        let mut state = lock(&self.state)?;
        self.refresh_readiness(&mut state)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        if let Ok(mut state) = self.state.lock() {
            if let Err(err) = state.log.flush() {
                warn!("file: flush on close failed: {err}");
            }
        }
        if let Err(err) = self.readiness.lower() {
            warn!("file: cannot clear readiness: {err}");
        }
        self.wake.notify_all();
    }
}
