use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use regex::Regex;

use crate::{Error, Result};

/// Anchored channel-name pattern.
///
/// A pattern is a regular expression that must match the whole channel name,
/// so a literal name such as `POSE` matches only `POSE` and never `POSE_2`.
#[derive(Clone, Debug)]
pub struct ChannelMatcher {
    pattern: String,
    regex: Regex,
}

impl ChannelMatcher {
    pub fn new(pattern: &str) -> Result<Self> {
        let regex = Regex::new(&format!("^(?:{pattern})$"))
            .map_err(|err| Error::invalid(format!("channel pattern {pattern:?}: {err}")))?;
        Ok(Self {
            pattern: pattern.to_string(),
            regex,
        })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn matches(&self, channel: &str) -> bool {
        self.regex.is_match(channel)
    }
}

/// The set of patterns a broker currently dispatches, shared with its
/// provider so traffic nobody subscribes to is dropped before it is queued.
///
/// Clones share one set.
#[derive(Clone, Default)]
pub struct ChannelFilter {
    inner: Arc<RwLock<FilterState>>,
}

#[derive(Default)]
struct FilterState {
    accept_all: bool,
    patterns: Vec<(u64, ChannelMatcher)>,
}

impl ChannelFilter {
    /// A filter that wants nothing until patterns are inserted.
    pub fn new() -> Self {
        Self::default()
    }

    /// A filter that wants every channel.
    pub fn accept_all() -> Self {
        let filter = Self::default();
        filter.write().accept_all = true;
        filter
    }

    pub fn insert(&self, id: u64, matcher: ChannelMatcher) {
        self.write().patterns.push((id, matcher));
    }

    pub fn remove(&self, id: u64) {
        self.write().patterns.retain(|(pid, _)| *pid != id);
    }

    pub fn wants(&self, channel: &str) -> bool {
        let state = self.read();
        state.accept_all || state.patterns.iter().any(|(_, m)| m.matches(channel))
    }

    // Each mutation is one push or retain, so a poisoned guard still holds
    // a consistent set.
    fn read(&self) -> RwLockReadGuard<'_, FilterState> {
        self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, FilterState> {
        self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
