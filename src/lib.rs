//! Channel-based publish/subscribe messaging over pluggable transports.
//!
//! A [`Broker`] publishes payloads on named channels and dispatches received
//! messages to handlers whose regular-expression pattern matches the whole
//! channel name. The transport is chosen by URL:
//!
//! - `memq://[key]`: in-process queue shared through a [`MemQueueRegistry`]
//! - `udpm://group:port?ttl=N`: UDP multicast with fragmentation
//! - `file:///path?mode=r|w|a`: record to or replay from an [`EventLog`]

pub mod broker;
pub mod clock;
pub mod config;
pub mod error;
pub mod eventlog;
pub mod matcher;
pub mod message;
pub mod notifier;
pub mod provider;
pub mod queue;

pub use broker::{Broker, BrokerBuilder, Subscription, DISPATCH_BATCH_LIMIT};
pub use clock::{Clock, SystemClock};
pub use config::ProviderConfig;
pub use error::{Error, Result};
pub use eventlog::{EventLog, LogMode, Record};
pub use matcher::{ChannelFilter, ChannelMatcher};
pub use message::Message;
pub use notifier::Readiness;
pub use provider::{MemQueueRegistry, Provider};
pub use queue::SubscriptionQueue;
