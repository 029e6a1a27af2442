//! Provider configuration parsed from URL-shaped strings.
//!
//! ```text
//! memq://[key]
//! udpm://239.255.76.67:7667?ttl=1&transmit_only=false&mtu=1400
//! file:///var/log/session.log?mode=r&speed=2&start_timestamp=1700000000000000
//! ```

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use log::warn;
use url::Url;

use crate::eventlog::LogMode;
use crate::{Error, Result};

/// Environment variable consulted when no URL is given.
pub const DEFAULT_URL_ENV: &str = "CHANBUS_DEFAULT_URL";
pub const DEFAULT_URL: &str = "udpm://239.255.76.67:7667?ttl=0";

pub const DEFAULT_MULTICAST_PORT: u16 = 7667;
/// Largest UDP payload over IPv4.
pub const MAX_DATAGRAM_SIZE: usize = 65_507;
/// Smallest datagram that still fits a fragment header, the longest network
/// channel name and at least one payload byte per fragment.
pub const MIN_DATAGRAM_SIZE: usize = 128;
pub const DEFAULT_FRAGMENT_TIMEOUT: Duration = Duration::from_millis(1000);

#[derive(Clone, Debug, PartialEq)]
pub enum ProviderConfig {
    MemQueue(MemQueueConfig),
    Multicast(MulticastConfig),
    File(FileConfig),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemQueueConfig {
    /// Registry key; providers opened with the same key share one bus.
    pub key: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MulticastConfig {
    pub group: Ipv4Addr,
    pub port: u16,
    /// Multicast hop limit. 0 keeps traffic on the local host.
    pub ttl: u8,
    /// Skip binding the receive socket entirely.
    pub transmit_only: bool,
    pub recv_buf_size: Option<usize>,
    /// Largest datagram the sender emits; bigger messages are fragmented.
    pub mtu: usize,
    /// Incomplete messages idle longer than this are evicted.
    pub fragment_timeout: Duration,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FileConfig {
    pub path: PathBuf,
    pub mode: LogMode,
    /// Playback pacing factor for read mode. Zero or negative replays as
    /// fast as the reader asks.
    pub speed: f64,
    pub start_timestamp: Option<i64>,
}

impl ProviderConfig {
    /// Parses a provider URL. An empty string resolves the default URL.
    pub fn parse(url: &str) -> Result<Self> {
        let url = url.trim();
        if url.is_empty() {
            return Self::from_env();
        }
        let parsed = Url::parse(url).map_err(|err| Error::invalid(format!("url {url:?}: {err}")))?;
        match parsed.scheme() {
            "memq" => Ok(Self::MemQueue(parse_memq(&parsed))),
            "udpm" => parse_udpm(&parsed).map(Self::Multicast),
            "file" => parse_file(&parsed).map(Self::File),
            other => Err(Error::invalid(format!("unknown provider scheme {other:?}"))),
        }
    }

    /// Uses `CHANBUS_DEFAULT_URL` if set and non-empty, otherwise the
    /// built-in multicast default.
    pub fn from_env() -> Result<Self> {
        match std::env::var(DEFAULT_URL_ENV) {
            Ok(url) if !url.trim().is_empty() => Self::parse(&url),
            _ => Self::parse(DEFAULT_URL),
        }
    }

    pub fn scheme(&self) -> &'static str {
        match self {
            Self::MemQueue(_) => "memq",
            Self::Multicast(_) => "udpm",
            Self::File(_) => "file",
        }
    }
}

impl FromStr for ProviderConfig {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

fn parse_memq(url: &Url) -> MemQueueConfig {
    for (key, _) in url.query_pairs() {
        warn!("memq: ignoring unknown option {key:?}");
    }
    MemQueueConfig {
        key: url.host_str().unwrap_or_default().to_string(),
    }
}

fn parse_udpm(url: &Url) -> Result<MulticastConfig> {
    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| Error::invalid("udpm url needs a multicast group"))?;
    let group: Ipv4Addr = host
        .parse()
        .map_err(|_| Error::invalid(format!("udpm group {host:?} is not an IPv4 address")))?;
    if !group.is_multicast() {
        return Err(Error::invalid(format!("{group} is not a multicast address")));
    }

    let mut config = MulticastConfig {
        group,
        port: url.port().unwrap_or(DEFAULT_MULTICAST_PORT),
        ttl: 0,
        transmit_only: false,
        recv_buf_size: None,
        mtu: MAX_DATAGRAM_SIZE,
        fragment_timeout: DEFAULT_FRAGMENT_TIMEOUT,
    };
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "ttl" => config.ttl = parse_number(&key, &value)?,
            "transmit_only" => config.transmit_only = parse_bool(&key, &value)?,
            "recv_buf_size" => config.recv_buf_size = Some(parse_number(&key, &value)?),
            "mtu" => {
                let mtu: usize = parse_number(&key, &value)?;
                if !(MIN_DATAGRAM_SIZE..=MAX_DATAGRAM_SIZE).contains(&mtu) {
                    return Err(Error::invalid(format!(
                        "mtu {mtu} outside {MIN_DATAGRAM_SIZE}..={MAX_DATAGRAM_SIZE}"
                    )));
                }
                config.mtu = mtu;
            }
            "frag_timeout_ms" => {
                config.fragment_timeout = Duration::from_millis(parse_number(&key, &value)?)
            }
            _ => warn!("udpm: ignoring unknown option {key:?}"),
        }
    }
    Ok(config)
}

fn parse_file(url: &Url) -> Result<FileConfig> {
    let host = url.host_str().unwrap_or_default();
    let path = if host.is_empty() {
        url.to_file_path()
            .map_err(|_| Error::invalid(format!("file url {url} has no usable path")))?
    } else {
        // `file://relative/name.log` puts the first segment in the host.
        PathBuf::from(format!("{host}{}", url.path()))
    };
    if path.as_os_str().is_empty() {
        return Err(Error::invalid("file url needs a path"));
    }

    let mut config = FileConfig {
        path,
        mode: LogMode::Read,
        speed: 0.0,
        start_timestamp: None,
    };
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "mode" => {
                config.mode = match value.as_ref() {
                    "r" => LogMode::Read,
                    "w" => LogMode::Write,
                    "a" => LogMode::Append,
                    other => return Err(Error::invalid(format!("invalid file mode {other:?}"))),
                }
            }
            "speed" => config.speed = parse_number(&key, &value)?,
            "start_timestamp" => config.start_timestamp = Some(parse_number(&key, &value)?),
            _ => warn!("file: ignoring unknown option {key:?}"),
        }
    }
    Ok(config)
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| Error::invalid(format!("invalid value {value:?} for {key}")))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value {
        "true" | "1" | "yes" | "" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(Error::invalid(format!("invalid value {value:?} for {key}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_memq_with_and_without_key() {
        assert_eq!(
            ProviderConfig::parse("memq://").unwrap(),
            ProviderConfig::MemQueue(MemQueueConfig { key: String::new() })
        );
        assert_eq!(
            ProviderConfig::parse("memq://pairs").unwrap(),
            ProviderConfig::MemQueue(MemQueueConfig {
                key: "pairs".to_string()
            })
        );
    }

    #[test]
    fn parses_udpm_options() {
        let config = ProviderConfig::parse(
            "udpm://239.255.76.67:7668?ttl=1&transmit_only=true&mtu=1400&frag_timeout_ms=250",
        )
        .unwrap();
        let ProviderConfig::Multicast(config) = config else {
            panic!("expected multicast config");
        };
        assert_eq!(config.group, Ipv4Addr::new(239, 255, 76, 67));
        assert_eq!(config.port, 7668);
        assert_eq!(config.ttl, 1);
        assert!(config.transmit_only);
        assert_eq!(config.mtu, 1400);
        assert_eq!(config.fragment_timeout, Duration::from_millis(250));
    }

    #[test]
    fn udpm_defaults() {
        let ProviderConfig::Multicast(config) = ProviderConfig::parse("udpm://239.1.2.3").unwrap()
        else {
            panic!("expected multicast config");
        };
        assert_eq!(config.port, DEFAULT_MULTICAST_PORT);
        assert_eq!(config.ttl, 0);
        assert!(!config.transmit_only);
        assert_eq!(config.mtu, MAX_DATAGRAM_SIZE);
    }

    #[test]
    fn rejects_bad_udpm() {
        assert!(ProviderConfig::parse("udpm://10.0.0.1:7667").is_err());
        assert!(ProviderConfig::parse("udpm://not-an-ip:7667").is_err());
        assert!(ProviderConfig::parse("udpm://239.1.2.3:7667?ttl=999").is_err());
        assert!(ProviderConfig::parse("udpm://239.1.2.3:7667?mtu=16").is_err());
    }

    #[test]
    fn parses_file_modes() {
        let ProviderConfig::File(config) =
            ProviderConfig::parse("file:///tmp/session.log?mode=w").unwrap()
        else {
            panic!("expected file config");
        };
        assert_eq!(config.path, PathBuf::from("/tmp/session.log"));
        assert_eq!(config.mode, LogMode::Write);

        let ProviderConfig::File(config) =
            ProviderConfig::parse("file:///tmp/s.log?speed=2.5&start_timestamp=42").unwrap()
        else {
            panic!("expected file config");
        };
        assert_eq!(config.mode, LogMode::Read);
        assert_eq!(config.speed, 2.5);
        assert_eq!(config.start_timestamp, Some(42));

        assert!(matches!(
            ProviderConfig::parse("file:///tmp/s.log?mode=rw"),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn rejects_malformed_urls() {
        assert!(matches!(
            ProviderConfig::parse("not a url"),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            ProviderConfig::parse("tcpq://localhost:7700"),
            Err(Error::InvalidArgument(_))
        ));
    }
}
