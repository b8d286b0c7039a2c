//! Provider URLs.
//!
//! ```text
//! udpm://[GROUP[:PORT]][?ttl=N&recv_buf_size=N&frag_size=N&queue=N&loopback=BOOL]
//! file://PATH[?mode=r|w&speed=F&start=UTIME]
//! tcpq://[HOST[:PORT]][?connect_timeout_ms=N]
//! ```
//!
//! `tcp://` is accepted as another name for `tcpq://`.
//!
//! An empty URL means `udpm://` with every default. Unknown options are
//! logged and ignored.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::PathBuf;
use std::str::FromStr;

use lcmprims_log::PlaybackMode;
use lcmprims_transport::{TcpqConfig, TransportConfig, DEFAULT_TCPQ_PORT};
use tracing::warn;

use crate::error::{LcmError, Result};

/// Environment variable consulted by [`ProviderUrl::from_env`].
pub const DEFAULT_URL_ENV: &str = "LCM_DEFAULT_URL";

/// URL used when nothing else is configured.
pub const DEFAULT_URL: &str = "udpm://";

/// What a `file://` provider does with its log.
#[derive(Debug, Clone, PartialEq)]
pub enum FileMode {
    /// Replay the log as incoming messages.
    Read {
        playback: PlaybackMode,
        /// Skip events before this timestamp (µs since the Unix epoch).
        start: Option<i64>,
    },
    /// Append published messages to the log.
    Write,
}

/// A parsed provider URL.
#[derive(Debug, Clone)]
pub enum ProviderUrl {
    /// UDP multicast.
    Udpm(TransportConfig),
    /// Event log file.
    File { path: PathBuf, mode: FileMode },
    /// TCP relay hub, as `host:port`.
    Tcpq { addr: String, config: TcpqConfig },
}

impl ProviderUrl {
    pub fn parse(url: &str) -> Result<Self> {
        let url = url.trim();
        let url = if url.is_empty() { DEFAULT_URL } else { url };

        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| LcmError::invalid_url(url, "missing \"://\""))?;
        let (target, query) = rest.split_once('?').unwrap_or((rest, ""));
        let options = parse_query(url, query)?;

        match scheme {
            "udpm" => parse_udpm(url, target, &options),
            "file" => parse_file(url, target, &options),
            "tcpq" | "tcp" => parse_tcpq(url, target, &options),
            other => Err(LcmError::invalid_url(
                url,
                format!("unknown provider {other:?}"),
            )),
        }
    }

    /// URL from `LCM_DEFAULT_URL`, or [`DEFAULT_URL`] if unset or empty.
    pub fn from_env() -> Result<Self> {
        let url = std::env::var(DEFAULT_URL_ENV).unwrap_or_default();
        Self::parse(&url)
    }

    /// Provider name as it appears in the URL scheme.
    pub fn provider_name(&self) -> &'static str {
        match self {
            ProviderUrl::Udpm(_) => "udpm",
            ProviderUrl::File { .. } => "file",
            ProviderUrl::Tcpq { .. } => "tcpq",
        }
    }
}

impl FromStr for ProviderUrl {
    type Err = LcmError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

fn parse_query<'a>(url: &str, query: &'a str) -> Result<Vec<(&'a str, &'a str)>> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            pair.split_once('=')
                .filter(|(key, _)| !key.is_empty())
                .ok_or_else(|| LcmError::invalid_url(url, format!("bad option {pair:?}")))
        })
        .collect()
}

fn parse_udpm(url: &str, target: &str, options: &[(&str, &str)]) -> Result<ProviderUrl> {
    let mut config = TransportConfig::default();

    if !target.is_empty() {
        if let Ok(addr) = target.parse::<SocketAddrV4>() {
            config.group = *addr.ip();
            config.port = addr.port();
        } else {
            config.group = target
                .parse::<Ipv4Addr>()
                .map_err(|_| LcmError::invalid_url(url, format!("bad address {target:?}")))?;
        }
    }

    for (key, value) in options {
        match *key {
            "ttl" => config.ttl = number(url, key, value)?,
            "recv_buf_size" => config.recv_buffer_size = Some(number(url, key, value)?),
            "frag_size" => config.fragment_size = number(url, key, value)?,
            "queue" => config.send_queue_capacity = number(url, key, value)?,
            "loopback" => config.loopback = boolean(url, key, value)?,
            other => warn!(url, option = other, "ignoring unknown udpm option"),
        }
    }

    config
        .validate()
        .map_err(|err| LcmError::invalid_url(url, err.to_string()))?;
    Ok(ProviderUrl::Udpm(config))
}

fn parse_file(url: &str, target: &str, options: &[(&str, &str)]) -> Result<ProviderUrl> {
    if target.is_empty() {
        return Err(LcmError::invalid_url(url, "missing file path"));
    }

    let mut write = false;
    let mut playback = PlaybackMode::Timed { speed: 1.0 };
    let mut start = None;

    for (key, value) in options {
        match *key {
            "mode" => {
                write = match *value {
                    "r" => false,
                    "w" => true,
                    _ => return Err(LcmError::invalid_url(url, "mode must be r or w")),
                }
            }
            "speed" => {
                let speed: f64 = number(url, key, value)?;
                playback = if speed == 0.0 {
                    PlaybackMode::AsFastAsPossible
                } else {
                    PlaybackMode::Timed { speed }
                };
                playback
                    .validate()
                    .map_err(|err| LcmError::invalid_url(url, err.to_string()))?;
            }
            "start" => start = Some(number(url, key, value)?),
            other => warn!(url, option = other, "ignoring unknown file option"),
        }
    }

    let mode = if write {
        FileMode::Write
    } else {
        FileMode::Read { playback, start }
    };
    Ok(ProviderUrl::File {
        path: PathBuf::from(target),
        mode,
    })
}

fn parse_tcpq(url: &str, target: &str, options: &[(&str, &str)]) -> Result<ProviderUrl> {
    let addr = if target.is_empty() {
        format!("127.0.0.1:{DEFAULT_TCPQ_PORT}")
    } else if target.parse::<SocketAddr>().is_ok() {
        target.to_string()
    } else {
        match target.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && !host.contains(':') => {
                let port: u16 = number(url, "port", port)?;
                format!("{host}:{port}")
            }
            Some(_) => return Err(LcmError::invalid_url(url, format!("bad address {target:?}"))),
            None => format!("{target}:{DEFAULT_TCPQ_PORT}"),
        }
    };

    let mut config = TcpqConfig::default();
    for (key, value) in options {
        match *key {
            "connect_timeout_ms" => {
                config.connect_timeout =
                    std::time::Duration::from_millis(number(url, key, value)?);
            }
            other => warn!(url, option = other, "ignoring unknown tcpq option"),
        }
    }
    Ok(ProviderUrl::Tcpq { addr, config })
}

fn number<T: FromStr>(url: &str, key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| LcmError::invalid_url(url, format!("bad value for {key}: {value:?}")))
}

fn boolean(url: &str, key: &str, value: &str) -> Result<bool> {
    match value {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        _ => Err(LcmError::invalid_url(
            url,
            format!("bad value for {key}: {value:?}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use lcmprims_transport::{DEFAULT_GROUP, DEFAULT_PORT};

    use super::*;

    fn udpm(url: &str) -> TransportConfig {
        match ProviderUrl::parse(url).unwrap() {
            ProviderUrl::Udpm(config) => config,
            other => panic!("expected udpm, got {other:?}"),
        }
    }

    #[test]
    fn empty_url_is_default_udpm() {
        let config = udpm("");
        assert_eq!(config.group, DEFAULT_GROUP);
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.ttl, 0);

        assert_eq!(udpm("udpm://").group, DEFAULT_GROUP);
    }

    #[test]
    fn udpm_address_and_options() {
        let config = udpm("udpm://239.255.0.9:9000?ttl=1&recv_buf_size=2097152&frag_size=1000&queue=8");
        assert_eq!(config.group, Ipv4Addr::new(239, 255, 0, 9));
        assert_eq!(config.port, 9000);
        assert_eq!(config.ttl, 1);
        assert_eq!(config.recv_buffer_size, Some(2_097_152));
        assert_eq!(config.fragment_size, 1000);
        assert_eq!(config.send_queue_capacity, 8);
    }

    #[test]
    fn udpm_group_without_port_keeps_default_port() {
        let config = udpm("udpm://239.1.2.3");
        assert_eq!(config.group, Ipv4Addr::new(239, 1, 2, 3));
        assert_eq!(config.port, DEFAULT_PORT);
    }

    #[test]
    fn udpm_rejects_bad_values() {
        for url in [
            "udpm://10.0.0.1:7667",
            "udpm://not-an-address",
            "udpm://?ttl=many",
            "udpm://?ttl=300",
            "udpm://?frag_size=0",
            "udpm://?loopback=maybe",
            "udpm://?=1",
        ] {
            assert!(
                matches!(ProviderUrl::parse(url), Err(LcmError::InvalidUrl { .. })),
                "{url}"
            );
        }
    }

    #[test]
    fn unknown_option_is_ignored() {
        assert_eq!(udpm("udpm://?color=blue").port, DEFAULT_PORT);
    }

    #[test]
    fn file_read_and_write_modes() {
        match ProviderUrl::parse("file:///tmp/run.lcmlog?speed=0&start=42").unwrap() {
            ProviderUrl::File { path, mode } => {
                assert_eq!(path, PathBuf::from("/tmp/run.lcmlog"));
                assert_eq!(
                    mode,
                    FileMode::Read {
                        playback: PlaybackMode::AsFastAsPossible,
                        start: Some(42),
                    }
                );
            }
            other => panic!("unexpected {other:?}"),
        }

        match ProviderUrl::parse("file://out.lcmlog?mode=w").unwrap() {
            ProviderUrl::File { mode, .. } => assert_eq!(mode, FileMode::Write),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn file_defaults_to_real_time_playback() {
        match ProviderUrl::parse("file://a.lcmlog").unwrap() {
            ProviderUrl::File { mode, .. } => assert_eq!(
                mode,
                FileMode::Read {
                    playback: PlaybackMode::Timed { speed: 1.0 },
                    start: None,
                }
            ),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn file_rejects_bad_options() {
        for url in ["file://", "file://a?mode=x", "file://a?speed=-2", "file://a?speed=fast"] {
            assert!(ProviderUrl::parse(url).is_err(), "{url}");
        }
    }

    fn tcpq(url: &str) -> (String, TcpqConfig) {
        match ProviderUrl::parse(url).unwrap() {
            ProviderUrl::Tcpq { addr, config } => (addr, config),
            other => panic!("expected tcpq, got {other:?}"),
        }
    }

    #[test]
    fn tcpq_addresses_fill_in_defaults() {
        assert_eq!(tcpq("tcpq://").0, "127.0.0.1:7700");
        assert_eq!(tcpq("tcpq://hub.local").0, "hub.local:7700");
        assert_eq!(tcpq("tcp://127.0.0.1:9000").0, "127.0.0.1:9000");
        assert_eq!(tcpq("tcpq://[::1]:7701").0, "[::1]:7701");

        let (_, config) = tcpq("tcpq://hub:1?connect_timeout_ms=250");
        assert_eq!(config.connect_timeout, std::time::Duration::from_millis(250));
    }

    #[test]
    fn tcpq_rejects_bad_ports() {
        for url in ["tcpq://hub:99999", "tcpq://hub:x", "tcpq://:7700", "tcpq://a:b:c"] {
            assert!(ProviderUrl::parse(url).is_err(), "{url}");
        }
    }

    #[test]
    fn unknown_scheme_rejected() {
        let err = ProviderUrl::parse("mpudpm://localhost").unwrap_err();
        assert!(err.to_string().contains("mpudpm"));
        assert!(ProviderUrl::parse("no-scheme").is_err());
    }
}
