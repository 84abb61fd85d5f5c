//! Command line and environment configuration
//!
//! Each of the two endpoints is configured independently: it either listens
//! for an inbound connection or dials an outbound one. Flags are accepted in
//! both the single dash form (`-listen1=:9000`) and the usual double dash
//! form (`--listen1 :9000`).

use std::ffi::OsString;
use std::time::Duration;

use crate::error::ConfigError;

/// How long a single outbound connection attempt may take
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Pause between failed outbound connection attempts
pub const RECONNECT_INTERVAL: Duration = Duration::from_secs(5);
/// Deadline applied to every read on a piped connection
pub const READ_TIMEOUT: Duration = Duration::from_secs(60);
/// Deadline applied to every write on a piped connection
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(60);

const LONG_FLAGS: &[&str] = &[
    "listen1",
    "connect1",
    "listen2",
    "connect2",
    "connect-timeout",
    "reconnect-interval",
    "read-timeout",
    "write-timeout",
    "help",
    "version",
];

#[derive(clap::Parser, Debug)]
#[command(name = "meetup")]
#[command(version)]
#[command(about = "Connect two TCP endpoints via a bidirectional pipe; each endpoint may listen or connect")]
pub struct Args {
    /// Endpoint 1 listen address
    #[arg(long, env = "MEETUP_LISTEN1", value_name = "ADDR")]
    pub listen1: Option<String>,

    /// Endpoint 1 connect address
    #[arg(long, env = "MEETUP_CONNECT1", value_name = "ADDR")]
    pub connect1: Option<String>,

    /// Endpoint 2 listen address
    #[arg(long, env = "MEETUP_LISTEN2", value_name = "ADDR")]
    pub listen2: Option<String>,

    /// Endpoint 2 connect address
    #[arg(long, env = "MEETUP_CONNECT2", value_name = "ADDR")]
    pub connect2: Option<String>,

    /// Timeout for a single outbound connection attempt, in seconds
    #[arg(long, value_name = "SECONDS", default_value_t = CONNECT_TIMEOUT.as_secs())]
    pub connect_timeout: u64,

    /// Pause between failed outbound connection attempts, in seconds
    #[arg(long, value_name = "SECONDS", default_value_t = RECONNECT_INTERVAL.as_secs())]
    pub reconnect_interval: u64,

    /// Read deadline for piped connections, in seconds
    #[arg(long, value_name = "SECONDS", default_value_t = READ_TIMEOUT.as_secs())]
    pub read_timeout: u64,

    /// Write deadline for piped connections, in seconds
    #[arg(long, value_name = "SECONDS", default_value_t = WRITE_TIMEOUT.as_secs())]
    pub write_timeout: u64,
}

/// One of the two logical sides of the proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointId {
    One,
    Two,
}

impl EndpointId {
    pub fn number(self) -> u8 {
        match self {
            EndpointId::One => 1,
            EndpointId::Two => 2,
        }
    }
}

impl std::fmt::Display for EndpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "endpoint {}", self.number())
    }
}

/// How an endpoint obtains its connections
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointConfig {
    /// Accept inbound connections on this address
    Listen(String),
    /// Dial this address, reconnecting forever
    Connect(String),
}

impl EndpointConfig {
    /// Build a listen endpoint, expanding a bare `:port` to all IPv4 and
    /// IPv6 interfaces
    pub fn listen(addr: impl Into<String>) -> Self {
        let addr = addr.into();
        match addr.strip_prefix(':') {
            Some(port) => EndpointConfig::Listen(format!("[::]:{port}")),
            None => EndpointConfig::Listen(addr),
        }
    }

    /// Build a connect endpoint, expanding a bare `:port` to the local host
    pub fn connect(addr: impl Into<String>) -> Self {
        let addr = addr.into();
        match addr.strip_prefix(':') {
            Some(port) => EndpointConfig::Connect(format!("localhost:{port}")),
            None => EndpointConfig::Connect(addr),
        }
    }
}

/// Per operation timeouts used by suppliers and pipes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub connect: Duration,
    pub reconnect: Duration,
    pub read: Duration,
    pub write: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: CONNECT_TIMEOUT,
            reconnect: RECONNECT_INTERVAL,
            read: READ_TIMEOUT,
            write: WRITE_TIMEOUT,
        }
    }
}

/// Validated process configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub endpoint1: EndpointConfig,
    pub endpoint2: EndpointConfig,
    pub timeouts: Timeouts,
}

impl Config {
    pub fn new(endpoint1: EndpointConfig, endpoint2: EndpointConfig) -> Self {
        Self {
            endpoint1,
            endpoint2,
            timeouts: Timeouts::default(),
        }
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }
}

impl TryFrom<Args> for Config {
    type Error = ConfigError;

    fn try_from(args: Args) -> Result<Self, Self::Error> {
        let endpoint1 = select_mode(EndpointId::One, args.listen1, args.connect1)?;
        let endpoint2 = select_mode(EndpointId::Two, args.listen2, args.connect2)?;

        let timeouts = Timeouts {
            connect: seconds("connect-timeout", args.connect_timeout)?,
            reconnect: Duration::from_secs(args.reconnect_interval),
            read: seconds("read-timeout", args.read_timeout)?,
            write: seconds("write-timeout", args.write_timeout)?,
        };

        Ok(Config::new(endpoint1, endpoint2).with_timeouts(timeouts))
    }
}

fn select_mode(
    id: EndpointId,
    listen: Option<String>,
    connect: Option<String>,
) -> Result<EndpointConfig, ConfigError> {
    // An empty value counts as not given
    let listen = listen.filter(|addr| !addr.is_empty());
    let connect = connect.filter(|addr| !addr.is_empty());

    match (listen, connect) {
        (Some(listen), Some(connect)) => {
            tracing::warn!(
                "{id}: both -listen{n} and -connect{n} given, listening on {listen} and ignoring {connect}",
                n = id.number()
            );
            Ok(EndpointConfig::listen(listen))
        }
        (Some(listen), None) => Ok(EndpointConfig::listen(listen)),
        (None, Some(connect)) => Ok(EndpointConfig::connect(connect)),
        (None, None) => Err(ConfigError::MissingMode(id.number())),
    }
}

fn seconds(flag: &'static str, value: u64) -> Result<Duration, ConfigError> {
    if value == 0 {
        return Err(ConfigError::ZeroTimeout { flag });
    }
    Ok(Duration::from_secs(value))
}

/// Rewrite single dash long flags (`-listen1=:9000`) into the double dash
/// form clap understands. Anything else passes through untouched.
pub fn normalize_flag_args<I, T>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString>,
{
    args.into_iter()
        .map(Into::into)
        .map(|arg| {
            let Some(text) = arg.to_str() else {
                return arg;
            };
            if text.starts_with("--") {
                return arg;
            }
            let Some(rest) = text.strip_prefix('-') else {
                return arg;
            };
            let name = rest.split('=').next().unwrap_or(rest);
            if LONG_FLAGS.contains(&name) {
                OsString::from(format!("-{text}"))
            } else {
                arg
            }
        })
        .collect()
}
