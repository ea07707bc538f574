//! Server configuration

use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::mjpeg::receiver::DEFAULT_READ_BUFFER;
use crate::mjpeg::DEFAULT_MAX_PART_SIZE;

/// Environment variable prefix read by [`ServerConfig::from_env`]
pub const ENV_PREFIX: &str = "VIDSTREAM_";

/// Server configuration options
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,

    /// Maximum concurrent HTTP requests, streams included (0 = unlimited)
    pub max_connections: usize,

    /// Largest websocket message accepted from cable clients
    pub ws_max_message_size: usize,

    /// Interval between cable pings
    pub cable_ping_interval: Duration,

    /// Upstream MJPEG connect timeout
    pub upstream_connect_timeout: Duration,

    /// Read buffer for upstream MJPEG responses
    pub upstream_read_buffer: usize,

    /// Largest MJPEG part accepted from upstream
    pub max_part_size: usize,

    /// Publish interval of the animated color source
    pub source_tick: Duration,

    /// Sliding window of the annotation fps counter
    pub fps_window: Duration,

    /// Height of camera snapshots
    pub default_frame_height: u32,

    /// Height of external stream snapshots
    pub external_frame_height: u32,

    /// JPEG quality of snapshots
    pub snapshot_quality: i64,

    /// JPEG quality of re-encoded streams
    pub stream_quality: i64,

    /// Default size of animated color output
    pub synthetic_width: u32,
    pub synthetic_height: u32,

    /// JPEG quality of animated color output
    pub synthetic_quality: i64,

    /// Largest width or height a request may ask for
    pub max_frame_dimension: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            max_connections: 0, // Unlimited
            ws_max_message_size: 512,
            cable_ping_interval: Duration::from_secs(3),
            upstream_connect_timeout: Duration::from_secs(5),
            upstream_read_buffer: DEFAULT_READ_BUFFER,
            max_part_size: DEFAULT_MAX_PART_SIZE,
            source_tick: Duration::from_millis(50),
            fps_window: Duration::from_secs(2),
            default_frame_height: 400,
            external_frame_height: 360,
            snapshot_quality: 80,
            stream_quality: 50,
            synthetic_width: 800,
            synthetic_height: 600,
            synthetic_quality: 20,
            max_frame_dimension: 4096,
        }
    }
}

impl ServerConfig {
    /// Create a new config with custom bind address
    pub fn with_addr(addr: SocketAddr) -> Self {
        Self {
            bind_addr: addr,
            ..Default::default()
        }
    }

    /// Defaults overlaid with `VIDSTREAM_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_vars(std::env::vars())
    }

    /// Defaults overlaid with `VIDSTREAM_*` entries of `vars`.
    ///
    /// Recognised keys: `BIND_ADDR`, `MAX_CONNECTIONS`,
    /// `CABLE_PING_INTERVAL_MS`, `SOURCE_TICK_MS` and `MAX_FRAME_DIMENSION`. Unknown keys are
    /// ignored; malformed values are errors.
    pub fn from_vars<K, V>(vars: impl IntoIterator<Item = (K, V)>) -> Result<Self>
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Self::default();
        for (key, value) in vars {
            let Some(name) = key.as_ref().strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let value = value.as_ref().trim();
            match name {
                "BIND_ADDR" => config.bind_addr = parse_var(name, value)?,
                "MAX_CONNECTIONS" => config.max_connections = parse_var(name, value)?,
                "CABLE_PING_INTERVAL_MS" => {
                    config.cable_ping_interval = Duration::from_millis(parse_var(name, value)?)
                }
                "SOURCE_TICK_MS" => {
                    config.source_tick = Duration::from_millis(parse_var(name, value)?)
                }
                "MAX_FRAME_DIMENSION" => config.max_frame_dimension = parse_var(name, value)?,
                _ => {}
            }
        }
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the server cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.cable_ping_interval.is_zero() {
            return Err(Error::Config("cable ping interval must be positive".into()));
        }
        if self.source_tick.is_zero() {
            return Err(Error::Config("source tick must be positive".into()));
        }
        if self.max_frame_dimension == 0 {
            return Err(Error::Config("max frame dimension must be positive".into()));
        }
        Ok(())
    }

    /// Set the bind address
    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set maximum connections
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Set the cable ping interval
    pub fn cable_ping_interval(mut self, interval: Duration) -> Self {
        self.cable_ping_interval = interval;
        self
    }

    /// Set the upstream connect timeout
    pub fn upstream_connect_timeout(mut self, timeout: Duration) -> Self {
        self.upstream_connect_timeout = timeout;
        self
    }

    /// Set the upstream part size limit
    pub fn max_part_size(mut self, limit: usize) -> Self {
        self.max_part_size = limit;
        self
    }

    /// Set the largest frame width or height a request may ask for
    pub fn max_frame_dimension(mut self, max: u32) -> Self {
        self.max_frame_dimension = max;
        self
    }

    /// Set the animated color publish interval
    pub fn source_tick(mut self, tick: Duration) -> Self {
        self.source_tick = tick;
        self
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| Error::Config(format!("{ENV_PREFIX}{name}={value}: {e}")))
}
