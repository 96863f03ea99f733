use crate::protocol::MAX_FRAME_LEN;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default download chunk size and pattern length: 64 KiB.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Chunk size hints must stay below this bound to be honoured.
pub const MAX_CHUNK_SIZE_HINT: i64 = 1024 * 1024;

/// Server configuration.
///
/// Use [`Config::from_env`] to read the deployment environment, or the
/// builder methods to assemble one in code.
///
/// # Examples
///
/// ```
/// use rspeed::Config;
/// use std::time::Duration;
///
/// let config = Config::new()
///     .with_listen_addr("127.0.0.1:9000")
///     .with_chunk_size(32 * 1024)
///     .with_shutdown_grace(Duration::from_secs(2));
///
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Address the listener binds to
    pub listen_addr: String,

    /// Unique identifier of this server instance
    pub server_id: String,

    /// Address clients should use to reach this server
    pub public_url: String,

    /// Download chunk size used when a client gives no usable hint
    pub chunk_size: usize,

    /// Advertised region, city and country
    pub region: String,
    pub city: String,
    pub country: String,

    /// How long shutdown waits for in-flight calls to drain
    pub shutdown_grace: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            server_id: "default-rust-server".to_string(),
            public_url: "localhost:8080".to_string(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            region: "dev-region".to_string(),
            city: "dev-city".to_string(),
            country: "XX".to_string(),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads the configuration from process environment variables.
    ///
    /// | Variable              | Default               |
    /// |-----------------------|-----------------------|
    /// | `LISTEN_ADDRESS`      | `0.0.0.0:8080`        |
    /// | `SERVER_ID`           | `default-rust-server` |
    /// | `PUBLIC_URL`          | `localhost:8080`      |
    /// | `CHUNK_SIZE_BYTES`    | `65536`               |
    /// | `REGION`              | `dev-region`          |
    /// | `CITY`                | `dev-city`            |
    /// | `COUNTRY`             | `XX`                  |
    /// | `SHUTDOWN_GRACE_SECS` | `5`                   |
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a numeric variable does not parse or the
    /// chunk size is zero or larger than a frame.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env), reading variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str, fallback: String| lookup(key).unwrap_or(fallback);

        let chunk_size = match lookup("CHUNK_SIZE_BYTES") {
            Some(raw) => raw.trim().parse::<usize>().map_err(|e| {
                Error::Config(format!("invalid CHUNK_SIZE_BYTES {:?}: {}", raw, e))
            })?,
            None => defaults.chunk_size,
        };

        let shutdown_grace = match lookup("SHUTDOWN_GRACE_SECS") {
            Some(raw) => Duration::from_secs(raw.trim().parse::<u64>().map_err(|e| {
                Error::Config(format!("invalid SHUTDOWN_GRACE_SECS {:?}: {}", raw, e))
            })?),
            None => defaults.shutdown_grace,
        };

        let config = Self {
            listen_addr: get("LISTEN_ADDRESS", defaults.listen_addr),
            server_id: get("SERVER_ID", defaults.server_id),
            public_url: get("PUBLIC_URL", defaults.public_url),
            chunk_size,
            region: get("REGION", defaults.region),
            city: get("CITY", defaults.city),
            country: get("COUNTRY", defaults.country),
            shutdown_grace,
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks the invariants the server relies on.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(Error::Config("chunk size must be positive".to_string()));
        }
        if self.chunk_size > MAX_FRAME_LEN {
            return Err(Error::Config(format!(
                "chunk size {} exceeds the frame limit of {} bytes",
                self.chunk_size, MAX_FRAME_LEN
            )));
        }
        if self.listen_addr.is_empty() {
            return Err(Error::Config("listen address must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn with_listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.listen_addr = addr.into();
        self
    }

    pub fn with_server_id(mut self, id: impl Into<String>) -> Self {
        self.server_id = id.into();
        self
    }

    pub fn with_public_url(mut self, url: impl Into<String>) -> Self {
        self.public_url = url.into();
        self
    }

    /// Sets the default download chunk size in bytes.
    ///
    /// This is also the length of the pattern the download payload is
    /// cycled from.
    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size;
        self
    }

    pub fn with_location(
        mut self,
        region: impl Into<String>,
        city: impl Into<String>,
        country: impl Into<String>,
    ) -> Self {
        self.region = region.into();
        self.city = city.into();
        self.country = country.into();
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }
}
