//! Machine management service configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use infra_bootimage::{BufferPoolConfig, ContentHashAlgorithm, IntegrityAlgorithm, ServiceConfig};

/// Service configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP listen address.
    pub listen_addr: SocketAddr,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Directory served by the local object store.
    pub image_root: PathBuf,

    /// Bootstrap image retrieval settings.
    pub image: ServiceConfig,

    /// Buffer pool sizing.
    pub pool: BufferPoolConfig,

    /// How long in-flight requests get to finish after a shutdown signal.
    pub shutdown_timeout: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let listen_addr = lookup("MACHINEMGMT_LISTEN_ADDR")
            .unwrap_or_else(|| "127.0.0.1:8080".to_string())
            .parse()
            .context("MACHINEMGMT_LISTEN_ADDR must be a socket address (host:port).")?;

        let log_level = lookup("MACHINEMGMT_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let image_root = lookup("MACHINEMGMT_IMAGE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./images"));

        let mut image = ServiceConfig::default();
        if let Some(namespace) = lookup("MACHINEMGMT_IMAGE_NAMESPACE") {
            image.namespace = namespace;
        }
        if let Some(ms) = parse::<u64>(&lookup, "MACHINEMGMT_RETRY_INITIAL_MS")? {
            image.retry.initial_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parse::<u64>(&lookup, "MACHINEMGMT_RETRY_MAX_MS")? {
            image.retry.max_delay = Duration::from_millis(ms);
        }
        if let Some(attempts) = parse::<u32>(&lookup, "MACHINEMGMT_RETRY_MAX_ATTEMPTS")? {
            image.retry.max_attempts = attempts;
        }
        if let Some(secs) = parse::<u64>(&lookup, "MACHINEMGMT_RETRY_DEADLINE_SECS")? {
            image.retry.deadline = Some(Duration::from_secs(secs));
        }
        if let Some(algorithm) = parse::<IntegrityAlgorithm>(&lookup, "MACHINEMGMT_INTEGRITY")? {
            image.integrity = algorithm;
        }
        if let Some(algorithm) = parse::<ContentHashAlgorithm>(&lookup, "MACHINEMGMT_CONTENT_HASH")?
        {
            image.content_hash = algorithm;
        }
        if let Some(raw) = lookup("MACHINEMGMT_MAX_IMAGE_BYTES") {
            image.max_image_bytes = match raw.as_str() {
                "" | "0" | "none" => None,
                _ => Some(
                    raw.parse()
                        .context("MACHINEMGMT_MAX_IMAGE_BYTES must be an integer (bytes).")?,
                ),
            };
        }
        image
            .validate()
            .context("Invalid bootstrap image configuration.")?;

        let mut pool = BufferPoolConfig::default();
        if let Some(max_idle) = parse::<usize>(&lookup, "MACHINEMGMT_POOL_MAX_IDLE")? {
            pool.max_idle = max_idle;
        }
        if let Some(bytes) = parse::<usize>(&lookup, "MACHINEMGMT_POOL_MAX_RETAINED_BYTES")? {
            pool.max_retained_capacity = Some(bytes);
        }

        let shutdown_timeout = Duration::from_secs(
            parse::<u64>(&lookup, "MACHINEMGMT_SHUTDOWN_TIMEOUT_SECS")?.unwrap_or(10),
        );

        Ok(Self {
            listen_addr,
            log_level,
            image_root,
            image,
            pool,
            shutdown_timeout,
        })
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    lookup(name)
        .map(|raw| {
            raw.parse::<T>()
                .map_err(|e| anyhow::anyhow!("{name}={raw:?} is invalid: {e}"))
        })
        .transpose()
}
