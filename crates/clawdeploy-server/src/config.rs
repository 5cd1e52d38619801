use std::ops::Range;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;

use crate::heartbeat::CycleLimits;
use crate::rebuild::DEFAULT_LOCK_TTL;

const DEFAULT_DATA_ROOT: &str = "/data/clawdeploy";
const DEFAULT_IMAGE: &str = "openclaw:local";
const DEFAULT_SOURCE_DIR: &str = "/opt/openclaw-src";
const DEFAULT_REBUILD_LOCK_PATH: &str = "/tmp/clawdeploy-rebuild.lock";
const DEFAULT_NGINX_PORT_MAP_PATH: &str = "/etc/nginx/clawdeploy-ports.map";

#[derive(Debug, Clone, PartialEq)]
pub struct HeartbeatConfig {
    pub agent_url: String,
    pub agent_token: Option<String>,
    pub interval: Duration,
    pub limits: CycleLimits,
    pub max_cost_per_day: f64,
    pub give_up_threshold: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub database_url: String,
    pub http_port: u16,
    pub data_root: PathBuf,
    pub image: String,
    pub source_dir: PathBuf,
    pub dockerfile: String,
    pub port_range: Range<u16>,
    pub port_attempts: u32,
    pub rebuild_lock_path: PathBuf,
    pub rebuild_lock_ttl: Duration,
    pub source_sync_timeout: Duration,
    pub image_build_timeout: Duration,
    pub reconcile_interval: Duration,
    pub nginx_port_map_path: PathBuf,
    pub nginx_reload: bool,
    /// Shared secret for `/admin/sync`; the endpoint refuses every call when unset.
    pub sync_secret: Option<String>,
    /// Creates allowed per owner within `create_rate_window`.
    pub create_rate_limit: usize,
    pub create_rate_window: Duration,
    /// `None` when the heartbeat supervisor is disabled.
    pub heartbeat: Option<HeartbeatConfig>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let env = Env { lookup };

        let database_url = env
            .non_empty("DATABASE_URL")
            .context("DATABASE_URL must be set")?;
        let port_min = env.parse("CLAWDEPLOY_PORT_MIN", 10_000u16)?;
        let port_max = env.parse("CLAWDEPLOY_PORT_MAX", 20_000u16)?;
        if port_min >= port_max {
            anyhow::bail!("CLAWDEPLOY_PORT_MIN ({port_min}) must be below CLAWDEPLOY_PORT_MAX ({port_max})");
        }

        let agent_url = env.non_empty("CLAWDEPLOY_AGENT_URL");
        let heartbeat_enabled = env
            .bool("CLAWDEPLOY_HEARTBEAT_ENABLED")
            .unwrap_or(agent_url.is_some());
        let heartbeat = if heartbeat_enabled {
            let agent_url = agent_url.context(
                "heartbeat is enabled but CLAWDEPLOY_AGENT_URL is not set",
            )?;
            Some(HeartbeatConfig {
                agent_url,
                agent_token: env.non_empty("CLAWDEPLOY_AGENT_TOKEN"),
                interval: env.secs("CLAWDEPLOY_HEARTBEAT_INTERVAL_SECS", 300)?,
                limits: CycleLimits {
                    max_turns: env.parse("CLAWDEPLOY_HEARTBEAT_MAX_TURNS", 10)?,
                    timeout: env.secs("CLAWDEPLOY_HEARTBEAT_TIMEOUT_SECS", 300)?,
                    max_cycle_cost: env.parse("CLAWDEPLOY_HEARTBEAT_MAX_CYCLE_COST", 0.05)?,
                    warn_percent: env.parse("CLAWDEPLOY_COST_WARN_PERCENT", 80.0)?,
                },
                max_cost_per_day: env.parse("CLAWDEPLOY_MAX_COST_PER_DAY", 3.0)?,
                give_up_threshold: env.parse("CLAWDEPLOY_RESTART_GIVE_UP_THRESHOLD", 3)?,
            })
        } else {
            None
        };

        let rebuild_lock_ttl =
            env.secs("CLAWDEPLOY_REBUILD_LOCK_TTL_SECS", DEFAULT_LOCK_TTL.as_secs())?;
        let source_sync_timeout = env.secs("CLAWDEPLOY_SOURCE_SYNC_TIMEOUT_SECS", 30)?;
        let image_build_timeout = env.secs("CLAWDEPLOY_IMAGE_BUILD_TIMEOUT_SECS", 600)?;
        // A live rebuild must never look stale to another replica.
        if rebuild_lock_ttl <= source_sync_timeout + image_build_timeout {
            anyhow::bail!(
                "CLAWDEPLOY_REBUILD_LOCK_TTL_SECS ({}) must exceed the source sync and image build timeouts combined ({})",
                rebuild_lock_ttl.as_secs(),
                (source_sync_timeout + image_build_timeout).as_secs()
            );
        }

        let create_rate_limit = env.parse("CLAWDEPLOY_CREATE_RATE_LIMIT", 60usize)?;
        let create_rate_window = env.secs("CLAWDEPLOY_CREATE_RATE_WINDOW_SECS", 60)?;
        if create_rate_limit == 0 || create_rate_window.is_zero() {
            anyhow::bail!("CLAWDEPLOY_CREATE_RATE_LIMIT and CLAWDEPLOY_CREATE_RATE_WINDOW_SECS must be positive");
        }

        Ok(Self {
            database_url,
            http_port: env.parse("HTTP_PORT", 8080)?,
            data_root: env.path("CLAWDEPLOY_DATA_ROOT", DEFAULT_DATA_ROOT),
            image: env.string("CLAWDEPLOY_IMAGE", DEFAULT_IMAGE),
            source_dir: env.path("CLAWDEPLOY_SOURCE_DIR", DEFAULT_SOURCE_DIR),
            dockerfile: env.string("CLAWDEPLOY_DOCKERFILE", "Dockerfile"),
            port_range: port_min..port_max,
            port_attempts: env.parse("CLAWDEPLOY_PORT_ATTEMPTS", 10)?,
            rebuild_lock_path: env.path("CLAWDEPLOY_REBUILD_LOCK_PATH", DEFAULT_REBUILD_LOCK_PATH),
            rebuild_lock_ttl,
            source_sync_timeout,
            image_build_timeout,
            reconcile_interval: env.secs("CLAWDEPLOY_RECONCILE_INTERVAL_SECS", 60)?,
            nginx_port_map_path: env.path("CLAWDEPLOY_NGINX_PORT_MAP_PATH", DEFAULT_NGINX_PORT_MAP_PATH),
            nginx_reload: env.bool("CLAWDEPLOY_NGINX_RELOAD").unwrap_or(true),
            sync_secret: env.non_empty("CLAWDEPLOY_SYNC_SECRET"),
            create_rate_limit,
            create_rate_window,
            heartbeat,
        })
    }
}

struct Env<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn non_empty(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.non_empty(key).unwrap_or_else(|| default.to_string())
    }

    fn path(&self, key: &str, default: &str) -> PathBuf {
        PathBuf::from(self.string(key, default))
    }

    fn bool(&self, key: &str) -> Option<bool> {
        self.non_empty(key).and_then(|raw| match raw.as_str() {
            "1" | "true" | "TRUE" | "yes" | "on" => Some(true),
            "0" | "false" | "FALSE" | "no" | "off" => Some(false),
            _ => None,
        })
    }

    fn parse<T>(&self, key: &str, default: T) -> anyhow::Result<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.non_empty(key) {
            Some(raw) => raw
                .parse::<T>()
                .map_err(|e| anyhow::anyhow!("invalid {key}={raw:?}: {e}")),
            None => Ok(default),
        }
    }

    fn secs(&self, key: &str, default: u64) -> anyhow::Result<Duration> {
        self.parse(key, default).map(Duration::from_secs)
    }
}
