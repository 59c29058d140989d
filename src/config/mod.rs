/// Configuration management for reparto
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::core::{AuthMethod, PoolingMode, Rule, Shard};

/// Main reparto configuration, loaded once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Listener configuration
    pub server: ServerConfig,
    /// Backend shard descriptors
    pub shards: Vec<Shard>,
    /// Client matching rules, first match wins
    pub rules: Vec<Rule>,
    /// Routing entries for the built-in query router
    #[serde(default)]
    pub routes: Vec<RouteEntryConfig>,
    /// Timeouts and deadlines
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Backend health probing
    #[serde(default)]
    pub health: HealthConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the proxy listens on
    pub listen_addr: String,
    /// Address the admin console listens on
    pub admin_addr: String,
    /// Optional file of console commands replayed before serving
    #[serde(default)]
    pub init_sql: Option<String>,
}

/// One routing entry for the built-in router: either a plain table→shard
/// mapping or a sharding-column key-range split.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteEntryConfig {
    pub table: String,
    /// Target shard for the whole table; mutually exclusive with ranges.
    #[serde(default)]
    pub shard: Option<String>,
    /// Sharding column whose equality predicate selects a range.
    #[serde(default)]
    pub column: Option<String>,
    #[serde(default)]
    pub ranges: Vec<KeyRangeConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyRangeConfig {
    pub low: i64,
    /// Inclusive upper bound.
    pub high: i64,
    pub shard: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Bounded wait for a pooled backend before PoolExhausted
    #[serde(default = "default_pool_acquire_ms")]
    pub pool_acquire_ms: u64,
    /// Backend dial timeout
    #[serde(default = "default_dial_ms")]
    pub dial_ms: u64,
    /// Grace period for draining active transactions at shutdown
    #[serde(default = "default_shutdown_sec")]
    pub shutdown_deadline_sec: u64,
    /// Idle deadline after which an empty route is reaped
    #[serde(default = "default_route_idle_sec")]
    pub route_idle_sec: u64,
    /// Ceiling on a single backend read; 0 disables the limit
    #[serde(default)]
    pub backend_read_sec: u64,
}

fn default_pool_acquire_ms() -> u64 {
    5000
}
fn default_dial_ms() -> u64 {
    3000
}
fn default_shutdown_sec() -> u64 {
    30
}
fn default_route_idle_sec() -> u64 {
    300
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            pool_acquire_ms: default_pool_acquire_ms(),
            dial_ms: default_dial_ms(),
            shutdown_deadline_sec: default_shutdown_sec(),
            route_idle_sec: default_route_idle_sec(),
            backend_read_sec: 0,
        }
    }
}

impl TimeoutConfig {
    pub fn pool_acquire(&self) -> Duration {
        Duration::from_millis(self.pool_acquire_ms)
    }
    pub fn dial(&self) -> Duration {
        Duration::from_millis(self.dial_ms)
    }
    pub fn shutdown_deadline(&self) -> Duration {
        Duration::from_secs(self.shutdown_deadline_sec)
    }
    pub fn route_idle(&self) -> Duration {
        Duration::from_secs(self.route_idle_sec)
    }
    pub fn backend_read(&self) -> Option<Duration> {
        (self.backend_read_sec > 0).then(|| Duration::from_secs(self.backend_read_sec))
    }
}

/// Health check configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Probe interval in seconds
    #[serde(default = "default_health_interval")]
    pub interval_sec: u64,
    /// Per-probe timeout in seconds
    #[serde(default = "default_health_timeout")]
    pub timeout_sec: u64,
}

fn default_health_interval() -> u64 {
    10
}
fn default_health_timeout() -> u64 {
    3
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_sec: default_health_interval(),
            timeout_sec: default_health_timeout(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content =
            fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;

        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))?;
        Ok(())
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.listen_addr.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "listen_addr cannot be empty".to_string(),
            ));
        }
        if self.server.admin_addr.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "admin_addr cannot be empty".to_string(),
            ));
        }
        if self.server.admin_addr == self.server.listen_addr {
            return Err(ConfigError::ValidationError(
                "admin_addr must differ from listen_addr".to_string(),
            ));
        }

        if self.shards.is_empty() {
            return Err(ConfigError::ValidationError(
                "at least one shard is required".to_string(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for shard in &self.shards {
            if !seen.insert(shard.name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate shard name: {}",
                    shard.name
                )));
            }
            if shard.hosts.is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "shard {} has no hosts",
                    shard.name
                )));
            }
            for host in &shard.hosts {
                host.parse::<std::net::SocketAddr>().map_err(|_| {
                    ConfigError::ValidationError(format!(
                        "invalid host for shard {}: {}",
                        shard.name, host
                    ))
                })?;
            }
            if shard.max_connections == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "shard {} max_connections must be greater than 0",
                    shard.name
                )));
            }
        }

        if self.rules.is_empty() {
            return Err(ConfigError::ValidationError(
                "at least one rule is required".to_string(),
            ));
        }
        for rule in &self.rules {
            if rule.auth == AuthMethod::Password && rule.password.is_none() {
                return Err(ConfigError::ValidationError(format!(
                    "rule {} uses password auth but has no password",
                    rule.ident()
                )));
            }
            if rule.connection_limit == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "rule {} connection_limit must be greater than 0",
                    rule.ident()
                )));
            }
            if let Some(shard) = &rule.default_shard {
                if !seen.contains(shard.as_str()) {
                    return Err(ConfigError::ValidationError(format!(
                        "rule {} default_shard {} is not a configured shard",
                        rule.ident(),
                        shard
                    )));
                }
            }
        }

        for route in &self.routes {
            match (&route.shard, route.ranges.is_empty()) {
                (Some(_), false) => {
                    return Err(ConfigError::ValidationError(format!(
                        "route for table {} has both shard and ranges",
                        route.table
                    )));
                }
                (None, true) => {
                    return Err(ConfigError::ValidationError(format!(
                        "route for table {} has neither shard nor ranges",
                        route.table
                    )));
                }
                _ => {}
            }
            if !route.ranges.is_empty() && route.column.is_none() {
                return Err(ConfigError::ValidationError(format!(
                    "route for table {} has ranges but no column",
                    route.table
                )));
            }
            for range in &route.ranges {
                if range.low > range.high {
                    return Err(ConfigError::ValidationError(format!(
                        "route for table {} has inverted range {}..{}",
                        route.table, range.low, range.high
                    )));
                }
                if !seen.contains(range.shard.as_str()) {
                    return Err(ConfigError::ValidationError(format!(
                        "route for table {} targets unknown shard {}",
                        route.table, range.shard
                    )));
                }
            }
            if let Some(shard) = &route.shard {
                if !seen.contains(shard.as_str()) {
                    return Err(ConfigError::ValidationError(format!(
                        "route for table {} targets unknown shard {}",
                        route.table, shard
                    )));
                }
            }
        }

        if self.health.interval_sec == 0 {
            return Err(ConfigError::ValidationError(
                "health interval_sec must be greater than 0".to_string(),
            ));
        }
        if self.health.timeout_sec >= self.health.interval_sec {
            return Err(ConfigError::ValidationError(
                "health timeout_sec must be less than interval_sec".to_string(),
            ));
        }

        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            other => {
                return Err(ConfigError::ValidationError(format!(
                    "invalid log level: {}",
                    other
                )));
            }
        }

        Ok(())
    }

    /// Write an example two-shard configuration.
    pub fn create_example_config<P: AsRef<Path>>(path: P) -> Result<(), ConfigError> {
        Config::example().save_to_file(path)
    }

    pub fn example() -> Self {
        Config {
            server: ServerConfig {
                listen_addr: "0.0.0.0:6432".to_string(),
                admin_addr: "127.0.0.1:7432".to_string(),
                init_sql: None,
            },
            shards: vec![
                Shard {
                    name: "sh1".to_string(),
                    hosts: vec!["10.0.1.10:5432".to_string()],
                    user: "reparto".to_string(),
                    password: Some("secret".to_string()),
                    database: "app".to_string(),
                    tls: Default::default(),
                    max_connections: 20,
                },
                Shard {
                    name: "sh2".to_string(),
                    hosts: vec!["10.0.1.11:5432".to_string()],
                    user: "reparto".to_string(),
                    password: Some("secret".to_string()),
                    database: "app".to_string(),
                    tls: Default::default(),
                    max_connections: 20,
                },
            ],
            rules: vec![Rule {
                user: None,
                database: Some("app".to_string()),
                pooling_mode: PoolingMode::Transaction,
                auth: AuthMethod::Trust,
                password: None,
                default_shard: Some("sh1".to_string()),
                connection_limit: 1000,
            }],
            routes: vec![RouteEntryConfig {
                table: "orders".to_string(),
                shard: None,
                column: Some("customer_id".to_string()),
                ranges: vec![
                    KeyRangeConfig {
                        low: 0,
                        high: 999_999,
                        shard: "sh1".to_string(),
                    },
                    KeyRangeConfig {
                        low: 1_000_000,
                        high: i64::MAX,
                        shard: "sh2".to_string(),
                    },
                ],
            }],
            timeouts: Default::default(),
            health: Default::default(),
            logging: Default::default(),
        }
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}
