//! Pool configuration options

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::errors::{PoolError, PoolResult};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Endpoint and credentials handed to the [`ConnectionFactory`](crate::ConnectionFactory)
#[derive(Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ConnectOptions {
    pub url: String,
    pub user: String,
    #[cfg_attr(feature = "serde", serde(skip_serializing))]
    pub password: String,

    /// Driver hint; `None` lets the factory pick one from the url
    pub driver: Option<String>,

    /// Prepared statements each connection may cache, 0 disables caching.
    /// Filled in from [`PoolConfig::max_cached_statements_per_connection`].
    pub statement_cache_capacity: usize,
}

impl ConnectOptions {
    pub fn new(url: impl Into<String>, user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            user: user.into(),
            password: password.into(),
            driver: None,
            statement_cache_capacity: 0,
        }
    }

    pub fn with_driver(mut self, driver: impl Into<String>) -> Self {
        self.driver = Some(driver.into());
        self
    }
}

impl fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("url", &self.url)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("driver", &self.driver)
            .field("statement_cache_capacity", &self.statement_cache_capacity)
            .finish()
    }
}

/// Configuration for connection pool behavior
///
/// # Examples
///
/// ```
/// use esox_connpool::{ConnectOptions, PoolConfig};
/// use std::time::Duration;
///
/// let config = PoolConfig::new(ConnectOptions::new("db://localhost/app", "app", "secret"))
///     .with_sizing(2, 2, 8)
///     .with_max_wait(Duration::from_secs(5))
///     .with_abandoned_detection(Duration::from_secs(60), true);
///
/// assert_eq!(config.max_active, 8);
/// assert!(config.remove_abandoned);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct PoolConfig {
    /// Pool name, used in logs and metric labels
    pub name: String,

    /// Where and as whom to connect
    pub connect: ConnectOptions,

    /// Connections opened when the pool starts
    pub initial_size: usize,

    /// Idle connections the sweeper keeps around
    pub min_idle: usize,

    /// Upper bound on open connections, idle and borrowed together
    pub max_active: usize,

    /// Default borrow timeout; `None` waits indefinitely
    pub max_wait: Option<Duration>,

    /// Period of the eviction sweep; zero disables the sweeper
    pub eviction_interval: Duration,

    /// Idle time after which a connection becomes evictable
    pub min_evictable_idle: Duration,

    /// Delay before retrying after a failed open
    pub reconnect_backoff: Duration,

    /// Query used to probe connections
    pub validation_query: String,

    /// Bound on a single probe
    pub validation_timeout: Duration,

    /// Replacement attempts when validation on borrow keeps failing
    pub validation_retries: usize,

    pub validate_on_borrow: bool,
    pub validate_on_return: bool,
    pub validate_while_idle: bool,

    /// Reclaim connections borrowed for longer than `abandoned_timeout`
    pub remove_abandoned: bool,
    pub abandoned_timeout: Duration,

    /// Emit a warning for every reclaimed connection
    pub log_abandoned: bool,

    pub max_cached_statements_per_connection: usize,

    /// How long shutdown waits for borrowed connections to come back
    pub shutdown_grace: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            connect: ConnectOptions::default(),
            initial_size: 10,
            min_idle: 10,
            max_active: 100,
            max_wait: None,
            eviction_interval: Duration::from_secs(60),
            min_evictable_idle: Duration::from_secs(30 * 60),
            reconnect_backoff: Duration::from_millis(500),
            validation_query: "select 1".to_string(),
            validation_timeout: Duration::from_secs(5),
            validation_retries: 3,
            validate_on_borrow: false,
            validate_on_return: false,
            validate_while_idle: true,
            remove_abandoned: false,
            abandoned_timeout: Duration::from_secs(300),
            log_abandoned: false,
            max_cached_statements_per_connection: 10,
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

impl PoolConfig {
    /// Create a configuration with default values for the given endpoint
    pub fn new(connect: ConnectOptions) -> Self {
        Self {
            connect,
            ..Self::default()
        }
    }

    /// Load the `db.<name>.*` entries of a property map.
    ///
    /// `url`, `user` and `password` are required; everything else falls
    /// back to the defaults. Timing keys are in milliseconds and a negative
    /// `maxWait` means "wait forever".
    ///
    /// # Examples
    ///
    /// ```
    /// use esox_connpool::PoolConfig;
    /// use std::collections::HashMap;
    ///
    /// let mut props = HashMap::new();
    /// props.insert("db.orders.url".to_string(), "db://orders".to_string());
    /// props.insert("db.orders.user".to_string(), "svc".to_string());
    /// props.insert("db.orders.password".to_string(), "pw".to_string());
    /// props.insert("db.orders.maxActive".to_string(), "20".to_string());
    ///
    /// let config = PoolConfig::from_properties("orders", &props).unwrap();
    /// assert_eq!(config.max_active, 20);
    /// assert_eq!(config.min_idle, 10);
    /// ```
    pub fn from_properties(name: &str, props: &HashMap<String, String>) -> PoolResult<Self> {
        let reader = PropertyReader {
            prefix: format!("db.{}.", name),
            props,
        };
        let defaults = Self::default();

        let mut connect = ConnectOptions::new(
            reader.required("url")?,
            reader.required("user")?,
            reader.required("password")?,
        );
        connect.driver = reader.get("driver").map(str::to_string);

        let max_wait = match reader.parse::<i64>("maxWait")? {
            Some(ms) if ms >= 0 => Some(Duration::from_millis(ms as u64)),
            Some(_) => None,
            None => defaults.max_wait,
        };

        let config = Self {
            name: name.to_string(),
            connect,
            initial_size: reader.parse("initialSize")?.unwrap_or(defaults.initial_size),
            min_idle: reader.parse("minIdle")?.unwrap_or(defaults.min_idle),
            max_active: reader.parse("maxActive")?.unwrap_or(defaults.max_active),
            max_wait,
            eviction_interval: reader
                .millis("timeBetweenEvictionRunsMillis")?
                .unwrap_or(defaults.eviction_interval),
            min_evictable_idle: reader
                .millis("minEvictableIdleTimeMillis")?
                .unwrap_or(defaults.min_evictable_idle),
            reconnect_backoff: reader
                .millis("timeBetweenConnectErrorMillis")?
                .unwrap_or(defaults.reconnect_backoff),
            validation_query: reader
                .get("validationQuery")
                .map(str::to_string)
                .unwrap_or(defaults.validation_query),
            validation_timeout: reader
                .millis("validationQueryTimeoutMillis")?
                .unwrap_or(defaults.validation_timeout),
            validation_retries: defaults.validation_retries,
            validate_on_borrow: reader.flag("testOnBorrow")?.unwrap_or(defaults.validate_on_borrow),
            validate_on_return: reader.flag("testOnReturn")?.unwrap_or(defaults.validate_on_return),
            validate_while_idle: reader.flag("testWhileIdle")?.unwrap_or(defaults.validate_while_idle),
            remove_abandoned: reader.flag("removeAbandoned")?.unwrap_or(defaults.remove_abandoned),
            abandoned_timeout: reader
                .millis("removeAbandonedTimeoutMillis")?
                .unwrap_or(defaults.abandoned_timeout),
            log_abandoned: reader.flag("logAbandoned")?.unwrap_or(defaults.log_abandoned),
            max_cached_statements_per_connection: reader
                .parse("maxPoolPreparedStatementPerConnectionSize")?
                .unwrap_or(defaults.max_cached_statements_per_connection),
            shutdown_grace: defaults.shutdown_grace,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check the bounds the pool relies on
    pub fn validate(&self) -> PoolResult<()> {
        if self.connect.url.is_empty() {
            return Err(PoolError::configuration(format!(
                "pool '{}' has no connection url",
                self.name
            )));
        }
        if self.connect.user.is_empty() {
            return Err(PoolError::configuration(format!(
                "pool '{}' has no connection user",
                self.name
            )));
        }
        if self.max_active == 0 {
            return Err(PoolError::configuration("max_active must be greater than 0"));
        }
        if self.min_idle > self.max_active {
            return Err(PoolError::configuration(format!(
                "min_idle ({}) must not exceed max_active ({})",
                self.min_idle, self.max_active
            )));
        }
        if self.initial_size > self.max_active {
            return Err(PoolError::configuration(format!(
                "initial_size ({}) must not exceed max_active ({})",
                self.initial_size, self.max_active
            )));
        }
        if self.validation_timeout.is_zero() {
            return Err(PoolError::configuration("validation_timeout must be greater than zero"));
        }
        Ok(())
    }

    /// Connection options as the factory sees them
    pub(crate) fn effective_connect_options(&self) -> ConnectOptions {
        let mut options = self.connect.clone();
        options.statement_cache_capacity = self.max_cached_statements_per_connection;
        options
    }

    /// Set the pool name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set initial size, idle floor and capacity in one go
    pub fn with_sizing(mut self, initial_size: usize, min_idle: usize, max_active: usize) -> Self {
        self.initial_size = initial_size;
        self.min_idle = min_idle;
        self.max_active = max_active;
        self
    }

    /// Set the default borrow timeout
    pub fn with_max_wait(mut self, timeout: Duration) -> Self {
        self.max_wait = Some(timeout);
        self
    }

    /// Configure the eviction sweep
    pub fn with_eviction(mut self, interval: Duration, min_evictable_idle: Duration) -> Self {
        self.eviction_interval = interval;
        self.min_evictable_idle = min_evictable_idle;
        self
    }

    pub fn with_reconnect_backoff(mut self, backoff: Duration) -> Self {
        self.reconnect_backoff = backoff;
        self
    }

    /// Select when connections are probed
    pub fn with_validation(mut self, on_borrow: bool, on_return: bool, while_idle: bool) -> Self {
        self.validate_on_borrow = on_borrow;
        self.validate_on_return = on_return;
        self.validate_while_idle = while_idle;
        self
    }

    pub fn with_validation_query(mut self, query: impl Into<String>) -> Self {
        self.validation_query = query.into();
        self
    }

    /// Turn on leak detection
    pub fn with_abandoned_detection(mut self, timeout: Duration, log: bool) -> Self {
        self.remove_abandoned = true;
        self.abandoned_timeout = timeout;
        self.log_abandoned = log;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }
}

struct PropertyReader<'a> {
    prefix: String,
    props: &'a HashMap<String, String>,
}

impl PropertyReader<'_> {
    fn key(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    fn get(&self, name: &str) -> Option<&str> {
        self.props.get(&self.key(name)).map(|v| v.trim())
    }

    fn required(&self, name: &str) -> PoolResult<String> {
        self.get(name).map(str::to_string).ok_or_else(|| {
            PoolError::configuration(format!("missing required property {}", self.key(name)))
        })
    }

    fn parse<T: FromStr>(&self, name: &str) -> PoolResult<Option<T>> {
        match self.get(name) {
            None => Ok(None),
            Some(raw) => raw.parse().map(Some).map_err(|_| {
                PoolError::configuration(format!("invalid value '{}' for {}", raw, self.key(name)))
            }),
        }
    }

    fn millis(&self, name: &str) -> PoolResult<Option<Duration>> {
        Ok(self.parse::<u64>(name)?.map(Duration::from_millis))
    }

    fn flag(&self, name: &str) -> PoolResult<Option<bool>> {
        match self.get(name) {
            None => Ok(None),
            Some(raw) if raw.eq_ignore_ascii_case("true") => Ok(Some(true)),
            Some(raw) if raw.eq_ignore_ascii_case("false") => Ok(Some(false)),
            Some(raw) => Err(PoolError::configuration(format!(
                "invalid boolean '{}' for {}",
                raw,
                self.key(name)
            ))),
        }
    }
}
