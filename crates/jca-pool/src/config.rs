//! Pool configuration.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::PoolError;

/// Level of transaction support offered by the resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionSupportLevel {
    /// Connections are never enlisted.
    NoTransaction,
    /// Connections support resource-local transactions only.
    LocalTransaction,
    /// Connections take part in distributed (XA) transactions.
    #[default]
    XaTransaction,
}

impl FromStr for TransactionSupportLevel {
    type Err = PoolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "notransaction" | "none" => Ok(Self::NoTransaction),
            "localtransaction" | "local" => Ok(Self::LocalTransaction),
            "xatransaction" | "xa" => Ok(Self::XaTransaction),
            other => Err(PoolError::InvalidConfig(format!(
                "unknown transaction support: {other}"
            ))),
        }
    }
}

/// Which listeners a flush destroys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    /// Every listener, including those in use.
    All,
    /// Free listeners that fail validation.
    Invalid,
    /// Every free listener.
    Idle,
    /// Free listeners now; in-use listeners when they are returned.
    Gracefully,
}

/// What the pool does after a connection reports a fatal error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlushStrategy {
    /// Destroy only the failing connection.
    #[default]
    FailingConnectionOnly,
    /// Validate the free connections of the failing sub-pool.
    InvalidIdleConnections,
    /// Destroy the free connections of the failing sub-pool.
    IdleConnections,
    /// Gracefully flush the failing sub-pool.
    Gracefully,
    /// Destroy every connection of the failing sub-pool.
    EntirePool,
    /// Validate the free connections of every sub-pool.
    AllInvalidIdleConnections,
    /// Destroy the free connections of every sub-pool.
    AllIdleConnections,
    /// Gracefully flush every sub-pool.
    AllGracefully,
    /// Destroy every connection of every sub-pool.
    AllConnections,
}

impl FlushStrategy {
    /// The flush mode this strategy applies, if any.
    #[must_use]
    pub fn mode(self) -> Option<FlushMode> {
        match self {
            Self::FailingConnectionOnly => None,
            Self::InvalidIdleConnections | Self::AllInvalidIdleConnections => {
                Some(FlushMode::Invalid)
            }
            Self::IdleConnections | Self::AllIdleConnections => Some(FlushMode::Idle),
            Self::Gracefully | Self::AllGracefully => Some(FlushMode::Gracefully),
            Self::EntirePool | Self::AllConnections => Some(FlushMode::All),
        }
    }

    /// Whether the strategy reaches every sub-pool of the pool.
    #[must_use]
    pub fn is_pool_wide(self) -> bool {
        matches!(
            self,
            Self::AllInvalidIdleConnections
                | Self::AllIdleConnections
                | Self::AllGracefully
                | Self::AllConnections
        )
    }
}

impl FromStr for FlushStrategy {
    type Err = PoolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        match normalized.as_str() {
            "failingconnectiononly" => Ok(Self::FailingConnectionOnly),
            "invalididleconnections" => Ok(Self::InvalidIdleConnections),
            "idleconnections" => Ok(Self::IdleConnections),
            "gracefully" => Ok(Self::Gracefully),
            "entirepool" => Ok(Self::EntirePool),
            "allinvalididleconnections" => Ok(Self::AllInvalidIdleConnections),
            "allidleconnections" => Ok(Self::AllIdleConnections),
            "allgracefully" => Ok(Self::AllGracefully),
            "allconnections" => Ok(Self::AllConnections),
            _ => Err(PoolError::InvalidConfig(format!(
                "unknown flush strategy: {s}"
            ))),
        }
    }
}

impl fmt::Display for FlushStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Configuration for a managed connection pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Pool name used in logs.
    pub id: String,

    /// Minimum number of connections kept in the prefill sub-pool.
    pub min_size: u32,

    /// Number of connections created when the pool is prefilled.
    /// Defaults to `min_size`.
    pub initial_size: Option<u32>,

    /// Maximum number of physical connections across all sub-pools.
    pub max_size: u32,

    /// Whether the prefill sub-pool is filled eagerly.
    pub prefill: bool,

    /// How long an acquisition waits before failing.
    pub blocking_timeout: Duration,

    /// Whether free connections are validated in the background.
    pub background_validation: bool,

    /// Minimum age of a validation before a connection is checked again.
    pub background_validation_interval: Duration,

    /// Whether connections are validated when handed out.
    pub validate_on_match: bool,

    /// Stop scanning at the first invalid connection during validate-on-match.
    pub use_fast_fail: bool,

    /// How long a free connection may sit idle before it is destroyed.
    pub idle_timeout: Option<Duration>,

    /// Reaction to a fatal connection error.
    pub flush_strategy: FlushStrategy,

    /// Keep a separate sub-pool per credential. When disabled every
    /// request shares the prefill credential's sub-pool.
    pub pool_by_credential: bool,

    /// Extra acquisition attempts made by the connection manager.
    pub allocation_retry: u32,

    /// Pause between acquisition attempts.
    pub allocation_retry_wait: Duration,

    /// Transaction support level of the resource.
    pub transaction_support: TransactionSupportLevel,

    /// Destroy a connection whose handles are still open when its
    /// transaction completes.
    pub tracking: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            id: "default".to_string(),
            min_size: 0,
            initial_size: None,
            max_size: 20,
            prefill: false,
            blocking_timeout: Duration::from_secs(30),
            background_validation: false,
            background_validation_interval: Duration::from_secs(600),
            validate_on_match: false,
            use_fast_fail: false,
            idle_timeout: Some(Duration::from_secs(30 * 60)),
            flush_strategy: FlushStrategy::default(),
            pool_by_credential: true,
            allocation_retry: 0,
            allocation_retry_wait: Duration::from_secs(5),
            transaction_support: TransactionSupportLevel::default(),
            tracking: true,
        }
    }
}

impl PoolConfig {
    /// Create a new pool configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a `key=value;key=value` property string.
    ///
    /// Keys are case-insensitive. Unknown keys are ignored.
    pub fn from_properties(props: &str) -> Result<Self, PoolError> {
        let mut config = Self::default();

        for part in props.split(';') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }

            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| PoolError::InvalidConfig(format!("invalid key-value: {part}")))?;

            let key = key.trim().to_lowercase();
            let value = value.trim();

            match key.as_str() {
                "pool-name" | "id" | "name" => config.id = value.to_string(),
                "min-pool-size" | "min-size" => config.min_size = parse_u32(&key, value)?,
                "initial-pool-size" | "initial-size" => {
                    config.initial_size = Some(parse_u32(&key, value)?);
                }
                "max-pool-size" | "max-size" => config.max_size = parse_u32(&key, value)?,
                "prefill" => config.prefill = parse_bool(value),
                "blocking-timeout-millis" | "blocking-timeout" => {
                    config.blocking_timeout = Duration::from_millis(parse_u64(&key, value)?);
                }
                "background-validation" => config.background_validation = parse_bool(value),
                "background-validation-millis" | "background-validation-interval" => {
                    config.background_validation_interval =
                        Duration::from_millis(parse_u64(&key, value)?);
                }
                "validate-on-match" => config.validate_on_match = parse_bool(value),
                "use-fast-fail" => config.use_fast_fail = parse_bool(value),
                "idle-timeout-minutes" => {
                    let minutes = parse_u64(&key, value)?;
                    config.idle_timeout = (minutes > 0).then(|| Duration::from_secs(minutes * 60));
                }
                "idle-timeout-millis" => {
                    let millis = parse_u64(&key, value)?;
                    config.idle_timeout = (millis > 0).then(|| Duration::from_millis(millis));
                }
                "flush-strategy" => config.flush_strategy = value.parse()?,
                "pool-by-credential" => config.pool_by_credential = parse_bool(value),
                "allocation-retry" => config.allocation_retry = parse_u32(&key, value)?,
                "allocation-retry-wait-millis" => {
                    config.allocation_retry_wait = Duration::from_millis(parse_u64(&key, value)?);
                }
                "transaction-support" => config.transaction_support = value.parse()?,
                "tracking" => config.tracking = parse_bool(value),
                _ => {
                    tracing::debug!(key = %key, value = %value, "ignoring unknown pool property");
                }
            }
        }

        Ok(config)
    }

    /// Set the pool name.
    #[must_use]
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Set the minimum pool size.
    #[must_use]
    pub fn min_size(mut self, size: u32) -> Self {
        self.min_size = size;
        self
    }

    /// Set the initial prefill size.
    #[must_use]
    pub fn initial_size(mut self, size: u32) -> Self {
        self.initial_size = Some(size);
        self
    }

    /// Set the maximum pool size.
    #[must_use]
    pub fn max_size(mut self, size: u32) -> Self {
        self.max_size = size;
        self
    }

    /// Enable or disable prefill.
    #[must_use]
    pub fn prefill(mut self, enabled: bool) -> Self {
        self.prefill = enabled;
        self
    }

    /// Set the acquisition timeout.
    #[must_use]
    pub fn blocking_timeout(mut self, timeout: Duration) -> Self {
        self.blocking_timeout = timeout;
        self
    }

    /// Enable background validation with the given interval.
    #[must_use]
    pub fn background_validation(mut self, interval: Duration) -> Self {
        self.background_validation = true;
        self.background_validation_interval = interval;
        self
    }

    /// Enable or disable validate-on-match.
    #[must_use]
    pub fn validate_on_match(mut self, enabled: bool) -> Self {
        self.validate_on_match = enabled;
        self
    }

    /// Enable or disable fast fail.
    #[must_use]
    pub fn use_fast_fail(mut self, enabled: bool) -> Self {
        self.use_fast_fail = enabled;
        self
    }

    /// Set the idle timeout. `None` disables idle removal.
    #[must_use]
    pub fn idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set the flush strategy.
    #[must_use]
    pub fn flush_strategy(mut self, strategy: FlushStrategy) -> Self {
        self.flush_strategy = strategy;
        self
    }

    /// Enable or disable per-credential sub-pools.
    #[must_use]
    pub fn pool_by_credential(mut self, enabled: bool) -> Self {
        self.pool_by_credential = enabled;
        self
    }

    /// Set allocation retries and the wait between them.
    #[must_use]
    pub fn allocation_retry(mut self, retries: u32, wait: Duration) -> Self {
        self.allocation_retry = retries;
        self.allocation_retry_wait = wait;
        self
    }

    /// Set the transaction support level.
    #[must_use]
    pub fn transaction_support(mut self, level: TransactionSupportLevel) -> Self {
        self.transaction_support = level;
        self
    }

    /// Enable or disable handle tracking at transaction completion.
    #[must_use]
    pub fn tracking(mut self, enabled: bool) -> Self {
        self.tracking = enabled;
        self
    }

    /// Number of connections to create when prefilling.
    #[must_use]
    pub fn effective_initial_size(&self) -> u32 {
        self.initial_size.unwrap_or(self.min_size).min(self.max_size)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.max_size == 0 {
            return Err(PoolError::InvalidConfig(
                "max_size must be greater than 0".into(),
            ));
        }

        if self.min_size > self.max_size {
            return Err(PoolError::InvalidConfig(format!(
                "min_size ({}) cannot exceed max_size ({})",
                self.min_size, self.max_size
            )));
        }

        if let Some(initial) = self.initial_size {
            if initial > self.max_size {
                return Err(PoolError::InvalidConfig(format!(
                    "initial_size ({initial}) cannot exceed max_size ({})",
                    self.max_size
                )));
            }
        }

        if self.blocking_timeout.is_zero() {
            return Err(PoolError::InvalidConfig(
                "blocking_timeout must be greater than 0".into(),
            ));
        }

        if self.background_validation && self.background_validation_interval.is_zero() {
            return Err(PoolError::InvalidConfig(
                "background_validation_interval must be greater than 0".into(),
            ));
        }

        if self.idle_timeout.is_some_and(|t| t.is_zero()) {
            return Err(PoolError::InvalidConfig(
                "idle_timeout must be greater than 0".into(),
            ));
        }

        Ok(())
    }
}

fn parse_bool(value: &str) -> bool {
    value.eq_ignore_ascii_case("true") || value.eq_ignore_ascii_case("yes") || value == "1"
}

fn parse_u32(key: &str, value: &str) -> Result<u32, PoolError> {
    value
        .parse()
        .map_err(|_| PoolError::InvalidConfig(format!("invalid {key}: {value}")))
}

fn parse_u64(key: &str, value: &str) -> Result<u64, PoolError> {
    value
        .parse()
        .map_err(|_| PoolError::InvalidConfig(format!("invalid {key}: {value}")))
}
