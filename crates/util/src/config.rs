use std::{collections::HashMap, env, fmt, net::SocketAddr, str::FromStr, time::Duration};

use subathon_core::{GiftWindowConfig, RateTable, Tier, TierRates};

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8080";

/// Loads `.env` when present. A missing file is not an error.
pub fn load_env_file() {
    let _ = dotenvy::dotenv();
}

/// Application runtime environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
    Test,
}

impl Environment {
    fn from_str(value: &str) -> Result<Self, ConfigError> {
        match value {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            "test" => Ok(Self::Test),
            other => Err(ConfigError::InvalidEnvironment(other.to_string())),
        }
    }

    /// Returns `true` when the current environment should behave as development.
    pub fn is_development(self) -> bool {
        matches!(self, Self::Development)
    }

    /// Returns the canonical name used for logging/metrics labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Test => "test",
        }
    }
}

/// Timer, exchange rate and aggregation settings.
#[derive(Debug, Clone)]
pub struct TimerConfig {
    pub starting_seconds: u64,
    pub max_cap_seconds: u64,
    pub start_running: bool,
    pub rates: RateTable,
    pub gift_window: GiftWindowConfig,
    pub dedup_capacity: usize,
    pub dedup_ttl: Duration,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            starting_seconds: 3600,
            max_cap_seconds: 86_400,
            start_running: false,
            rates: RateTable {
                cheer_seconds_per_bit: 0.05,
                follow_seconds: 0,
                subscription_seconds: TierRates::new(300, 600, 1500),
                bulk_gift_seconds: TierRates::new(240, 480, 1200),
                bulk_gift_threshold: 5,
                reward_seconds: HashMap::new(),
            },
            gift_window: GiftWindowConfig::default(),
            dedup_capacity: 10_000,
            dedup_ttl: Duration::from_secs(600),
        }
    }
}

impl TimerConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let base = &defaults.rates;
        let sub = &base.subscription_seconds;
        let bulk = &base.bulk_gift_seconds;

        let rates = RateTable {
            cheer_seconds_per_bit: read_var(
                "RATE_CHEER_SECONDS_PER_BIT",
                base.cheer_seconds_per_bit,
            )?,
            follow_seconds: read_var("RATE_FOLLOW_SECONDS", base.follow_seconds)?,
            subscription_seconds: TierRates::new(
                read_tier_var("RATE_SUB_TIER1_SECONDS", sub, Tier::Tier1)?,
                read_tier_var("RATE_SUB_TIER2_SECONDS", sub, Tier::Tier2)?,
                read_tier_var("RATE_SUB_TIER3_SECONDS", sub, Tier::Tier3)?,
            ),
            bulk_gift_seconds: TierRates::new(
                read_tier_var("RATE_BULK_GIFT_TIER1_SECONDS", bulk, Tier::Tier1)?,
                read_tier_var("RATE_BULK_GIFT_TIER2_SECONDS", bulk, Tier::Tier2)?,
                read_tier_var("RATE_BULK_GIFT_TIER3_SECONDS", bulk, Tier::Tier3)?,
            ),
            bulk_gift_threshold: read_var("RATE_BULK_GIFT_THRESHOLD", base.bulk_gift_threshold)?,
            reward_seconds: match env::var("RATE_REWARDS") {
                Ok(raw) => parse_reward_map(&raw)?,
                Err(_) => HashMap::new(),
            },
        };

        if !(rates.cheer_seconds_per_bit.is_finite() && rates.cheer_seconds_per_bit >= 0.0) {
            return Err(ConfigError::InvalidNumber {
                var: "RATE_CHEER_SECONDS_PER_BIT",
                value: rates.cheer_seconds_per_bit.to_string(),
            });
        }

        let gift_window = GiftWindowConfig {
            quiet_period: Duration::from_millis(read_var(
                "GIFT_QUIET_PERIOD_MS",
                defaults.gift_window.quiet_period.as_millis() as u64,
            )?),
            max_window: Duration::from_millis(read_var(
                "GIFT_MAX_WINDOW_MS",
                defaults.gift_window.max_window.as_millis() as u64,
            )?),
        };

        Ok(Self {
            starting_seconds: read_var("TIMER_STARTING_SECONDS", defaults.starting_seconds)?,
            max_cap_seconds: read_var("TIMER_MAX_CAP_SECONDS", defaults.max_cap_seconds)?,
            start_running: read_var("TIMER_START_RUNNING", defaults.start_running)?,
            rates,
            gift_window,
            dedup_capacity: read_var("DEDUP_CAPACITY", defaults.dedup_capacity)?,
            dedup_ttl: Duration::from_secs(read_var(
                "DEDUP_TTL_SECS",
                defaults.dedup_ttl.as_secs(),
            )?),
        })
    }
}

/// Runtime configuration resolved from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub environment: Environment,
    pub sse_heartbeat_secs: u64,
    pub timer: TimerConfig,
}

impl AppConfig {
    /// Constructs the configuration by reading and validating environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let env_value = env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());
        let environment = Environment::from_str(&env_value)?;
        let bind_addr: SocketAddr = read_var("APP_BIND_ADDR", DEFAULT_BIND_ADDR.to_string())?
            .parse()
            .map_err(ConfigError::BindAddress)?;

        Ok(Self {
            bind_addr,
            environment,
            sse_heartbeat_secs: read_var("SSE_HEARTBEAT_SECS", 20)?,
            timer: TimerConfig::from_env()?,
        })
    }
}

fn read_var<T: FromStr>(var: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(var) {
        Ok(raw) if !raw.trim().is_empty() => {
            raw.trim()
                .parse()
                .map_err(|_| ConfigError::InvalidNumber { var, value: raw })
        }
        _ => Ok(default),
    }
}

fn read_tier_var(var: &'static str, defaults: &TierRates, tier: Tier) -> Result<u64, ConfigError> {
    read_var(var, defaults.get(tier).unwrap_or_default())
}

/// Parses `reward-id=seconds` pairs separated by commas.
pub fn parse_reward_map(raw: &str) -> Result<HashMap<String, u64>, ConfigError> {
    let mut rewards = HashMap::new();
    for item in raw.split(',') {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }
        let (id, seconds) = item
            .split_once('=')
            .ok_or_else(|| ConfigError::InvalidRewardMapping(item.to_string()))?;
        let id = id.trim();
        let seconds = seconds
            .trim()
            .parse::<u64>()
            .map_err(|_| ConfigError::InvalidRewardMapping(item.to_string()))?;
        if id.is_empty() {
            return Err(ConfigError::InvalidRewardMapping(item.to_string()));
        }
        rewards.insert(id.to_string(), seconds);
    }
    Ok(rewards)
}

/// Errors that can occur during configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    InvalidEnvironment(String),
    BindAddress(std::net::AddrParseError),
    InvalidNumber { var: &'static str, value: String },
    InvalidRewardMapping(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEnvironment(value) => write!(
                f,
                "APP_ENV must be one of 'development', 'production', or 'test' (got {value})"
            ),
            Self::BindAddress(err) => write!(f, "invalid APP_BIND_ADDR value: {err}"),
            Self::InvalidNumber { var, value } => write!(f, "invalid {var} value: {value}"),
            Self::InvalidRewardMapping(item) => write!(
                f,
                "RATE_REWARDS entries must look like 'reward-id=seconds' (got {item})"
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ENV_GUARD;

    const TIMER_VARS: &[&str] = &[
        "TIMER_STARTING_SECONDS",
        "TIMER_MAX_CAP_SECONDS",
        "TIMER_START_RUNNING",
        "RATE_CHEER_SECONDS_PER_BIT",
        "RATE_SUB_TIER1_SECONDS",
        "RATE_REWARDS",
        "GIFT_QUIET_PERIOD_MS",
    ];

    fn clear_timer_vars() {
        for var in TIMER_VARS {
            env::remove_var(var);
        }
    }

    #[test]
    fn loads_defaults_in_development() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        env::remove_var("APP_ENV");
        env::remove_var("APP_BIND_ADDR");
        clear_timer_vars();

        let config = AppConfig::from_env().expect("config should load with defaults");
        assert_eq!(config.environment, Environment::Development);
        assert_eq!(config.bind_addr.to_string(), DEFAULT_BIND_ADDR);
        assert_eq!(config.timer.starting_seconds, 3600);
        assert!(!config.timer.start_running);
        assert_eq!(
            config.timer.rates.subscription_seconds.get(Tier::Tier1),
            Some(300)
        );
    }

    #[test]
    fn reads_bind_address_override() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        env::remove_var("APP_ENV");
        clear_timer_vars();

        env::set_var("APP_BIND_ADDR", "0.0.0.0:9000");
        let config = AppConfig::from_env().expect("custom address should parse");
        assert_eq!(config.bind_addr.to_string(), "0.0.0.0:9000");

        env::set_var("APP_BIND_ADDR", "not-an-address");
        let err = AppConfig::from_env().expect_err("invalid address should error");
        assert!(matches!(err, ConfigError::BindAddress(_)));

        env::remove_var("APP_BIND_ADDR");
    }

    #[test]
    fn rejects_invalid_environment() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        env::set_var("APP_ENV", "invalid");

        let err = AppConfig::from_env().expect_err("invalid env should error");
        assert!(matches!(err, ConfigError::InvalidEnvironment(value) if value == "invalid"));

        env::remove_var("APP_ENV");
    }

    #[test]
    fn reads_timer_and_rate_overrides() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        env::remove_var("APP_ENV");
        clear_timer_vars();
        env::set_var("TIMER_STARTING_SECONDS", "0");
        env::set_var("TIMER_MAX_CAP_SECONDS", "3600");
        env::set_var("TIMER_START_RUNNING", "true");
        env::set_var("RATE_SUB_TIER1_SECONDS", "30");
        env::set_var("RATE_REWARDS", "hydrate=60, extend = 4000");
        env::set_var("GIFT_QUIET_PERIOD_MS", "250");

        let config = AppConfig::from_env().expect("config should load");
        assert_eq!(config.timer.starting_seconds, 0);
        assert_eq!(config.timer.max_cap_seconds, 3600);
        assert!(config.timer.start_running);
        assert_eq!(
            config.timer.rates.subscription_seconds.get(Tier::Tier1),
            Some(30)
        );
        assert_eq!(config.timer.rates.reward_seconds("extend"), Some(4000));
        assert_eq!(
            config.timer.gift_window.quiet_period,
            Duration::from_millis(250)
        );

        clear_timer_vars();
    }

    #[test]
    fn rejects_non_numeric_values() {
        let _guard = ENV_GUARD.lock().expect("env guard poisoned");
        env::remove_var("APP_ENV");
        clear_timer_vars();
        env::set_var("TIMER_MAX_CAP_SECONDS", "forever");

        let err = AppConfig::from_env().expect_err("invalid number should error");
        assert!(matches!(
            err,
            ConfigError::InvalidNumber { var: "TIMER_MAX_CAP_SECONDS", .. }
        ));

        clear_timer_vars();
    }

    #[test]
    fn reward_map_requires_pairs() {
        assert!(matches!(
            parse_reward_map("hydrate"),
            Err(ConfigError::InvalidRewardMapping(_))
        ));
        assert!(parse_reward_map(" , ").expect("empty ok").is_empty());
    }
}
