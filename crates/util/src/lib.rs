pub mod config;

pub use config::{
    load_env_file, parse_reward_map, AppConfig, ConfigError, Environment, TimerConfig,
};

// Environment variables are process-global; every env-mutating test takes this lock.
#[cfg(test)]
pub(crate) static ENV_GUARD: std::sync::LazyLock<std::sync::Mutex<()>> =
    std::sync::LazyLock::new(|| std::sync::Mutex::new(()));
