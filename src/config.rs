use std::env;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} is required but not set")]
    Missing(&'static str),
    #[error("{name} has an invalid value '{value}'")]
    Invalid { name: &'static str, value: String },
}

/// `test` skips the authorization gate so the bot can be exercised without
/// sharing the secret.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BotMode {
    Production,
    Test,
}

impl BotMode {
    pub fn requires_authorization(self) -> bool {
        matches!(self, BotMode::Production)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackend {
    Redis {
        host: String,
        port: u16,
        password: Option<String>,
    },
    Sqlite {
        database_url: String,
    },
}

#[derive(Debug, Clone)]
pub struct MidjourneyConfig {
    pub api_url: String,
    pub server_id: String,
    pub channel_id: String,
    pub token: String,
    pub session_id: String,
    pub poll_interval: Duration,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub max_restarts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub stable_after: Duration,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bot_token: String,
    pub mode: BotMode,
    pub auth_password: String,
    pub storage: StorageBackend,
    pub image_cache_ttl: Duration,
    pub midjourney: MidjourneyConfig,
    pub download_dir: PathBuf,
    pub supervisor: SupervisorConfig,
}

const DEFAULT_MJ_API_URL: &str = "https://discord.com/api/v9";
const DEFAULT_MJ_SESSION_ID: &str = "2fb980f65e5c9a77c96ca01f2c242cf6";
const DEFAULT_DATABASE_URL: &str = "sqlite://bot.db?mode=rwc";

/// Typed accessors over a variable lookup, so loading can be driven by the
/// process environment or by a fixed map in tests.
struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn raw(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|value| !value.trim().is_empty())
    }

    fn required(&self, name: &'static str) -> Result<String, ConfigError> {
        self.raw(name)
            .map(|value| value.trim().to_string())
            .ok_or(ConfigError::Missing(name))
    }

    fn string(&self, name: &str, default: &str) -> String {
        self.raw(name)
            .map(|value| value.trim().to_string())
            .unwrap_or_else(|| default.to_string())
    }

    fn u64(&self, name: &'static str, default: u64) -> Result<u64, ConfigError> {
        match self.raw(name) {
            None => Ok(default),
            Some(value) => value
                .trim()
                .parse::<u64>()
                .map_err(|_| ConfigError::Invalid { name, value }),
        }
    }

    fn u32(&self, name: &'static str, default: u32) -> Result<u32, ConfigError> {
        let value = self.u64(name, u64::from(default))?;
        u32::try_from(value).map_err(|_| ConfigError::Invalid {
            name,
            value: value.to_string(),
        })
    }

    fn port(&self, name: &'static str) -> Result<u16, ConfigError> {
        let value = self.required(name)?;
        value
            .parse::<u16>()
            .map_err(|_| ConfigError::Invalid { name, value })
    }
}

fn parse_mode(value: &str) -> BotMode {
    match value.trim().to_lowercase().as_str() {
        "test" => BotMode::Test,
        "production" | "prod" | "" => BotMode::Production,
        other => {
            warn!("Unknown BOT_MODE value '{other}'; defaulting to production.");
            BotMode::Production
        }
    }
}

/// Read on its own, ahead of `Config::load`, so warnings raised while loading
/// the rest of the configuration reach an installed subscriber.
pub fn log_level() -> String {
    log_level_from_lookup(|name| env::var(name).ok())
}

fn log_level_from_lookup<F>(lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    EnvReader { lookup }.string("LOG_LEVEL", "info").to_lowercase()
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvReader { lookup };

        let bot_token = env.required("BOT_TOKEN")?;
        let mode = parse_mode(&env.string("BOT_MODE", "production"));
        let auth_password = if mode.requires_authorization() {
            env.required("AUTH_PASSWORD")?
        } else {
            env.string("AUTH_PASSWORD", "")
        };

        let midjourney = MidjourneyConfig {
            server_id: env.required("MJ_SERVER_ID")?,
            channel_id: env.required("MJ_CHANNEL_ID")?,
            token: env.required("MJ_TOKEN")?,
            api_url: env
                .string("MJ_API_URL", DEFAULT_MJ_API_URL)
                .trim_end_matches('/')
                .to_string(),
            session_id: env.string("MJ_SESSION_ID", DEFAULT_MJ_SESSION_ID),
            poll_interval: Duration::from_secs(env.u64("MJ_POLL_INTERVAL_SECONDS", 3)?.max(1)),
            timeout: Duration::from_secs(env.u64("MJ_TIMEOUT_SECONDS", 600)?),
        };

        let storage = match env.string("STORAGE_BACKEND", "redis").to_lowercase().as_str() {
            "redis" => StorageBackend::Redis {
                host: env.required("REDIS_HOST")?,
                port: env.port("REDIS_PORT")?,
                password: env.raw("REDIS_PASSWORD"),
            },
            "sqlite" => StorageBackend::Sqlite {
                database_url: env.string("DATABASE_URL", DEFAULT_DATABASE_URL),
            },
            other => {
                return Err(ConfigError::Invalid {
                    name: "STORAGE_BACKEND",
                    value: other.to_string(),
                })
            }
        };

        let download_dir = env
            .raw("DOWNLOAD_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(env::temp_dir);

        let supervisor = SupervisorConfig {
            max_restarts: env.u32("SUPERVISOR_MAX_RESTARTS", 5)?,
            base_delay: Duration::from_millis(env.u64("SUPERVISOR_BASE_DELAY_MS", 1000)?),
            max_delay: Duration::from_secs(env.u64("SUPERVISOR_MAX_DELAY_SECONDS", 60)?),
            stable_after: Duration::from_secs(env.u64("SUPERVISOR_STABLE_AFTER_SECONDS", 300)?),
        };

        Ok(Config {
            bot_token,
            mode,
            auth_password,
            storage,
            image_cache_ttl: Duration::from_secs(env.u64("IMAGE_CACHE_TTL_SECONDS", 60 * 60 * 24)?),
            midjourney,
            download_dir,
            supervisor,
        })
    }
}
