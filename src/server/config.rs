use std::env;
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub max_clients: usize,
    pub enable_encryption: bool,
    pub log_level: String,
    pub session_expiry_days: u32,
    pub argon2_salt_length: u32,
    pub redis_url: Option<String>,
    pub ai_service_url: Option<String>,
    pub ai_api_key: Option<String>,
    pub ai_request_timeout_secs: u64,
    /// Minimum time between two AI-suggested groups for the same user and course.
    /// The default is a product decision awaiting confirmation.
    pub ai_group_cooldown_secs: i64,
    pub performance_log_path: String,
    pub performance_log_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5000,
            database_url: "sqlite:data/peerlink.db".to_string(),
            max_clients: 100,
            enable_encryption: false,
            log_level: "info".to_string(),
            session_expiry_days: 7,
            argon2_salt_length: 16,
            redis_url: None,
            ai_service_url: None,
            ai_api_key: None,
            ai_request_timeout_secs: 20,
            ai_group_cooldown_secs: 24 * 60 * 60,
            performance_log_path: "data/peerlink_performance.log".to_string(),
            performance_log_interval_secs: 120,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let defaults = Self::default();

        Self {
            host: env::var("SERVER_HOST").unwrap_or(defaults.host),
            port: parsed("SERVER_PORT", defaults.port),
            database_url: env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            max_clients: parsed("MAX_CLIENTS", defaults.max_clients),
            enable_encryption: env::var("ENABLE_ENCRYPTION")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(defaults.enable_encryption),
            log_level: env::var("LOG_LEVEL").unwrap_or(defaults.log_level),
            session_expiry_days: parsed("SESSION_EXPIRY_DAYS", defaults.session_expiry_days),
            argon2_salt_length: parsed("ARGON2_SALT_LENGTH", defaults.argon2_salt_length),
            redis_url: non_empty("REDIS_URL"),
            ai_service_url: non_empty("AI_SERVICE_URL"),
            ai_api_key: non_empty("AI_API_KEY"),
            ai_request_timeout_secs: parsed("AI_REQUEST_TIMEOUT_SECS", defaults.ai_request_timeout_secs),
            ai_group_cooldown_secs: parsed("AI_GROUP_COOLDOWN_SECS", defaults.ai_group_cooldown_secs),
            performance_log_path: env::var("PERFORMANCE_LOG_PATH").unwrap_or(defaults.performance_log_path),
            performance_log_interval_secs: parsed(
                "PERFORMANCE_LOG_INTERVAL_SECS",
                defaults.performance_log_interval_secs,
            ),
        }
    }
}

fn parsed<T: FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn non_empty(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}
