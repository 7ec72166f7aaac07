use serde::Deserialize;

/// Global application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string (counter store, delivery queues, socket channel)
    pub redis_url: String,

    /// Maximum number of PostgreSQL connections in the pool (default: 20)
    pub db_max_connections: u32,

    /// Port the HTTP API binds to (default: 3000)
    pub api_port: u16,

    /// Whether receivers without an explicit email preference get email
    pub default_send_email: bool,

    /// How often workers poll the delivery queues, in milliseconds (default: 500)
    pub worker_poll_interval_ms: u64,

    /// Maximum due jobs claimed per poll (default: 50)
    pub worker_batch_size: usize,

    /// Interval between unread-counter reconciliation passes; 0 disables it
    pub reconcile_interval_secs: u64,

    /// Optional JSON file with per-notifiable-type mailer overrides
    pub notify_registry_path: Option<String>,

    pub smtp: Option<SmtpConfig>,
}

/// Default SMTP port (STARTTLS).
const DEFAULT_SMTP_PORT: u16 = 587;

/// Default sender address when `SMTP_FROM` is not set.
const DEFAULT_FROM_ADDRESS: &str = "noreply@notice.local";

/// SMTP settings for the mail worker. Absent when `SMTP_HOST` is unset.
#[derive(Debug, Clone, Deserialize)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub from_address: String,
    pub user: Option<String>,
    pub password: Option<String>,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            database_url: std::env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL environment variable is required"))?,
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            db_max_connections: parse_env("DB_MAX_CONNECTIONS", 20)?,
            api_port: parse_env("API_PORT", 3000)?,
            default_send_email: parse_env("DEFAULT_SEND_EMAIL", false)?,
            worker_poll_interval_ms: parse_env("WORKER_POLL_INTERVAL_MS", 500)?,
            worker_batch_size: parse_env("WORKER_BATCH_SIZE", 50)?,
            reconcile_interval_secs: parse_env("RECONCILE_INTERVAL_SECS", 300)?,
            notify_registry_path: std::env::var("NOTIFY_REGISTRY_PATH").ok(),
            smtp: SmtpConfig::from_env()?,
        })
    }
}

impl SmtpConfig {
    /// Returns `None` if `SMTP_HOST` is not set, meaning mail jobs are logged
    /// and dropped instead of delivered.
    pub fn from_env() -> anyhow::Result<Option<Self>> {
        let Ok(host) = std::env::var("SMTP_HOST") else {
            return Ok(None);
        };

        Ok(Some(Self {
            host,
            port: parse_env("SMTP_PORT", DEFAULT_SMTP_PORT)?,
            from_address: std::env::var("SMTP_FROM")
                .unwrap_or_else(|_| DEFAULT_FROM_ADDRESS.to_string()),
            user: std::env::var("SMTP_USER").ok(),
            password: std::env::var("SMTP_PASSWORD").ok(),
        }))
    }
}

/// Read `name` from the environment, falling back to `default` when unset.
fn parse_env<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr,
{
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse().map_err(|_| {
            anyhow::anyhow!(
                "{} must be a valid {}",
                name,
                std::any::type_name::<T>()
            )
        }),
        Err(_) => Ok(default),
    }
}
