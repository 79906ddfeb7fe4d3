/// All process-level configuration loaded from environment variables at
/// startup. Missing required variables cause an immediate panic with a
/// clear message. Tenant-level settings live in the store instead.
#[derive(Debug, Clone)]
pub struct Config {
    // Telegram API credentials shared by every account session
    pub telegram_api_id: i32,
    pub telegram_api_hash: String,

    // Operator notification bot
    pub notifier_token: Option<String>,

    // Database
    pub database_url: String,

    // Directory for per-account session blobs
    pub sessions_dir: String,

    // Worker loop cadence (seconds)
    pub tick_interval_secs: u64,

    // When true, workers run against the loopback connector and send
    // nothing to Telegram.
    pub dry_run: bool,

    // Warmup channel list file
    pub warmup_channels_path: String,

    // SMS vendor; the factory worker only starts when both are set
    pub sms_base_url: Option<String>,
    pub sms_api_key: Option<String>,
}

impl Config {
    /// Load all configuration from environment variables.
    /// Loads `.env` if present. Panics on any missing required variable.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv(); // ignore error if .env not present

        let telegram_api_id = required_env("TELEGRAM_API_ID")
            .parse::<i32>()
            .unwrap_or_else(|_| panic!("TELEGRAM_API_ID must be an integer"));

        Config {
            telegram_api_id,
            telegram_api_hash: required_env("TELEGRAM_API_HASH"),
            notifier_token: optional_env("NOTIFIER_BOT_TOKEN"),
            database_url: required_env("DATABASE_URL"),
            sessions_dir: optional_env("SESSIONS_DIR").unwrap_or_else(|| "sessions".to_string()),
            tick_interval_secs: optional_env("TICK_INTERVAL_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
            dry_run: optional_env("DRY_RUN")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            warmup_channels_path: optional_env("WARMUP_CHANNELS_PATH")
                .unwrap_or_else(|| "config/warmup_channels.toml".to_string()),
            sms_base_url: optional_env("SMS_BASE_URL"),
            sms_api_key: optional_env("SMS_API_KEY"),
        }
    }
}

fn required_env(key: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| {
        panic!("Required environment variable '{key}' is not set. Check your .env file.")
    })
}

fn optional_env(key: &str) -> Option<String> {
    std::env::var(key).ok()
}
