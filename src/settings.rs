//! Runtime settings
//!
//! All configuration is environment-driven. Defaults match a single-host
//! development deployment; production installs override via the environment
//! (or a `.env` file loaded by the binary).

use std::env;
use std::time::Duration;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.as_str(), "1" | "true" | "True" | "yes"))
        .unwrap_or(default)
}

/// Panel runtime settings
#[derive(Debug, Clone)]
pub struct Settings {
    /// Bind host for the HTTP API
    pub host: String,
    /// Bind port for the HTTP API
    pub port: u16,
    /// Database URL (sqlite path or `sqlite::memory:`)
    pub db_url: String,
    /// Allowed CORS origins; empty means same-origin only
    pub allowed_origins: Vec<String>,
    /// URL path prefix for subscription retrieval
    pub subscription_path: String,
    /// Title clients show for the delivered profile
    pub subscription_profile_title: String,
    /// Support URL advertised in subscription headers
    pub subscription_support_url: String,
    /// Client refresh interval in hours, advertised in subscription headers
    pub subscription_update_interval: u32,
    /// Usernames that are sudo regardless of the stored flag
    pub superusers: Vec<String>,
    /// Admin token lifetime; zero disables expiry
    pub admin_token_ttl_minutes: u64,
    /// Default auto-delete window for expired users, in days; negative disables
    pub users_autodelete_days: i64,
    /// Whether auto-delete also removes limited users
    pub autodelete_include_limited: bool,
    /// Directory certificate exports are written to
    pub cert_export_dir: String,

    pub health_check_interval: Duration,
    pub usage_collect_interval: Duration,
    pub usage_aggregate_interval: Duration,
    pub review_interval: Duration,
    pub bandwidth_sample_interval: Duration,

    pub disable_usage_recording: bool,
    pub disable_periodic_jobs: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            db_url: "sqlite://panel.db".to_string(),
            allowed_origins: Vec::new(),
            subscription_path: "sub".to_string(),
            subscription_profile_title: "VPN Subscription".to_string(),
            subscription_support_url: String::new(),
            subscription_update_interval: 12,
            superusers: Vec::new(),
            admin_token_ttl_minutes: 1440,
            users_autodelete_days: -1,
            autodelete_include_limited: false,
            cert_export_dir: "certs".to_string(),
            health_check_interval: Duration::from_secs(10),
            usage_collect_interval: Duration::from_secs(10),
            usage_aggregate_interval: Duration::from_secs(60),
            review_interval: Duration::from_secs(30),
            bandwidth_sample_interval: Duration::from_secs(2),
            disable_usage_recording: false,
            disable_periodic_jobs: false,
        }
    }
}

impl Settings {
    /// Load settings from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Settings::default();
        Self {
            host: env::var("PANEL_HOST").unwrap_or(defaults.host),
            port: env_or("PANEL_PORT", defaults.port),
            db_url: env::var("PANEL_DB_URL").unwrap_or(defaults.db_url),
            allowed_origins: env::var("PANEL_ALLOWED_ORIGINS")
                .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or_default(),
            subscription_path: env::var("PANEL_SUBSCRIPTION_PATH")
                .unwrap_or(defaults.subscription_path),
            subscription_profile_title: env::var("PANEL_SUB_PROFILE_TITLE")
                .unwrap_or(defaults.subscription_profile_title),
            subscription_support_url: env::var("PANEL_SUB_SUPPORT_URL")
                .unwrap_or(defaults.subscription_support_url),
            subscription_update_interval: env_or(
                "PANEL_SUB_UPDATE_INTERVAL",
                defaults.subscription_update_interval,
            ),
            superusers: env::var("PANEL_SUPERUSERS")
                .map(|v| v.split(',').map(|s| s.trim().to_lowercase()).collect())
                .unwrap_or_default(),
            admin_token_ttl_minutes: env_or(
                "PANEL_ADMIN_TOKEN_TTL_MINUTES",
                defaults.admin_token_ttl_minutes,
            ),
            users_autodelete_days: env_or("PANEL_USERS_AUTODELETE_DAYS", defaults.users_autodelete_days),
            autodelete_include_limited: env_flag(
                "PANEL_AUTODELETE_INCLUDE_LIMITED",
                defaults.autodelete_include_limited,
            ),
            cert_export_dir: env::var("PANEL_CERT_EXPORT_DIR").unwrap_or(defaults.cert_export_dir),
            health_check_interval: Duration::from_secs(env_or("PANEL_JOB_HEALTH_CHECK_SECONDS", 10)),
            usage_collect_interval: Duration::from_secs(env_or("PANEL_JOB_USAGE_COLLECT_SECONDS", 10)),
            usage_aggregate_interval: Duration::from_secs(env_or("PANEL_JOB_USAGE_AGGREGATE_SECONDS", 60)),
            review_interval: Duration::from_secs(env_or("PANEL_JOB_REVIEW_SECONDS", 30)),
            bandwidth_sample_interval: Duration::from_secs(env_or("PANEL_JOB_BANDWIDTH_SECONDS", 2)),
            disable_usage_recording: env_flag("PANEL_DISABLE_USAGE_RECORDING", false),
            disable_periodic_jobs: env_flag("PANEL_DISABLE_PERIODIC_JOBS", false),
        }
    }
}
