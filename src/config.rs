use std::time::Duration;

/// Process-wide configuration, resolved once at startup.
///
/// Every field maps to a `FLOWPROBE_*` environment variable; unset keys
/// fall back to the defaults below. A `.env` file is honored via dotenvy.
#[derive(Clone, Debug)]
pub struct AppConfig {
    /// `host:port` the control plane listens on.
    pub listen_addr: String,
    /// Driver + DSN, e.g. `sqlite://flowprobe.db` or `postgres://…`.
    pub database_url: String,
    /// Worker-pool bound for a single execution.
    pub max_concurrent_requests: usize,
    /// Token-bucket refill rate, requests per second.
    pub default_rate_limit_rps: f64,
    /// Fixed delay inserted between consecutive outbound requests.
    pub inter_request_delay_ms: u64,
    /// Per-request deadline.
    pub request_timeout_s: u64,
    /// Transport-error retries per request (HTTP statuses never retry).
    pub retry_attempts: u32,
    /// Execution aborts once failed/total exceeds this fraction.
    pub failure_threshold_pct: f64,
    /// Default confidence gate for `is_potential_vulnerability`.
    pub confidence_threshold_default: f64,
    /// Bodies above this size are truncated before storage.
    pub max_body_bytes: usize,
    /// Reports older than this are eligible for pruning.
    pub report_retention_days: u32,
    /// Origins allowed by the control plane's CORS layer.
    pub cors_allowed_origins: Vec<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8088".to_string(),
            database_url: "sqlite://flowprobe.db".to_string(),
            max_concurrent_requests: 5,
            default_rate_limit_rps: 10.0,
            inter_request_delay_ms: 0,
            request_timeout_s: 30,
            retry_attempts: 2,
            failure_threshold_pct: 0.10,
            confidence_threshold_default: 0.7,
            max_body_bytes: 1024 * 1024,
            report_retention_days: 30,
            cors_allowed_origins: vec!["*".to_string()],
        }
    }
}

impl AppConfig {
    /// Resolve configuration from the environment (and `.env`, if present).
    #[must_use]
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let defaults = Self::default();
        Self {
            listen_addr: env_string("FLOWPROBE_LISTEN_ADDR", defaults.listen_addr),
            database_url: env_string("FLOWPROBE_DATABASE_URL", defaults.database_url),
            max_concurrent_requests: env_parse(
                "FLOWPROBE_MAX_CONCURRENT_REQUESTS",
                defaults.max_concurrent_requests,
            ),
            default_rate_limit_rps: env_parse(
                "FLOWPROBE_DEFAULT_RATE_LIMIT_RPS",
                defaults.default_rate_limit_rps,
            ),
            inter_request_delay_ms: env_parse(
                "FLOWPROBE_INTER_REQUEST_DELAY_MS",
                defaults.inter_request_delay_ms,
            ),
            request_timeout_s: env_parse("FLOWPROBE_REQUEST_TIMEOUT_S", defaults.request_timeout_s),
            retry_attempts: env_parse("FLOWPROBE_RETRY_ATTEMPTS", defaults.retry_attempts),
            failure_threshold_pct: env_parse(
                "FLOWPROBE_FAILURE_THRESHOLD_PCT",
                defaults.failure_threshold_pct,
            ),
            confidence_threshold_default: env_parse(
                "FLOWPROBE_CONFIDENCE_THRESHOLD",
                defaults.confidence_threshold_default,
            ),
            max_body_bytes: env_parse("FLOWPROBE_MAX_BODY_BYTES", defaults.max_body_bytes),
            report_retention_days: env_parse(
                "FLOWPROBE_REPORT_RETENTION_DAYS",
                defaults.report_retention_days,
            ),
            cors_allowed_origins: std::env::var("FLOWPROBE_CORS_ALLOWED_ORIGINS")
                .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or(defaults.cors_allowed_origins),
        }
    }

    #[must_use]
    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = url.into();
        self
    }

    #[must_use]
    pub fn with_listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.listen_addr = addr.into();
        self
    }

    #[must_use]
    pub fn with_max_concurrent_requests(mut self, n: usize) -> Self {
        self.max_concurrent_requests = n.max(1);
        self
    }

    /// Per-request deadline as a `Duration`.
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_s)
    }
}

fn env_string(key: &str, default: String) -> String {
    std::env::var(key).unwrap_or(default)
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
