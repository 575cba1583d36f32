//! Engine configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

/// Output format of the tracing subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format: {other}")),
        }
    }
}

/// Fulfillment configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `OFFER_WINDOW_SECS`: how long a partner has to answer an offer (default: `30`)
/// - `MAX_OFFERS_PER_DISPATCH`: candidates offered per dispatch (default: `5`)
/// - `SWEEP_INTERVAL_SECS`: re-offer sweep period (default: `60`)
/// - `NOTIFY_TIMEOUT_MS`: upper bound on a notification call (default: `2000`)
/// - `RUST_LOG`: tracing filter directive (default: `"info"`)
/// - `LOG_FORMAT`: `text` or `json` (default: `text`)
#[derive(Debug, Clone)]
pub struct FulfillmentConfig {
    pub offer_window: Duration,
    pub max_offers_per_dispatch: usize,
    pub sweep_interval: Duration,
    pub notify_timeout: Duration,
    pub log_level: String,
    pub log_format: LogFormat,
}

impl FulfillmentConfig {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let number = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());

        Self {
            offer_window: number("OFFER_WINDOW_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.offer_window),
            max_offers_per_dispatch: number("MAX_OFFERS_PER_DISPATCH")
                .and_then(|n| usize::try_from(n).ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.max_offers_per_dispatch),
            sweep_interval: number("SWEEP_INTERVAL_SECS")
                .filter(|n| *n > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.sweep_interval),
            notify_timeout: number("NOTIFY_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.notify_timeout),
            log_level: lookup("RUST_LOG").unwrap_or(defaults.log_level),
            log_format: lookup("LOG_FORMAT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.log_format),
        }
    }

    /// Sets the offer window.
    pub fn with_offer_window(mut self, window: Duration) -> Self {
        self.offer_window = window;
        self
    }

    /// Sets how many candidates a single dispatch may offer to.
    pub fn with_max_offers(mut self, max: usize) -> Self {
        self.max_offers_per_dispatch = max;
        self
    }

    /// Sets the period of the spawned re-offer sweep.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Sets the upper bound on a single notification call.
    pub fn with_notify_timeout(mut self, timeout: Duration) -> Self {
        self.notify_timeout = timeout;
        self
    }
}

impl Default for FulfillmentConfig {
    fn default() -> Self {
        Self {
            offer_window: Duration::from_secs(30),
            max_offers_per_dispatch: 5,
            sweep_interval: Duration::from_secs(60),
            notify_timeout: Duration::from_millis(2000),
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
        }
    }
}
