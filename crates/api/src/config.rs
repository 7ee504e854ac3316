//! Application configuration loaded from environment variables.

use std::time::Duration;

use saga::OrderFulfillmentConfig;
use saga::order_fulfillment::{PAYMENT_ACTIVITY_TASK_QUEUE, SHIPPING_ACTIVITY_TASK_QUEUE};

/// Output format of the log subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl LogFormat {
    fn parse(value: &str) -> Self {
        if value.eq_ignore_ascii_case("json") {
            LogFormat::Json
        } else {
            LogFormat::Text
        }
    }
}

/// Server configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST` (default `"0.0.0.0"`) and `PORT` (default `3000`)
/// - `RUST_LOG` tracing filter directive (default `"info"`)
/// - `LOG_FORMAT` `text` or `json` (default `text`)
/// - `DATABASE_URL` PostgreSQL history store; in-memory when unset
/// - `WORKFLOW_ID_PREFIX` (default `"order"`)
/// - `PAYMENT_ACTIVITY_TASK_QUEUE`, `SHIPPING_ACTIVITY_TASK_QUEUE` queue names
/// - `WORKER_CONCURRENCY` activity slots per worker (default `4`)
/// - `SHUTDOWN_GRACE_SECS` worker drain timeout (default `30`)
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub database_url: Option<String>,
    pub workflow_id_prefix: String,
    pub payment_task_queue: String,
    pub shipping_task_queue: String,
    pub worker_concurrency: usize,
    pub shutdown_grace: Duration,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from any key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let string = |key: &str, default: String| lookup(key).unwrap_or(default);

        Self {
            host: string("HOST", defaults.host),
            port: lookup("PORT")
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            log_level: string("RUST_LOG", defaults.log_level),
            log_format: lookup("LOG_FORMAT")
                .map(|f| LogFormat::parse(&f))
                .unwrap_or(defaults.log_format),
            database_url: lookup("DATABASE_URL").filter(|url| !url.is_empty()),
            workflow_id_prefix: string("WORKFLOW_ID_PREFIX", defaults.workflow_id_prefix),
            payment_task_queue: string("PAYMENT_ACTIVITY_TASK_QUEUE", defaults.payment_task_queue),
            shipping_task_queue: string(
                "SHIPPING_ACTIVITY_TASK_QUEUE",
                defaults.shipping_task_queue,
            ),
            worker_concurrency: lookup("WORKER_CONCURRENCY")
                .and_then(|n| n.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.worker_concurrency),
            shutdown_grace: lookup("SHUTDOWN_GRACE_SECS")
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.shutdown_grace),
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Queue names for the order fulfillment activities, default retries.
    pub fn order_fulfillment(&self) -> OrderFulfillmentConfig {
        OrderFulfillmentConfig {
            payment_queue: self.payment_task_queue.clone(),
            shipping_queue: self.shipping_task_queue.clone(),
            ..OrderFulfillmentConfig::default()
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            database_url: None,
            workflow_id_prefix: "order".to_string(),
            payment_task_queue: PAYMENT_ACTIVITY_TASK_QUEUE.to_string(),
            shipping_task_queue: SHIPPING_ACTIVITY_TASK_QUEUE.to_string(),
            worker_concurrency: 4,
            shutdown_grace: Duration::from_secs(30),
        }
    }
}
