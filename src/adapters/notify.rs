//! Out-of-band operator alerting.
//!
//! Alerts are fire-and-forget: delivery failures are logged and never
//! propagate into the pipeline. Sub-critical duplicates are throttled so
//! a flapping component cannot spam the operator.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Alert severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
            Severity::Critical => "CRITICAL",
        };
        write!(f, "{name}")
    }
}

/// Fire-and-forget notification channel
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver an alert; must never fail the caller
    async fn alert(&self, severity: Severity, message: &str);
}

/// Notifier that only writes to the log
///
/// Used when no Telegram credentials are configured, and in tests.
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn alert(&self, severity: Severity, message: &str) {
        match severity {
            Severity::Critical => warn!(%severity, message, "alert"),
            _ => info!(%severity, message, "alert"),
        }
    }
}

/// Telegram Bot API notifier with duplicate throttling
pub struct TelegramNotifier {
    bot_token: String,
    chat_id: String,
    client: reqwest::Client,

    /// Minimum spacing between identical sub-critical alerts
    throttle: Duration,

    /// message hash -> last send time
    recent: Mutex<HashMap<String, Instant>>,
}

impl TelegramNotifier {
    pub fn new(bot_token: String, chat_id: String) -> Self {
        Self {
            bot_token,
            chat_id,
            client: reqwest::Client::new(),
            throttle: Duration::from_secs(15 * 60),
            recent: Mutex::new(HashMap::new()),
        }
    }

    /// Build from `TELEGRAM_BOT_TOKEN` / `TELEGRAM_CHAT_ID` env vars
    pub fn from_env() -> Option<Self> {
        let bot_token = std::env::var("TELEGRAM_BOT_TOKEN").ok()?;
        let chat_id = std::env::var("TELEGRAM_CHAT_ID").ok()?;
        Some(Self::new(bot_token, chat_id))
    }

    fn api_url(&self) -> String {
        format!("https://api.telegram.org/bot{}/sendMessage", self.bot_token)
    }

    fn message_hash(message: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(message.as_bytes());
        hex::encode(&hasher.finalize()[..8])
    }

    /// Whether this alert should go out; critical always does
    async fn should_send(&self, severity: Severity, message: &str) -> bool {
        if severity == Severity::Critical {
            return true;
        }

        let hash = Self::message_hash(message);
        let mut recent = self.recent.lock().await;

        // Drop entries past the throttle window so the map stays bounded
        recent.retain(|_, sent| sent.elapsed() < self.throttle);

        if recent.contains_key(&hash) {
            debug!(%hash, "alert throttled (duplicate)");
            return false;
        }

        recent.insert(hash, Instant::now());
        true
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn alert(&self, severity: Severity, message: &str) {
        if !self.should_send(severity, message).await {
            return;
        }

        let text = format!("[{severity}] {message}");
        let result = self
            .client
            .post(self.api_url())
            .json(&serde_json::json!({
                "chat_id": self.chat_id,
                "text": text,
            }))
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => {
                debug!(%severity, "alert delivered");
            }
            Ok(response) => {
                warn!(status = %response.status(), "alert delivery rejected");
            }
            Err(e) => {
                warn!(error = %e, "alert delivery failed");
            }
        }
    }
}
