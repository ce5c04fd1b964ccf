//! Notification dispatch with ordered fallback and capped exponential backoff.
//!
//! The dispatcher owns an ordered list of SMTP delivery configurations and a
//! process-wide "current configuration" index. Each send retries the current
//! configuration up to `max_retries` times with exponential backoff, then
//! advances to the next configuration. A success pins the index to the
//! configuration that worked, so later sends skip configurations already
//! known to be failing until the cycle wraps around.

use std::env;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::model::EngineError;

const DEFAULT_MAX_RETRIES: u32 = 3;
const BACKOFF_BASE_MS: u64 = 1_000;
const BACKOFF_CAP: Duration = Duration::from_secs(30);

// --- Delivery Configuration ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SmtpSecurity {
    /// TLS from the first byte (typically port 465).
    Implicit,
    /// Plaintext connection upgraded via STARTTLS (typically port 587).
    StartTls,
    /// No transport encryption. Local relays only.
    None,
}

/// One complete way of reaching the SMTP transport.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeliveryConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub security: SmtpSecurity,
}

impl DeliveryConfig {
    /// The default fallback ladder for a host: implicit TLS first, then
    /// STARTTLS submission, then the plain relay port as a last resort.
    pub fn standard_ladder(host: &str) -> Vec<DeliveryConfig> {
        vec![
            DeliveryConfig {
                name: "smtps".to_string(),
                host: host.to_string(),
                port: 465,
                security: SmtpSecurity::Implicit,
            },
            DeliveryConfig {
                name: "submission".to_string(),
                host: host.to_string(),
                port: 587,
                security: SmtpSecurity::StartTls,
            },
            DeliveryConfig {
                name: "smtp".to_string(),
                host: host.to_string(),
                port: 25,
                security: SmtpSecurity::None,
            },
        ]
    }
}

// --- Outgoing Message ---

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub to: String,
    pub cc: Vec<String>,
    pub subject: String,
    pub body: String,
}

/// Proof of delivery: which configuration accepted the message and how many
/// attempts it took across all configurations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReceipt {
    pub config_name: String,
    pub attempts: u32,
}

// --- Mailer Seam ---

/// A single delivery attempt error. Exhaustion across configurations is
/// reported separately as [`EngineError::DeliveryFailed`].
#[derive(Error, Debug, Clone)]
pub enum SendError {
    #[error("invalid address '{address}': {detail}")]
    Address { address: String, detail: String },
    #[error("message build failed: {0}")]
    Build(String),
    #[error("transport '{config}' failed: {detail}")]
    Transport { config: String, detail: String },
}

/// One attempt to hand a message to a transport using one configuration.
/// The dispatcher owns retries and fallback on top of this.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(
        &self,
        config: &DeliveryConfig,
        message: &OutgoingMessage,
    ) -> Result<(), SendError>;
}

/// Production mailer over lettre's async SMTP transport. Credentials are
/// taken from `SMTP_USERNAME` / `SMTP_PASSWORD` when both are set.
pub struct SmtpMailer {
    from: Mailbox,
}

impl SmtpMailer {
    pub fn new(from: &str) -> Result<Self, EngineError> {
        let from = from.parse::<Mailbox>().map_err(|e| {
            EngineError::config_invalid(format!("sender address '{}': {}", from, e))
        })?;
        Ok(Self { from })
    }

    fn transport_for(
        &self,
        config: &DeliveryConfig,
    ) -> Result<AsyncSmtpTransport<Tokio1Executor>, SendError> {
        let builder = match config.security {
            SmtpSecurity::Implicit => AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host),
            SmtpSecurity::StartTls => {
                AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
            }
            SmtpSecurity::None => {
                Ok(AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(
                    &config.host,
                ))
            }
        };
        let mut builder = builder
            .map_err(|e| SendError::Transport {
                config: config.name.clone(),
                detail: e.to_string(),
            })?
            .port(config.port);

        if let (Ok(username), Ok(password)) =
            (env::var("SMTP_USERNAME"), env::var("SMTP_PASSWORD"))
        {
            builder = builder.credentials(Credentials::new(username, password));
        }
        Ok(builder.build())
    }
}

fn parse_mailbox(address: &str) -> Result<Mailbox, SendError> {
    address.parse::<Mailbox>().map_err(|e| SendError::Address {
        address: address.to_string(),
        detail: e.to_string(),
    })
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(
        &self,
        config: &DeliveryConfig,
        message: &OutgoingMessage,
    ) -> Result<(), SendError> {
        let mut builder = Message::builder()
            .from(self.from.clone())
            .to(parse_mailbox(&message.to)?);
        for cc in &message.cc {
            builder = builder.cc(parse_mailbox(cc)?);
        }
        let email = builder
            .subject(&message.subject)
            .body(message.body.clone())
            .map_err(|e| SendError::Build(e.to_string()))?;

        let transport = self.transport_for(config)?;
        transport
            .send(email)
            .await
            .map_err(|e| SendError::Transport {
                config: config.name.clone(),
                detail: e.to_string(),
            })?;
        Ok(())
    }
}

// --- Dispatcher ---

pub struct Dispatcher {
    configs: Vec<DeliveryConfig>,
    mailer: Arc<dyn Mailer>,
    /// Sticky preference shared by all sends in the process.
    current: AtomicUsize,
    max_retries: u32,
    backoff_base_ms: u64,
    backoff_cap: Duration,
}

impl Dispatcher {
    pub fn new(configs: Vec<DeliveryConfig>, mailer: Arc<dyn Mailer>) -> Result<Self, EngineError> {
        if configs.is_empty() {
            return Err(EngineError::config_invalid(
                "at least one delivery configuration is required",
            ));
        }
        Ok(Self {
            configs,
            mailer,
            current: AtomicUsize::new(0),
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_base_ms: BACKOFF_BASE_MS,
            backoff_cap: BACKOFF_CAP,
        })
    }

    pub fn with_retry_policy(
        mut self,
        max_retries: u32,
        backoff_base_ms: u64,
        backoff_cap: Duration,
    ) -> Self {
        self.max_retries = max_retries;
        self.backoff_base_ms = backoff_base_ms;
        self.backoff_cap = backoff_cap;
        self
    }

    /// Index of the configuration the next send will try first.
    pub fn current_index(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    fn backoff_delay(&self, retry: u32) -> Duration {
        Duration::from_millis(self.backoff_base_ms * 2u64.pow(retry.min(5))).min(self.backoff_cap)
    }

    /// Delivers one message, walking the configuration ring from the current
    /// index. Exhausting every configuration's retries reports
    /// [`EngineError::DeliveryFailed`]; the caller records the deficiency
    /// either way.
    pub async fn send(&self, message: &OutgoingMessage) -> Result<DeliveryReceipt, EngineError> {
        let total = self.configs.len();
        let mut attempts: u32 = 0;
        let mut last_error: Option<SendError> = None;

        for _ in 0..total {
            let index = self.current.load(Ordering::SeqCst) % total;
            let config = &self.configs[index];

            for retry in 0..self.max_retries {
                attempts += 1;
                match self.mailer.send(config, message).await {
                    Ok(()) => {
                        info!(
                            config = %config.name,
                            attempts,
                            to = %message.to,
                            "Notification delivered"
                        );
                        return Ok(DeliveryReceipt {
                            config_name: config.name.clone(),
                            attempts,
                        });
                    }
                    Err(e) => {
                        warn!(config = %config.name, retry, "Delivery attempt failed: {}", e);
                        last_error = Some(e);
                        if retry + 1 < self.max_retries {
                            sleep(self.backoff_delay(retry)).await;
                        }
                    }
                }
            }

            // This configuration is out of retries; move the sticky index on.
            let next = (index + 1) % total;
            self.current.store(next, Ordering::SeqCst);
            warn!(
                exhausted = %config.name,
                next_index = next,
                "Delivery configuration exhausted, failing over"
            );
        }

        error!(to = %message.to, attempts, "All delivery configurations exhausted");
        Err(EngineError::DeliveryFailed {
            configs_tried: total,
            detail: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no attempts made".to_string()),
        })
    }
}

// --- Mock/Test Structures ---


#[cfg(test)]
mod tests {
    use super::testing::MockMailer;
    use super::*;

    fn test_config(name: &str) -> DeliveryConfig {
        DeliveryConfig {
            name: name.to_string(),
            host: "mail.example.com".to_string(),
            port: 2525,
            security: SmtpSecurity::None,
        }
    }

    fn test_configs() -> Vec<DeliveryConfig> {
        vec![test_config("c1"), test_config("c2"), test_config("c3")]
    }

    fn message() -> OutgoingMessage {
        OutgoingMessage {
            to: "worker@example.com".to_string(),
            cc: vec!["payroll@example.com".to_string()],
            subject: "Missing hours".to_string(),
            body: "You are 3 hours short.".to_string(),
        }
    }

    #[test]
    fn backoff_grows_exponentially_to_cap() {
        let dispatcher = Dispatcher::new(test_configs(), MockMailer::succeeding()).unwrap();
        assert_eq!(dispatcher.backoff_delay(0), Duration::from_secs(1));
        assert_eq!(dispatcher.backoff_delay(1), Duration::from_secs(2));
        assert_eq!(dispatcher.backoff_delay(2), Duration::from_secs(4));
        assert_eq!(dispatcher.backoff_delay(3), Duration::from_secs(8));
        assert_eq!(dispatcher.backoff_delay(4), Duration::from_secs(16));
        assert_eq!(dispatcher.backoff_delay(5), Duration::from_secs(30));
        assert_eq!(dispatcher.backoff_delay(9), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn falls_back_through_configs_until_one_succeeds() {
        let mailer = MockMailer::failing_configs(&["c1", "c2"]);
        let dispatcher = Dispatcher::new(test_configs(), mailer.clone()).unwrap();

        let receipt = dispatcher.send(&message()).await.unwrap();

        assert_eq!(receipt.config_name, "c3");
        assert_eq!(receipt.attempts, 7);
        assert_eq!(mailer.attempts_for("c1"), 3);
        assert_eq!(mailer.attempts_for("c2"), 3);
        assert_eq!(mailer.attempts_for("c3"), 1);
        assert_eq!(
            mailer.attempt_sequence(),
            vec!["c1", "c1", "c1", "c2", "c2", "c2", "c3"]
        );
        assert_eq!(dispatcher.current_index(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn sticky_index_prefers_last_successful_config() {
        let mailer = MockMailer::failing_configs(&["c1", "c2"]);
        let dispatcher = Dispatcher::new(test_configs(), mailer.clone()).unwrap();
        dispatcher.send(&message()).await.unwrap();

        // The next send goes straight to the configuration that worked.
        let receipt = dispatcher.send(&message()).await.unwrap();
        assert_eq!(receipt.config_name, "c3");
        assert_eq!(receipt.attempts, 1);
        assert_eq!(mailer.attempts_for("c3"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn success_leaves_current_index_unchanged() {
        let mailer = MockMailer::succeeding();
        let dispatcher = Dispatcher::new(test_configs(), mailer.clone()).unwrap();

        let receipt = dispatcher.send(&message()).await.unwrap();

        assert_eq!(receipt.config_name, "c1");
        assert_eq!(receipt.attempts, 1);
        assert_eq!(dispatcher.current_index(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_reports_failure_and_wraps_index() {
        let mailer = MockMailer::failing_configs(&["c1", "c2", "c3"]);
        let dispatcher = Dispatcher::new(test_configs(), mailer.clone()).unwrap();

        let result = dispatcher.send(&message()).await;

        if let Err(EngineError::DeliveryFailed { configs_tried, detail }) = result {
            assert_eq!(configs_tried, 3);
            assert!(detail.contains("connection refused"), "got: {}", detail);
        } else {
            panic!("expected DeliveryFailed, got {:?}", result);
        }
        assert_eq!(mailer.total_attempts(), 9);
        // Three advances wrap the ring back to the start.
        assert_eq!(dispatcher.current_index(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn recovered_config_is_used_after_wrap() {
        let mailer = MockMailer::failing_configs(&["c1", "c2", "c3"]);
        let dispatcher = Dispatcher::new(test_configs(), mailer.clone()).unwrap();
        dispatcher.send(&message()).await.unwrap_err();

        mailer.clear_failing("c1");
        let receipt = dispatcher.send(&message()).await.unwrap();
        assert_eq!(receipt.config_name, "c1");
        assert_eq!(receipt.attempts, 1);
    }

    #[test]
    fn empty_config_list_is_rejected() {
        let result = Dispatcher::new(Vec::new(), MockMailer::succeeding());
        if let Err(EngineError::ConfigInvalid { .. }) = result {
            // expected
        } else {
            panic!("expected ConfigInvalid");
        }
    }

    #[test]
    fn standard_ladder_orders_secure_first() {
        let ladder = DeliveryConfig::standard_ladder("mail.example.com");
        assert_eq!(ladder.len(), 3);
        assert_eq!(ladder[0].port, 465);
        assert_eq!(ladder[0].security, SmtpSecurity::Implicit);
        assert_eq!(ladder[1].port, 587);
        assert_eq!(ladder[1].security, SmtpSecurity::StartTls);
        assert_eq!(ladder[2].port, 25);
        assert_eq!(ladder[2].security, SmtpSecurity::None);
        assert!(ladder.iter().all(|c| c.host == "mail.example.com"));
    }

    #[test]
    fn transport_builds_for_each_security_mode() {
        let mailer = SmtpMailer::new("alerts@example.com").unwrap();
        for config in DeliveryConfig::standard_ladder("mail.example.com") {
            assert!(
                mailer.transport_for(&config).is_ok(),
                "transport should build for {}",
                config.name
            );
        }
    }

    #[test]
    fn invalid_sender_address_is_rejected() {
        let result = SmtpMailer::new("not-an-address");
        if let Err(EngineError::ConfigInvalid { .. }) = result {
            // expected
        } else {
            panic!("expected ConfigInvalid");
        }
    }

    #[tokio::test]
    async fn recipient_parse_failure_is_an_address_error() {
        let mailer = SmtpMailer::new("alerts@example.com").unwrap();
        let config = test_config("plain");
        let bad = OutgoingMessage {
            to: "not-an-address".to_string(),
            cc: Vec::new(),
            subject: "subject".to_string(),
            body: "body".to_string(),
        };

        let result = mailer.send(&config, &bad).await;
        if let Err(SendError::Address { address, .. }) = result {
            assert_eq!(address, "not-an-address");
        } else {
            panic!("expected SendError::Address, got {:?}", result.err());
        }
    }
}
