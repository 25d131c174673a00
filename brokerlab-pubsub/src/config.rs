use brokerlab::transport::{AdvisoryDelay, DeadLetterMode};
use std::fmt;
use std::time::Duration;

/// Ack deadline given to subscriptions this crate creates.
pub const ACK_DEADLINE: Duration = Duration::from_secs(20);

/// Pub/Sub bounds a dead-letter policy's delivery attempts to this range.
pub const POLICY_ATTEMPTS: std::ops::RangeInclusive<u32> = 5..=100;

/// Command-line spelling of [`DeadLetterMode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum DeadLetterArg {
    #[default]
    Topic,
    Drop,
    BrokerPolicy,
}

impl From<DeadLetterArg> for DeadLetterMode {
    fn from(arg: DeadLetterArg) -> Self {
        match arg {
            DeadLetterArg::Topic => DeadLetterMode::Topic,
            DeadLetterArg::Drop => DeadLetterMode::Drop,
            DeadLetterArg::BrokerPolicy => DeadLetterMode::BrokerPolicy,
        }
    }
}

/// A dead-letter policy the broker cannot express.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnsupportedPolicy {
    pub max_attempts: u32,
}

impl fmt::Display for UnsupportedPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "broker dead-letter policy needs max attempts in {}..={}, got {}",
            POLICY_ATTEMPTS.start(),
            POLICY_ATTEMPTS.end(),
            self.max_attempts
        )
    }
}

impl std::error::Error for UnsupportedPolicy {}

/// Project, naming and delivery settings for the Pub/Sub transport.
#[derive(Debug, Clone, PartialEq, clap::Args)]
pub struct PubSubConfig {
    /// Google Cloud project id.
    #[arg(long = "pubsub-project", env = "PUBSUB_PROJECT", default_value = "demo-project")]
    pub project: String,
    /// Topic producers publish to.
    #[arg(long = "pubsub-topic", env = "PUBSUB_TOPIC", default_value = "events")]
    pub topic: String,
    /// Subscription workers pull from.
    #[arg(long = "pubsub-subscription", env = "PUBSUB_SUB", default_value = "worker-sub")]
    pub subscription: String,
    /// Dead-letter topic, used by the `topic` and `broker-policy` modes.
    #[arg(long = "pubsub-dlq-topic", env = "PUBSUB_DLQ_TOPIC", default_value = "events.dlq")]
    pub dlq_topic: String,
    /// Where exhausted and terminally failed messages go.
    #[arg(long = "dead-letter-mode", env = "DEAD_LETTER_MODE", value_enum, default_value_t)]
    pub dead_letter: DeadLetterArg,
    /// Sleep for the computed backoff before nacking instead of nacking at once.
    #[arg(long = "suspend-before-nack", env = "SUSPEND_BEFORE_NACK")]
    pub suspend_before_nack: bool,
    /// Messages a single subscriber may hold unacknowledged.
    #[arg(long = "max-outstanding", env = "PUBSUB_MAX_OUTSTANDING", default_value_t = 50)]
    pub max_outstanding: i64,
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            project: "demo-project".into(),
            topic: "events".into(),
            subscription: "worker-sub".into(),
            dlq_topic: "events.dlq".into(),
            dead_letter: DeadLetterArg::Topic,
            suspend_before_nack: false,
            max_outstanding: 50,
        }
    }
}

impl PubSubConfig {
    pub fn dead_letter_mode(&self) -> DeadLetterMode {
        self.dead_letter.into()
    }

    pub fn advisory_delay(&self) -> AdvisoryDelay {
        if self.suspend_before_nack {
            AdvisoryDelay::Suspend
        } else {
            AdvisoryDelay::Ignore
        }
    }

    /// Delivery-attempt ceiling for the subscription's dead-letter policy, when the mode uses
    /// one. The broker forwards on the nack that follows the last allowed delivery, so the
    /// ceiling equals the router's.
    pub fn policy_attempts(&self, max_attempts: u32) -> Result<Option<u32>, UnsupportedPolicy> {
        match self.dead_letter_mode() {
            DeadLetterMode::BrokerPolicy if POLICY_ATTEMPTS.contains(&max_attempts) => {
                Ok(Some(max_attempts))
            }
            DeadLetterMode::BrokerPolicy => Err(UnsupportedPolicy { max_attempts }),
            DeadLetterMode::Topic | DeadLetterMode::Drop => Ok(None),
        }
    }
}
