use std::time::Duration;

/// Default time a delivered message may stay unacknowledged before redelivery.
pub const DEFAULT_ACK_WAIT: Duration = Duration::from_secs(30);

/// The stream: a name and the subject patterns it captures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    pub name: String,
    pub subjects: Vec<String>,
}

impl StreamConfig {
    pub fn new(name: impl Into<String>, subjects: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            name: name.into(),
            subjects: subjects.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckPolicy {
    /// Every delivery must be acked; unacked deliveries are redelivered.
    Explicit,
    /// Deliveries are final as soon as they are fetched.
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliverPolicy {
    /// Start from the first message in the stream.
    All,
    /// Start after the last message present when the consumer is created.
    New,
}

/// Pull consumer configuration.
///
/// A consumer with a `durable_name` is created once and re-attached by name afterwards;
/// its cursor and pending acknowledgements survive the reattach. Without a name the
/// stream generates one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerConfig {
    pub durable_name: Option<String>,
    pub filter_subject: String,
    pub ack_policy: AckPolicy,
    pub deliver_policy: DeliverPolicy,
    pub ack_wait: Duration,
    /// Deliveries after which an unacked message is dropped. `None` retries forever.
    pub max_deliver: Option<u32>,
}

impl ConsumerConfig {
    /// A durable work consumer with explicit acknowledgement.
    pub fn durable(name: impl Into<String>, filter_subject: impl Into<String>) -> Self {
        Self {
            durable_name: Some(name.into()),
            filter_subject: filter_subject.into(),
            ack_policy: AckPolicy::Explicit,
            deliver_policy: DeliverPolicy::All,
            ack_wait: DEFAULT_ACK_WAIT,
            max_deliver: None,
        }
    }

    /// An ephemeral observer that sees only messages published after it attaches.
    pub fn monitor(filter_subject: impl Into<String>) -> Self {
        Self {
            durable_name: None,
            filter_subject: filter_subject.into(),
            ack_policy: AckPolicy::None,
            deliver_policy: DeliverPolicy::New,
            ack_wait: DEFAULT_ACK_WAIT,
            max_deliver: None,
        }
    }

    pub fn with_ack_wait(mut self, ack_wait: Duration) -> Self {
        self.ack_wait = ack_wait;
        self
    }

    pub fn with_max_deliver(mut self, max_deliver: Option<u32>) -> Self {
        self.max_deliver = max_deliver;
        self
    }
}
