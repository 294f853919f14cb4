use core::time::Duration;
use lapin::options::{
    BasicConsumeOptions, ExchangeDeclareOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::ConnectionProperties;

/// Default per-request timeout applied by the client. A zero timeout on the
/// client means "no timeout".
pub(crate) const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// How long `stop` waits for in-flight work before closing the transport.
pub(crate) const DEFAULT_GRACE_TIMEOUT: Duration = Duration::from_secs(30);

/// Options handed to the broker dial. The properties are passed through to
/// lapin untouched; TLS is conveyed by an `amqps://` URL.
#[derive(Clone, Default)]
pub struct DialConfig {
    pub properties: ConnectionProperties,
}

/// How queues are declared at session-ready time.
///
/// The server uses these for its bound queues, the client for its transient
/// reply queue (where [`QueueDeclareSettings::transient`] is the default).
#[derive(Clone, Debug, PartialEq)]
pub struct QueueDeclareSettings {
    pub durable: bool,
    pub auto_delete: bool,
    pub exclusive: bool,
    pub no_wait: bool,
    pub args: FieldTable,
}

impl Default for QueueDeclareSettings {
    fn default() -> Self {
        QueueDeclareSettings {
            durable: true,
            auto_delete: false,
            exclusive: false,
            no_wait: false,
            args: FieldTable::default(),
        }
    }
}

impl QueueDeclareSettings {
    /// Settings for a server-named queue that lives and dies with its
    /// consumer. Used for the client reply queue.
    pub fn transient() -> Self {
        QueueDeclareSettings {
            durable: false,
            auto_delete: true,
            exclusive: true,
            no_wait: false,
            args: FieldTable::default(),
        }
    }

    pub(crate) fn to_options(&self) -> QueueDeclareOptions {
        QueueDeclareOptions {
            passive: false,
            durable: self.durable,
            exclusive: self.exclusive,
            auto_delete: self.auto_delete,
            nowait: self.no_wait,
        }
    }
}

/// How consumers are set up on declared queues.
///
/// `qos_prefetch_count` caps unacked deliveries dispatched to one consumer.
/// An empty `consumer_tag` lets the broker assign one.
#[derive(Clone, Debug, PartialEq)]
pub struct ConsumeSettings {
    pub qos_prefetch_count: u16,
    pub consumer_tag: String,
    pub exclusive: bool,
    pub no_wait: bool,
    pub args: FieldTable,
}

impl Default for ConsumeSettings {
    fn default() -> Self {
        ConsumeSettings {
            qos_prefetch_count: 10,
            consumer_tag: String::new(),
            exclusive: false,
            no_wait: false,
            args: FieldTable::default(),
        }
    }
}

impl ConsumeSettings {
    pub(crate) fn to_options(&self) -> BasicConsumeOptions {
        BasicConsumeOptions {
            no_local: false,
            no_ack: false,
            exclusive: self.exclusive,
            nowait: self.no_wait,
        }
    }
}

/// How the server declares exchanges named by fanout/topic/headers bindings.
#[derive(Clone, Debug, PartialEq)]
pub struct ExchangeDeclareSettings {
    pub durable: bool,
    pub auto_delete: bool,
    pub internal: bool,
    pub no_wait: bool,
    pub args: FieldTable,
}

impl Default for ExchangeDeclareSettings {
    fn default() -> Self {
        ExchangeDeclareSettings {
            durable: true,
            auto_delete: false,
            internal: false,
            no_wait: false,
            args: FieldTable::default(),
        }
    }
}

impl ExchangeDeclareSettings {
    pub(crate) fn to_options(&self) -> ExchangeDeclareOptions {
        ExchangeDeclareOptions {
            passive: false,
            durable: self.durable,
            auto_delete: self.auto_delete,
            internal: self.internal,
            nowait: self.no_wait,
        }
    }
}

/// Default publish flags applied to requests that do not set their own.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PublishSettings {
    pub mandatory: bool,
    pub immediate: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_declare_defaults() {
        let settings = QueueDeclareSettings::default();
        assert!(settings.durable);
        assert!(!settings.auto_delete);
        assert!(!settings.exclusive);
        assert!(!settings.no_wait);
    }

    #[test]
    fn reply_queue_is_transient() {
        let settings = QueueDeclareSettings::transient();
        assert!(!settings.durable);
        assert!(settings.auto_delete);
        assert!(settings.exclusive);
    }

    #[test]
    fn consume_defaults() {
        let settings = ConsumeSettings::default();
        assert_eq!(settings.qos_prefetch_count, 10);
        assert_eq!(settings.consumer_tag, "");
        let options = settings.to_options();
        assert!(!options.no_ack, "deliveries are acked by the dispatcher");
    }

    #[test]
    fn exchange_declare_defaults() {
        let settings = ExchangeDeclareSettings::default();
        assert!(settings.durable);
        assert!(!settings.auto_delete);
        assert!(!settings.internal);
    }
}
