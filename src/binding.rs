use crate::handler::HandlerFunc;
use lapin::types::FieldTable;
use lapin::ExchangeKind;

/// One (exchange, queue, routing key, handler) tuple served by a
/// [`Server`](crate::Server).
///
/// Bindings are declared before `listen_and_serve` and are immutable
/// afterwards; each binding gets exactly one live consumer per broker
/// session.
#[derive(Clone)]
pub struct Binding {
    pub(crate) exchange: String,
    pub(crate) exchange_kind: ExchangeKind,
    /// Empty means the broker names the queue at declare time.
    pub(crate) queue_name: String,
    pub(crate) routing_key: String,
    pub(crate) bind_args: FieldTable,
    pub(crate) handler: HandlerFunc,
}

impl Binding {
    /// Consumes a queue named after the routing key on the default
    /// exchange. The default exchange routes by queue name, so no exchange
    /// declare or bind is issued.
    pub fn direct<S: Into<String>>(routing_key: S, handler: HandlerFunc) -> Self {
        let routing_key = routing_key.into();
        Binding {
            exchange: String::new(),
            exchange_kind: ExchangeKind::Direct,
            queue_name: routing_key.clone(),
            routing_key,
            bind_args: FieldTable::default(),
            handler,
        }
    }

    /// Declares a fanout exchange and consumes a server-named queue bound
    /// to it. Every server bound this way receives every message.
    pub fn fanout<S: Into<String>>(exchange: S, handler: HandlerFunc) -> Self {
        Binding {
            exchange: exchange.into(),
            exchange_kind: ExchangeKind::Fanout,
            queue_name: String::new(),
            routing_key: String::new(),
            bind_args: FieldTable::default(),
            handler,
        }
    }

    /// Declares a topic exchange and consumes a server-named queue bound
    /// with the given pattern (`*` and `#` wildcards per AMQP).
    pub fn topic<S: Into<String>, P: Into<String>>(
        exchange: S,
        pattern: P,
        handler: HandlerFunc,
    ) -> Self {
        Binding {
            exchange: exchange.into(),
            exchange_kind: ExchangeKind::Topic,
            queue_name: String::new(),
            routing_key: pattern.into(),
            bind_args: FieldTable::default(),
            handler,
        }
    }

    /// Declares a headers exchange and consumes a server-named queue bound
    /// with the given match arguments (including any `x-match` key).
    pub fn headers<S: Into<String>>(
        exchange: S,
        match_args: FieldTable,
        handler: HandlerFunc,
    ) -> Self {
        Binding {
            exchange: exchange.into(),
            exchange_kind: ExchangeKind::Headers,
            queue_name: String::new(),
            routing_key: String::new(),
            bind_args: match_args,
            handler,
        }
    }

    /// Overrides the queue name. Useful to share one durable queue between
    /// several servers bound to the same topic pattern.
    pub fn with_queue_name<S: Into<String>>(mut self, queue_name: S) -> Self {
        self.queue_name = queue_name.into();
        self
    }

    pub(crate) fn declares_exchange(&self) -> bool {
        !self.exchange.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler_fn;
    use lapin::types::AMQPValue;

    fn noop() -> HandlerFunc {
        handler_fn(|_ctx, rw, _d| async move { rw })
    }

    #[test]
    fn direct_uses_the_default_exchange() {
        let binding = Binding::direct("myqueue", noop());
        assert!(!binding.declares_exchange());
        assert_eq!(binding.queue_name, "myqueue");
        assert_eq!(binding.routing_key, "myqueue");
    }

    #[test]
    fn fanout_declares_a_server_named_queue() {
        let binding = Binding::fanout("broadcast", noop());
        assert!(binding.declares_exchange());
        assert_eq!(binding.exchange_kind, ExchangeKind::Fanout);
        assert!(binding.queue_name.is_empty());
        assert!(binding.routing_key.is_empty());
    }

    #[test]
    fn topic_binds_with_the_pattern() {
        let binding = Binding::topic("events", "user.#", noop());
        assert_eq!(binding.exchange_kind, ExchangeKind::Topic);
        assert_eq!(binding.routing_key, "user.#");
    }

    #[test]
    fn headers_carries_the_match_args() {
        let mut args = FieldTable::default();
        args.insert("x-match".into(), AMQPValue::LongString("all".into()));
        let binding = Binding::headers("audit", args.clone(), noop());
        assert_eq!(binding.exchange_kind, ExchangeKind::Headers);
        assert_eq!(binding.bind_args, args);
    }

    #[test]
    fn queue_name_can_be_pinned() {
        let binding = Binding::topic("events", "user.#", noop()).with_queue_name("user-events");
        assert_eq!(binding.queue_name, "user-events");
    }
}
