use crate::client::ClientMiddlewareFunc;
use bytes::Bytes;
use core::time::Duration;
use lapin::types::{AMQPValue, FieldTable};

/// One RPC call, built fluently and consumed by [`Client::send`](crate::Client::send).
///
/// ```
/// use amqp_rpc::Request;
///
/// let request = Request::new()
///     .with_routing_key("myqueue")
///     .with_body("this is a message");
/// # let _ = request;
/// ```
///
/// A request can be cloned and sent more than once; every send assigns a
/// fresh correlation id unless one was set explicitly.
#[derive(Clone, Default)]
pub struct Request {
    pub exchange: String,
    pub routing_key: String,
    pub body: Bytes,
    pub headers: FieldTable,
    pub correlation_id: Option<String>,
    pub reply_expected: bool,
    /// Zero means "use the client default".
    pub timeout: Duration,
    pub mandatory: Option<bool>,
    pub immediate: Option<bool>,
    pub(crate) middlewares: Vec<ClientMiddlewareFunc>,
}

impl Request {
    pub fn new() -> Self {
        Request {
            reply_expected: true,
            ..Request::default()
        }
    }

    /// Routing key the request is published with. For direct bindings this
    /// is the queue name.
    pub fn with_routing_key<S: Into<String>>(mut self, routing_key: S) -> Self {
        self.routing_key = routing_key.into();
        self
    }

    /// Exchange to publish to. Empty means the default direct exchange.
    pub fn with_exchange<S: Into<String>>(mut self, exchange: S) -> Self {
        self.exchange = exchange.into();
        self
    }

    pub fn with_body<B: Into<Bytes>>(mut self, body: B) -> Self {
        self.body = body.into();
        self
    }

    /// Replaces the whole header table.
    pub fn with_headers(mut self, headers: FieldTable) -> Self {
        self.headers = headers;
        self
    }

    /// Sets a single header, keeping the rest of the table.
    pub fn with_header<K: Into<String>>(mut self, key: K, value: AMQPValue) -> Self {
        self.headers.insert(key.into().into(), value);
        self
    }

    /// Pins the correlation id instead of generating one per send. The id
    /// must be unique among the requests currently in flight.
    pub fn with_correlation_id<S: Into<String>>(mut self, correlation_id: S) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Whether a reply is expected. `false` turns the call into
    /// fire-and-forget: `send` resolves as soon as the publish (and the
    /// publisher confirm, when enabled) is accepted, with no delivery.
    pub fn with_response(mut self, reply_expected: bool) -> Self {
        self.reply_expected = reply_expected;
        self
    }

    /// Per-request deadline. Zero falls back to the client default; a client
    /// default of zero waits until reply or disconnect.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_mandatory(mut self, mandatory: bool) -> Self {
        self.mandatory = Some(mandatory);
        self
    }

    pub fn with_immediate(mut self, immediate: bool) -> Self {
        self.immediate = Some(immediate);
        self
    }

    /// Appends a middleware that runs for this request only, inside the
    /// client-wide middlewares.
    pub fn add_middleware(mut self, middleware: ClientMiddlewareFunc) -> Self {
        self.middlewares.push(middleware);
        self
    }
}
