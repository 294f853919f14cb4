use crate::config::{
    ConsumeSettings, DialConfig, PublishSettings, QueueDeclareSettings, DEFAULT_GRACE_TIMEOUT,
    DEFAULT_TIMEOUT,
};
use crate::connection::{Publishing, Session, SessionHandles, SessionHooks};
use crate::errors::{ConnectionError, RpcError};
use crate::logging::{LogFunc, Logger};
use crate::request::Request;
use async_trait::async_trait;
use core::time::Duration;
use futures::future::BoxFuture;
use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::BasicQosOptions;
use lapin::BasicProperties;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

/// What a send resolves to: the correlated reply delivery, or `None` for a
/// fire-and-forget request.
pub type SendResult = Result<Option<Delivery>, RpcError>;

/// The terminal unit of sending on the client. Middlewares wrap it.
pub type SendFunc = Arc<dyn Fn(Request) -> BoxFuture<'static, SendResult> + Send + Sync>;

/// A transformer over a [`SendFunc`]. The first middleware added runs
/// outermost; per-request middlewares run inside the client-wide ones.
pub type ClientMiddlewareFunc = Arc<dyn Fn(SendFunc) -> SendFunc + Send + Sync>;

/// Wraps an async closure into a [`SendFunc`].
pub fn send_fn<F, Fut>(f: F) -> SendFunc
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = SendResult> + Send + 'static,
{
    Arc::new(move |request| Box::pin(f(request)))
}

/// Wraps a closure into a [`ClientMiddlewareFunc`].
pub fn client_middleware_fn<F>(f: F) -> ClientMiddlewareFunc
where
    F: Fn(SendFunc) -> SendFunc + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Composes middlewares around the terminal send, right to left, so the
/// first middleware ends up outermost.
pub(crate) fn chain_send<'a, I>(middlewares: I, terminal: SendFunc) -> SendFunc
where
    I: IntoIterator<Item = &'a ClientMiddlewareFunc>,
    I::IntoIter: DoubleEndedIterator,
{
    middlewares
        .into_iter()
        .rev()
        .fold(terminal, |next, middleware| middleware(next))
}

/// The set of requests waiting for replies, keyed by correlation id. Each
/// entry holds the single-shot slot its caller is parked on.
#[derive(Default)]
struct Correlator {
    in_flight: Mutex<HashMap<String, oneshot::Sender<Result<Delivery, RpcError>>>>,
}

impl Correlator {
    /// Inserts an entry for `correlation_id`. Ids must be unique among the
    /// requests currently in flight.
    fn register(
        &self,
        correlation_id: &str,
    ) -> Result<oneshot::Receiver<Result<Delivery, RpcError>>, RpcError> {
        let mut in_flight = self.in_flight.lock().unwrap();
        if in_flight.contains_key(correlation_id) {
            return Err(RpcError::BadRequest(format!(
                "correlation id '{correlation_id}' is already in flight"
            )));
        }
        let (tx, rx) = oneshot::channel();
        in_flight.insert(correlation_id.to_string(), tx);
        Ok(rx)
    }

    /// Hands `delivery` to the caller waiting on `correlation_id` and
    /// removes the entry. Returns false when nobody is waiting.
    fn complete(&self, correlation_id: &str, delivery: Delivery) -> bool {
        let slot = self.in_flight.lock().unwrap().remove(correlation_id);
        match slot {
            Some(tx) => tx.send(Ok(delivery)).is_ok(),
            None => false,
        }
    }

    fn remove(&self, correlation_id: &str) -> bool {
        self.in_flight
            .lock()
            .unwrap()
            .remove(correlation_id)
            .is_some()
    }

    /// Fails every waiting caller with `Disconnected`. Used on reply-stream
    /// loss and on `stop`.
    fn fail_all(&self) {
        let slots = std::mem::take(&mut *self.in_flight.lock().unwrap());
        for (_, tx) in slots {
            let _ = tx.send(Err(RpcError::Disconnected));
        }
    }

    fn len(&self) -> usize {
        self.in_flight.lock().unwrap().len()
    }
}

/// Removes the in-flight entry on every exit path of the send. Completion
/// removes the entry first, which makes the drop a no-op on success.
struct InFlightGuard<'a> {
    correlator: &'a Correlator,
    correlation_id: &'a str,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.correlator.remove(self.correlation_id);
    }
}

struct ClientCore {
    session: Arc<Session>,
    correlator: Correlator,
    reply_queue: Mutex<Option<Arc<str>>>,
    reply_queue_settings: QueueDeclareSettings,
    consume_settings: ConsumeSettings,
    publish_settings: PublishSettings,
    default_timeout: Duration,
    tracker: TaskTracker,
    logger: Logger,
}

#[async_trait]
impl SessionHooks for ClientCore {
    /// Declares a fresh server-named reply queue and starts the reply
    /// consumer on it. Runs once per successful dial, so every reconnect
    /// gets a new queue and a new `reply-to` address.
    async fn on_ready(
        self: Arc<Self>,
        session: Arc<Session>,
        handles: &SessionHandles,
    ) -> Result<(), ConnectionError> {
        let channel = &handles.in_channel;
        let queue = channel
            .queue_declare(
                "",
                self.reply_queue_settings.to_options(),
                self.reply_queue_settings.args.clone(),
            )
            .await?;
        let queue_name: Arc<str> = Arc::from(queue.name().as_str());
        if self.consume_settings.qos_prefetch_count > 0 {
            channel
                .basic_qos(
                    self.consume_settings.qos_prefetch_count,
                    BasicQosOptions::default(),
                )
                .await?;
        }
        let consumer = channel
            .basic_consume(
                &queue_name,
                &self.consume_settings.consumer_tag,
                self.consume_settings.to_options(),
                self.consume_settings.args.clone(),
            )
            .await?;
        *self.reply_queue.lock().unwrap() = Some(queue_name.clone());
        self.logger
            .debug(format_args!("consuming replies on '{queue_name}'"));

        let core = self.clone();
        let generation = handles.generation;
        self.tracker.spawn(async move {
            core.reply_loop(session, consumer, generation).await;
        });
        Ok(())
    }

    /// The old reply queue is gone with the session, so callers waiting on
    /// it can never be answered. Fail them and let them decide on a retry.
    fn on_disconnect(&self) {
        self.reply_queue.lock().unwrap().take();
        let pending = self.correlator.len();
        if pending > 0 {
            self.logger.debug(format_args!(
                "failing {pending} in-flight requests after disconnect"
            ));
        }
        self.correlator.fail_all();
    }
}

impl ClientCore {
    /// Fans replies from the reply queue out to their waiting callers.
    async fn reply_loop(&self, session: Arc<Session>, mut consumer: lapin::Consumer, generation: u64) {
        let shutdown = session.shutdown_token();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                next = consumer.next() => match next {
                    Some(Ok(delivery)) => self.route_reply(delivery),
                    Some(Err(err)) => {
                        self.logger.error(format_args!("reply consumer failed: {err}"));
                        session.report_trouble(generation);
                        break;
                    }
                    None => {
                        self.logger.debug(format_args!("reply stream closed"));
                        session.report_trouble(generation);
                        break;
                    }
                }
            }
        }
        self.correlator.fail_all();
    }

    fn route_reply(&self, delivery: Delivery) {
        let correlation_id = delivery
            .properties
            .correlation_id()
            .clone()
            .map(|id| id.to_string());
        match correlation_id {
            Some(id) => {
                if !self.correlator.complete(&id, delivery) {
                    // Usually a reply that lost the race against its timeout.
                    self.logger.debug(format_args!(
                        "discarding reply with unknown correlation id '{id}'"
                    ));
                }
            }
            None => self
                .logger
                .debug(format_args!("discarding reply without correlation id")),
        }
    }

    /// The register-then-publish protocol. The in-flight entry is inserted
    /// before the publish because the broker may deliver the reply before
    /// `basic_publish` returns to this task.
    async fn terminal_send(
        self: Arc<Self>,
        request: Request,
        cancellation: CancellationToken,
    ) -> SendResult {
        if request.routing_key.is_empty() {
            return Err(RpcError::BadRequest("request has no routing key".into()));
        }
        let timeout = if request.timeout.is_zero() {
            self.default_timeout
        } else {
            request.timeout
        };
        let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);

        tokio::select! {
            outcome = self.wait_ready(deadline) => outcome?,
            _ = cancellation.cancelled() => return Err(RpcError::Cancelled),
        }

        if !request.reply_expected {
            let publishing = self.to_publishing(&request, None, None, timeout);
            self.session.publish(publishing).await?;
            return Ok(None);
        }

        let correlation_id = request
            .correlation_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let reply_to = self
            .reply_queue
            .lock()
            .unwrap()
            .clone()
            .ok_or(RpcError::Disconnected)?;

        let receiver = self.correlator.register(&correlation_id)?;
        let _guard = InFlightGuard {
            correlator: &self.correlator,
            correlation_id: &correlation_id,
        };

        let publishing = self.to_publishing(&request, Some(&correlation_id), Some(&reply_to), timeout);
        self.session.publish(publishing).await?;

        let reply = async {
            match receiver.await {
                Ok(outcome) => outcome.map(Some),
                Err(_) => Err(RpcError::Disconnected),
            }
        };
        match deadline {
            Some(deadline) => tokio::select! {
                outcome = reply => outcome,
                _ = tokio::time::sleep_until(deadline) => Err(RpcError::Timeout),
                _ = cancellation.cancelled() => Err(RpcError::Cancelled),
            },
            None => tokio::select! {
                outcome = reply => outcome,
                _ = cancellation.cancelled() => Err(RpcError::Cancelled),
            },
        }
    }

    async fn wait_ready(&self, deadline: Option<Instant>) -> Result<(), RpcError> {
        match deadline {
            Some(deadline) => {
                match tokio::time::timeout_at(deadline, self.session.wait_ready()).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(RpcError::Timeout),
                }
            }
            None => self.session.wait_ready().await,
        }
    }

    fn to_publishing(
        &self,
        request: &Request,
        correlation_id: Option<&str>,
        reply_to: Option<&str>,
        timeout: Duration,
    ) -> Publishing {
        let mut properties = BasicProperties::default().with_headers(request.headers.clone());
        if let Some(correlation_id) = correlation_id {
            properties = properties.with_correlation_id(correlation_id.into());
        }
        if let Some(reply_to) = reply_to {
            properties = properties.with_reply_to(reply_to.into());
        }
        if !timeout.is_zero() {
            // Expire the request on the broker in step with the caller.
            properties = properties.with_expiration(timeout.as_millis().to_string().into());
        }
        Publishing {
            exchange: request.exchange.clone(),
            routing_key: request.routing_key.clone(),
            mandatory: request.mandatory.unwrap_or(self.publish_settings.mandatory),
            immediate: request.immediate.unwrap_or(self.publish_settings.immediate),
            body: request.body.clone(),
            properties,
        }
    }

    async fn shutdown(&self, supervisor: JoinHandle<()>, grace_timeout: Duration) {
        self.session.begin_close();
        self.correlator.fail_all();
        self.tracker.close();
        let drained = tokio::time::timeout(grace_timeout, async {
            let _ = supervisor.await;
            self.tracker.wait().await;
        })
        .await;
        if drained.is_err() {
            self.logger.error(format_args!(
                "grace timeout exceeded while stopping, abandoning in-flight work"
            ));
        }
    }
}

struct ClientRuntime {
    core: Arc<ClientCore>,
    supervisor: JoinHandle<()>,
}

/// The requesting endpoint.
///
/// Owns one broker session, a transient reply queue and the set of in-flight
/// requests. The session is dialed lazily on the first send and redialed
/// with backoff whenever the broker drops it; sends issued while the session
/// is down wait for `Ready` within their deadline.
///
/// Configuration methods are meant to be called before the first send.
pub struct Client {
    url: String,
    dial_config: DialConfig,
    confirm_mode: bool,
    default_timeout: Duration,
    grace_timeout: Duration,
    reply_queue_settings: QueueDeclareSettings,
    consume_settings: ConsumeSettings,
    publish_settings: PublishSettings,
    middlewares: Vec<ClientMiddlewareFunc>,
    logger: Logger,
    runtime: Mutex<Option<ClientRuntime>>,
}

impl Client {
    pub fn new<S: Into<String>>(url: S) -> Self {
        Client {
            url: url.into(),
            dial_config: DialConfig::default(),
            confirm_mode: false,
            default_timeout: DEFAULT_TIMEOUT,
            grace_timeout: DEFAULT_GRACE_TIMEOUT,
            reply_queue_settings: QueueDeclareSettings::transient(),
            consume_settings: ConsumeSettings::default(),
            publish_settings: PublishSettings::default(),
            middlewares: Vec::new(),
            logger: Logger::default(),
            runtime: Mutex::new(None),
        }
    }

    /// Default deadline for requests that do not set their own. Zero means
    /// no timeout: wait until reply or disconnect.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Enables publisher confirms on the output channel. Sends then block
    /// until the broker confirms the publish, and fire-and-forget sends
    /// report a nacked confirm as [`PublishError::ConfirmNack`](crate::PublishError::ConfirmNack).
    pub fn with_confirm_mode(mut self, confirm_mode: bool) -> Self {
        self.confirm_mode = confirm_mode;
        self
    }

    pub fn with_dial_config(mut self, dial_config: DialConfig) -> Self {
        self.dial_config = dial_config;
        self
    }

    /// Settings for the transient reply queue. The queue stays server-named
    /// regardless.
    pub fn with_queue_declare_settings(mut self, settings: QueueDeclareSettings) -> Self {
        self.reply_queue_settings = settings;
        self
    }

    pub fn with_consume_settings(mut self, settings: ConsumeSettings) -> Self {
        self.consume_settings = settings;
        self
    }

    /// Default `mandatory`/`immediate` flags for requests that do not set
    /// their own.
    pub fn with_publish_settings(mut self, settings: PublishSettings) -> Self {
        self.publish_settings = settings;
        self
    }

    /// How long [`stop`](Client::stop) waits for in-flight work.
    pub fn with_grace_timeout(mut self, grace_timeout: Duration) -> Self {
        self.grace_timeout = grace_timeout;
        self
    }

    pub fn with_debug_logger(mut self, logger: LogFunc) -> Self {
        self.logger.set_debug(logger);
        self
    }

    pub fn with_error_logger(mut self, logger: LogFunc) -> Self {
        self.logger.set_error(logger);
        self
    }

    /// Appends a middleware that wraps every send. The first one added runs
    /// outermost; per-request middlewares run inside these.
    pub fn add_middleware(mut self, middleware: ClientMiddlewareFunc) -> Self {
        self.middlewares.push(middleware);
        self
    }

    /// Sends `request` and waits for its outcome: the correlated reply, or
    /// `None` when the request was built with `with_response(false)`.
    pub async fn send(&self, request: Request) -> SendResult {
        self.send_with_cancellation(request, CancellationToken::new())
            .await
    }

    /// Like [`send`](Client::send), with a caller-provided cancellation.
    /// When the token fires first the send resolves to
    /// [`RpcError::Cancelled`] and the eventual late reply is discarded.
    pub async fn send_with_cancellation(
        &self,
        request: Request,
        cancellation: CancellationToken,
    ) -> SendResult {
        let core = self.ensure_started();
        let terminal = {
            let core = core.clone();
            send_fn(move |request| {
                let core = core.clone();
                let cancellation = cancellation.clone();
                async move { core.terminal_send(request, cancellation).await }
            })
        };
        let composed = chain_send(
            self.middlewares.iter().chain(request.middlewares.iter()),
            terminal,
        );
        composed(request).await
    }

    /// Fails all in-flight sends with [`RpcError::Disconnected`], drains
    /// them within the grace timeout and closes the broker session. The next
    /// send would dial a fresh session.
    pub async fn stop(&self) {
        let runtime = self.runtime.lock().unwrap().take();
        if let Some(ClientRuntime { core, supervisor }) = runtime {
            core.shutdown(supervisor, self.grace_timeout).await;
        }
    }

    fn ensure_started(&self) -> Arc<ClientCore> {
        let mut runtime = self.runtime.lock().unwrap();
        if let Some(runtime) = runtime.as_ref() {
            return runtime.core.clone();
        }
        self.logger.debug(format_args!("starting client session"));
        let session = Session::new(
            self.url.clone(),
            self.dial_config.clone(),
            self.confirm_mode,
            self.logger.clone(),
        );
        let core = Arc::new(ClientCore {
            session: session.clone(),
            correlator: Correlator::default(),
            reply_queue: Mutex::new(None),
            reply_queue_settings: self.reply_queue_settings.clone(),
            consume_settings: self.consume_settings.clone(),
            publish_settings: self.publish_settings,
            default_timeout: self.default_timeout,
            tracker: TaskTracker::new(),
            logger: self.logger.clone(),
        });
        let supervisor = session.start(core.clone());
        *runtime = Some(ClientRuntime {
            core: core.clone(),
            supervisor,
        });
        core
    }
}

/// A client dropped without [`stop`](Client::stop) still tears its session
/// down; in-flight work is abandoned rather than drained.
impl Drop for Client {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.lock().unwrap().take() {
            runtime.core.session.begin_close();
            runtime.core.correlator.fail_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::delivery;
    use lapin::types::AMQPValue;

    #[test]
    fn correlation_ids_are_unique_in_flight() {
        let correlator = Correlator::default();
        let _rx = correlator.register("id-1").unwrap();
        let err = correlator.register("id-1").unwrap_err();
        assert!(matches!(err, RpcError::BadRequest(_)));
        assert_eq!(correlator.len(), 1);
    }

    #[tokio::test]
    async fn complete_routes_the_delivery_to_the_registered_caller() {
        let correlator = Correlator::default();
        let rx = correlator.register("id-1").unwrap();

        let properties = BasicProperties::default().with_correlation_id("id-1".into());
        assert!(correlator.complete("id-1", delivery("reply", b"pong", properties)));
        assert_eq!(correlator.len(), 0);

        let reply = rx.await.unwrap().unwrap();
        assert_eq!(reply.data, b"pong");
    }

    #[test]
    fn unknown_correlation_ids_are_reported() {
        let correlator = Correlator::default();
        let late = delivery("reply", b"late", BasicProperties::default());
        assert!(!correlator.complete("gone", late));
    }

    #[tokio::test]
    async fn fail_all_disconnects_every_waiter() {
        let correlator = Correlator::default();
        let rx1 = correlator.register("id-1").unwrap();
        let rx2 = correlator.register("id-2").unwrap();

        correlator.fail_all();
        assert_eq!(correlator.len(), 0);

        assert!(matches!(rx1.await.unwrap(), Err(RpcError::Disconnected)));
        assert!(matches!(rx2.await.unwrap(), Err(RpcError::Disconnected)));
    }

    #[test]
    fn guard_removes_the_entry_unless_completed() {
        let correlator = Correlator::default();
        let _rx = correlator.register("id-1").unwrap();
        {
            let _guard = InFlightGuard {
                correlator: &correlator,
                correlation_id: "id-1",
            };
        }
        assert_eq!(correlator.len(), 0, "dropped send must clean up after itself");
    }

    #[tokio::test]
    async fn middlewares_wrap_outermost_first() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let tag = |label: &'static str, order: Arc<Mutex<Vec<&'static str>>>| {
            client_middleware_fn(move |next| {
                let order = order.clone();
                send_fn(move |request| {
                    let next = next.clone();
                    let order = order.clone();
                    async move {
                        order.lock().unwrap().push(label);
                        next(request).await
                    }
                })
            })
        };
        let terminal = {
            let order = order.clone();
            send_fn(move |_request| {
                let order = order.clone();
                async move {
                    order.lock().unwrap().push("terminal");
                    Ok(None)
                }
            })
        };

        let global = [tag("global", order.clone())];
        let request = Request::new().add_middleware(tag("request", order.clone()));
        let composed = chain_send(
            global.iter().chain(request.middlewares.iter()),
            terminal,
        );
        composed(request.clone()).await.unwrap();

        assert_eq!(*order.lock().unwrap(), vec!["global", "request", "terminal"]);
    }

    #[tokio::test]
    async fn same_list_wraps_identically_across_sends() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let tag = |label: &'static str, order: Arc<Mutex<Vec<&'static str>>>| {
            client_middleware_fn(move |next| {
                let order = order.clone();
                send_fn(move |request| {
                    let next = next.clone();
                    let order = order.clone();
                    async move {
                        order.lock().unwrap().push(label);
                        next(request).await
                    }
                })
            })
        };
        let terminal = {
            let order = order.clone();
            send_fn(move |_request| {
                let order = order.clone();
                async move {
                    order.lock().unwrap().push("terminal");
                    Ok(None)
                }
            })
        };

        let middlewares = [tag("m", order.clone()), tag("n", order.clone())];
        for routing_key in ["myqueue", "otherqueue"] {
            order.lock().unwrap().clear();
            let composed = chain_send(middlewares.iter(), terminal.clone());
            composed(Request::new().with_routing_key(routing_key))
                .await
                .unwrap();
            assert_eq!(*order.lock().unwrap(), vec!["m", "n", "terminal"]);
        }
    }

    #[tokio::test]
    async fn middlewares_can_rewrite_the_request() {
        let stamp = client_middleware_fn(|next| {
            send_fn(move |request: Request| {
                let next = next.clone();
                let request =
                    request.with_header("password", AMQPValue::LongString("hunter2".into()));
                next(request)
            })
        });
        let terminal = send_fn(|request: Request| async move {
            assert!(request
                .headers
                .inner()
                .contains_key(&lapin::types::ShortString::from("password")));
            Ok(None)
        });

        let composed = chain_send([&stamp], terminal);
        composed(Request::new().with_routing_key("myqueue"))
            .await
            .unwrap();
    }
}
