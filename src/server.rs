use crate::binding::Binding;
use crate::config::{
    ConsumeSettings, DialConfig, ExchangeDeclareSettings, QueueDeclareSettings,
    DEFAULT_GRACE_TIMEOUT,
};
use crate::connection::{Publishing, Session, SessionHandles, SessionHooks};
use crate::errors::{ConnectionError, RpcError};
use crate::handler::{chain, Context, HandlerFunc, MiddlewareFunc};
use crate::logging::{LogFunc, Logger};
use crate::response::ResponseWriter;
use async_trait::async_trait;
use bytes::Bytes;
use core::time::Duration;
use futures::FutureExt;
use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{BasicAckOptions, BasicNackOptions, BasicQosOptions, QueueBindOptions};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;

/// Header set on a reply when the handler aborted instead of answering.
pub const ERROR_HEADER: &str = "rpc-error";

/// Invoked once per ready transition with the four live broker handles:
/// input connection, output connection, input channel, output channel.
pub type OnStartedFunc = Arc<dyn Fn(&Connection, &Connection, &Channel, &Channel) + Send + Sync>;

struct ServerCore {
    session: Arc<Session>,
    bindings: Vec<Binding>,
    middlewares: Vec<MiddlewareFunc>,
    on_started: Vec<OnStartedFunc>,
    auto_ack: bool,
    queue_declare_settings: QueueDeclareSettings,
    consume_settings: ConsumeSettings,
    exchange_declare_settings: ExchangeDeclareSettings,
    tracker: TaskTracker,
    logger: Logger,
}

#[async_trait]
impl SessionHooks for ServerCore {
    /// Declares the bound topology and launches one consumer per binding,
    /// then fires the `on_started` callbacks. Runs once per successful dial,
    /// which re-arms every binding after a reconnect.
    async fn on_ready(
        self: Arc<Self>,
        session: Arc<Session>,
        handles: &SessionHandles,
    ) -> Result<(), ConnectionError> {
        let channel = &handles.in_channel;
        if self.consume_settings.qos_prefetch_count > 0 {
            channel
                .basic_qos(
                    self.consume_settings.qos_prefetch_count,
                    BasicQosOptions::default(),
                )
                .await?;
        }
        for binding in &self.bindings {
            if binding.declares_exchange() {
                channel
                    .exchange_declare(
                        &binding.exchange,
                        binding.exchange_kind.clone(),
                        self.exchange_declare_settings.to_options(),
                        self.exchange_declare_settings.args.clone(),
                    )
                    .await?;
            }
            let queue = channel
                .queue_declare(
                    &binding.queue_name,
                    self.queue_declare_settings.to_options(),
                    self.queue_declare_settings.args.clone(),
                )
                .await?;
            let queue_name: Arc<str> = Arc::from(queue.name().as_str());
            if binding.declares_exchange() {
                channel
                    .queue_bind(
                        &queue_name,
                        &binding.exchange,
                        &binding.routing_key,
                        QueueBindOptions::default(),
                        binding.bind_args.clone(),
                    )
                    .await?;
            }
            let consumer = channel
                .basic_consume(
                    &queue_name,
                    &consumer_tag(&self.consume_settings.consumer_tag, &queue_name),
                    self.consume_settings.to_options(),
                    self.consume_settings.args.clone(),
                )
                .await?;

            let core = self.clone();
            let session = session.clone();
            let handler = chain(&self.middlewares, binding.handler.clone());
            let generation = handles.generation;
            self.tracker.spawn(async move {
                core.consume_loop(session, consumer, queue_name, handler, generation)
                    .await;
            });
        }
        for callback in &self.on_started {
            callback(
                &handles.in_connection,
                &handles.out_connection,
                &handles.in_channel,
                &handles.out_channel,
            );
        }
        Ok(())
    }

    fn on_disconnect(&self) {}
}

impl ServerCore {
    /// Processes deliveries of one binding sequentially, which preserves the
    /// broker's per-queue ordering when the prefetch allows it.
    async fn consume_loop(
        &self,
        session: Arc<Session>,
        mut consumer: lapin::Consumer,
        queue_name: Arc<str>,
        handler: HandlerFunc,
        generation: u64,
    ) {
        let shutdown = session.shutdown_token();
        self.logger
            .debug(format_args!("consuming requests on '{queue_name}'"));
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                next = consumer.next() => match next {
                    Some(Ok(delivery)) => {
                        self.dispatch(&session, &queue_name, &handler, delivery).await;
                    }
                    Some(Err(err)) => {
                        self.logger.error(format_args!(
                            "consumer on '{queue_name}' failed: {err}"
                        ));
                        session.report_trouble(generation);
                        break;
                    }
                    None => {
                        self.logger
                            .debug(format_args!("consumer stream on '{queue_name}' closed"));
                        session.report_trouble(generation);
                        break;
                    }
                }
            }
        }
    }

    async fn dispatch(
        &self,
        session: &Arc<Session>,
        queue_name: &Arc<str>,
        handler: &HandlerFunc,
        delivery: Delivery,
    ) {
        let delivery = Arc::new(delivery);
        let ctx = Context::new(queue_name.clone(), session.shutdown_token().child_token());
        let rw = ResponseWriter::default();
        let outcome = AssertUnwindSafe(handler(ctx, rw, delivery.clone()))
            .catch_unwind()
            .await;
        match outcome {
            Ok(rw) => self.finish(session, &delivery, rw).await,
            Err(panic) => self.recover(session, &delivery, panic).await,
        }
    }

    /// Publishes the reply when one was asked for, then acks. The ack never
    /// precedes a successful reply publish, so a failed reply leaves the
    /// delivery unacked for the broker to redeliver.
    async fn finish(&self, session: &Arc<Session>, delivery: &Arc<Delivery>, rw: ResponseWriter) {
        let reply_address = reply_address(delivery);
        if let Some((reply_to, correlation_id)) = reply_address {
            let (body, headers) = rw.into_parts();
            let properties = BasicProperties::default()
                .with_correlation_id(correlation_id.as_str().into())
                .with_headers(headers);
            let publishing = Publishing {
                exchange: String::new(),
                routing_key: reply_to.clone(),
                mandatory: false,
                immediate: false,
                body,
                properties,
            };
            if let Err(err) = session.publish(publishing).await {
                self.logger.error(format_args!(
                    "failed to publish reply to '{reply_to}': {err}"
                ));
                return;
            }
        }
        if self.auto_ack {
            if let Err(err) = delivery.acker.ack(BasicAckOptions::default()).await {
                self.logger
                    .error(format_args!("failed to ack delivery: {err}"));
                session.signal_trouble();
            }
        }
    }

    /// A panicking handler answers with an empty body and an error header,
    /// and its delivery is requeued once before being dropped.
    async fn recover(
        &self,
        session: &Arc<Session>,
        delivery: &Arc<Delivery>,
        panic: Box<dyn Any + Send>,
    ) {
        let reason = RpcError::HandlerPanic(panic_message(panic));
        self.logger.error(format_args!(
            "delivery from '{}' aborted: {reason}",
            delivery.routing_key
        ));
        if let Some((reply_to, correlation_id)) = reply_address(delivery) {
            let mut headers = FieldTable::default();
            headers.insert(
                ERROR_HEADER.into(),
                AMQPValue::LongString(reason.to_string().into()),
            );
            let properties = BasicProperties::default()
                .with_correlation_id(correlation_id.as_str().into())
                .with_headers(headers);
            let publishing = Publishing {
                exchange: String::new(),
                routing_key: reply_to.clone(),
                mandatory: false,
                immediate: false,
                body: Bytes::new(),
                properties,
            };
            if let Err(err) = session.publish(publishing).await {
                self.logger.error(format_args!(
                    "failed to publish error reply to '{reply_to}': {err}"
                ));
            }
        }
        let requeue = !delivery.redelivered;
        let options = BasicNackOptions {
            multiple: false,
            requeue,
        };
        if let Err(err) = delivery.acker.nack(options).await {
            self.logger
                .error(format_args!("failed to nack delivery: {err}"));
        }
    }

    async fn shutdown(&self, supervisor: JoinHandle<()>, grace_timeout: Duration) {
        self.session.begin_close();
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

/// Replies go wherever the request pointed, provided it also carried a
/// correlation id to echo.
fn reply_address(delivery: &Delivery) -> Option<(String, String)> {
    let reply_to = delivery.properties.reply_to().clone()?;
    let correlation_id = delivery.properties.correlation_id().clone()?;
    Some((reply_to.as_str().to_string(), correlation_id.as_str().to_string()))
}

/// Consumer tags must be unique per channel, so a user-supplied tag gets the
/// queue name appended. Empty stays empty and the broker assigns one.
fn consumer_tag(configured: &str, queue_name: &str) -> String {
    if configured.is_empty() {
        String::new()
    } else {
        format!("{configured}-{queue_name}")
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    match panic.downcast::<String>() {
        Ok(message) => *message,
        Err(panic) => match panic.downcast::<&'static str>() {
            Ok(message) => (*message).to_string(),
            Err(_) => "unknown panic".to_string(),
        },
    }
}

struct ServerRuntime {
    core: Arc<ServerCore>,
    supervisor: JoinHandle<()>,
}

/// The answering endpoint.
///
/// Holds the declared bindings and serves them over one supervised broker
/// session: each binding gets a consumer, every delivery runs through the
/// middleware-wrapped handler, and the accumulated response is published back
/// to the requester's reply queue.
///
/// Bindings and configuration are set up before [`listen_and_serve`](Server::listen_and_serve).
pub struct Server {
    url: String,
    dial_config: DialConfig,
    auto_ack: bool,
    grace_timeout: Duration,
    queue_declare_settings: QueueDeclareSettings,
    consume_settings: ConsumeSettings,
    exchange_declare_settings: ExchangeDeclareSettings,
    middlewares: Vec<MiddlewareFunc>,
    bindings: Vec<Binding>,
    on_started: Vec<OnStartedFunc>,
    logger: Logger,
    runtime: Mutex<Option<ServerRuntime>>,
}

impl Server {
    pub fn new<S: Into<String>>(url: S) -> Self {
        Server {
            url: url.into(),
            dial_config: DialConfig::default(),
            auto_ack: true,
            grace_timeout: DEFAULT_GRACE_TIMEOUT,
            queue_declare_settings: QueueDeclareSettings::default(),
            consume_settings: ConsumeSettings::default(),
            exchange_declare_settings: ExchangeDeclareSettings::default(),
            middlewares: Vec::new(),
            bindings: Vec::new(),
            on_started: Vec::new(),
            logger: Logger::default(),
            runtime: Mutex::new(None),
        }
    }

    /// Whether the dispatcher acks deliveries after handling (after the
    /// reply publish, when one happens). With `false` the handler owns
    /// acking, and unacked deliveries are redelivered by the broker when the
    /// consumer closes.
    pub fn with_auto_ack(mut self, auto_ack: bool) -> Self {
        self.auto_ack = auto_ack;
        self
    }

    pub fn with_dial_config(mut self, dial_config: DialConfig) -> Self {
        self.dial_config = dial_config;
        self
    }

    pub fn with_queue_declare_settings(mut self, settings: QueueDeclareSettings) -> Self {
        self.queue_declare_settings = settings;
        self
    }

    pub fn with_consume_settings(mut self, settings: ConsumeSettings) -> Self {
        self.consume_settings = settings;
        self
    }

    pub fn with_exchange_declare_settings(mut self, settings: ExchangeDeclareSettings) -> Self {
        self.exchange_declare_settings = settings;
        self
    }

    /// How long [`stop`](Server::stop) waits for in-flight deliveries.
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

    /// Appends a middleware that wraps every handler. The first one added
    /// runs outermost.
    pub fn add_middleware(mut self, middleware: MiddlewareFunc) -> Self {
        self.middlewares.push(middleware);
        self
    }

    /// Declares a binding to serve. Takes effect on the next
    /// [`listen_and_serve`](Server::listen_and_serve).
    pub fn bind(&mut self, binding: Binding) {
        self.bindings.push(binding);
    }

    /// Registers a callback fired once per ready transition, including after
    /// reconnects, with the four live broker handles.
    pub fn on_started<F>(&mut self, callback: F)
    where
        F: Fn(&Connection, &Connection, &Channel, &Channel) + Send + Sync + 'static,
    {
        self.on_started.push(Arc::new(callback));
    }

    /// Serves the declared bindings until [`stop`](Server::stop) is called.
    /// The broker session is dialed with backoff and redialed on loss; the
    /// call returns only when the session has fully closed.
    pub async fn listen_and_serve(&self) {
        let core = self.ensure_started();
        core.session.wait_closed().await;
    }

    /// Stops consuming, waits for in-flight deliveries within the grace
    /// timeout and closes the broker session. Unacked deliveries return to
    /// their queues. A later `listen_and_serve` starts a fresh session.
    pub async fn stop(&self) {
        let runtime = self.runtime.lock().unwrap().take();
        if let Some(ServerRuntime { core, supervisor }) = runtime {
            core.shutdown(supervisor, self.grace_timeout).await;
        }
    }

    fn ensure_started(&self) -> Arc<ServerCore> {
        let mut runtime = self.runtime.lock().unwrap();
        if let Some(runtime) = runtime.as_ref() {
            return runtime.core.clone();
        }
        let session = Session::new(
            self.url.clone(),
            self.dial_config.clone(),
            false,
            self.logger.clone(),
        );
        let core = Arc::new(ServerCore {
            session: session.clone(),
            bindings: self.bindings.clone(),
            middlewares: self.middlewares.clone(),
            on_started: self.on_started.clone(),
            auto_ack: self.auto_ack,
            queue_declare_settings: self.queue_declare_settings.clone(),
            consume_settings: self.consume_settings.clone(),
            exchange_declare_settings: self.exchange_declare_settings.clone(),
            tracker: TaskTracker::new(),
            logger: self.logger.clone(),
        });
        let supervisor = session.start(core.clone());
        *runtime = Some(ServerRuntime {
            core: core.clone(),
            supervisor,
        });
        core
    }
}

/// A server dropped without [`stop`](Server::stop) still tears its session
/// down; unacked deliveries return to their queues.
impl Drop for Server {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.lock().unwrap().take() {
            runtime.core.session.begin_close();
        }
    }
}
