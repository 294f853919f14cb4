use crate::response::ResponseWriter;
use futures::future::BoxFuture;
use lapin::message::Delivery;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Per-call context handed to handlers and server middlewares.
///
/// Carries the name of the queue the delivery was consumed from and a
/// cancellation handle that fires when the server stops.
#[derive(Clone, Debug)]
pub struct Context {
    queue_name: Arc<str>,
    cancellation: CancellationToken,
}

impl Context {
    pub(crate) fn new(queue_name: Arc<str>, cancellation: CancellationToken) -> Self {
        Context {
            queue_name,
            cancellation,
        }
    }

    /// The queue the delivery being handled was consumed from.
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Cancelled when the server begins shutting down. Long-running handlers
    /// can select against this to bail out early.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }
}

/// The terminal unit of request handling on the server.
///
/// A handler receives the call context, a fresh [`ResponseWriter`] and the
/// delivery, fills the writer and hands it back. Middlewares share this
/// shape, which makes the whole chain one composed `HandlerFunc`.
pub type HandlerFunc = Arc<
    dyn Fn(Context, ResponseWriter, Arc<Delivery>) -> BoxFuture<'static, ResponseWriter>
        + Send
        + Sync,
>;

/// A transformer over a [`HandlerFunc`]. The first middleware added runs
/// outermost.
pub type MiddlewareFunc = Arc<dyn Fn(HandlerFunc) -> HandlerFunc + Send + Sync>;

/// Wraps an async closure into a [`HandlerFunc`].
///
/// ```
/// use amqp_rpc::handler_fn;
/// use std::fmt::Write;
///
/// let echo = handler_fn(|_ctx, mut rw, delivery| async move {
///     write!(rw, "Got message: {}", String::from_utf8_lossy(&delivery.data)).ok();
///     rw
/// });
/// # let _ = echo;
/// ```
pub fn handler_fn<F, Fut>(f: F) -> HandlerFunc
where
    F: Fn(Context, ResponseWriter, Arc<Delivery>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ResponseWriter> + Send + 'static,
{
    Arc::new(move |ctx, rw, delivery| Box::pin(f(ctx, rw, delivery)))
}

/// Wraps a closure into a [`MiddlewareFunc`].
pub fn middleware_fn<F>(f: F) -> MiddlewareFunc
where
    F: Fn(HandlerFunc) -> HandlerFunc + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Composes `middlewares` around `handler`, right to left, so the first
/// middleware in the slice ends up outermost.
pub(crate) fn chain(middlewares: &[MiddlewareFunc], handler: HandlerFunc) -> HandlerFunc {
    middlewares
        .iter()
        .rev()
        .fold(handler, |next, middleware| middleware(next))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::delivery;
    use lapin::BasicProperties;

    fn context() -> Context {
        Context::new("myqueue".into(), CancellationToken::new())
    }

    fn tagging(label: &'static str) -> MiddlewareFunc {
        middleware_fn(move |next| {
            handler_fn(move |ctx, mut rw, d| {
                let next = next.clone();
                async move {
                    rw.write(format!("<{label}>").as_bytes());
                    let mut rw = next(ctx, rw, d).await;
                    rw.write(format!("</{label}>").as_bytes());
                    rw
                }
            })
        })
    }

    #[tokio::test]
    async fn first_middleware_runs_outermost() {
        let handler = handler_fn(|_ctx, mut rw, _d| async move {
            rw.write(b"handler");
            rw
        });
        let chained = chain(&[tagging("a"), tagging("b")], handler);

        let d = Arc::new(delivery("myqueue", b"", BasicProperties::default()));
        let rw = chained(context(), ResponseWriter::default(), d).await;

        assert_eq!(rw.body(), b"<a><b>handler</b></a>");
    }

    #[tokio::test]
    async fn middleware_may_short_circuit() {
        let deny = middleware_fn(|next| {
            handler_fn(move |ctx, mut rw, d| {
                let next = next.clone();
                async move {
                    if ctx.queue_name() == "denied" {
                        rw.write(b"routing key 'denied' is not allowed");
                        return rw;
                    }
                    next(ctx, rw, d).await
                }
            })
        });
        let handler = handler_fn(|_ctx, mut rw, _d| async move {
            rw.write(b"this is not allowed");
            rw
        });
        let chained = chain(&[deny], handler);

        let ctx = Context::new("denied".into(), CancellationToken::new());
        let d = Arc::new(delivery("denied", b"", BasicProperties::default()));
        let rw = chained(ctx, ResponseWriter::default(), d).await;

        assert_eq!(rw.body(), b"routing key 'denied' is not allowed");
    }

    #[tokio::test]
    async fn empty_chain_is_the_bare_handler() {
        let handler = handler_fn(|_ctx, mut rw, _d| async move {
            rw.write(b"bare");
            rw
        });
        let chained = chain(&[], handler);

        let d = Arc::new(delivery("myqueue", b"", BasicProperties::default()));
        let rw = chained(context(), ResponseWriter::default(), d).await;

        assert_eq!(rw.body(), b"bare");
    }

    #[tokio::test]
    async fn same_list_wraps_identically_across_calls() {
        let handler = handler_fn(|_ctx, mut rw, _d| async move {
            rw.write(b"h");
            rw
        });
        let middlewares = [tagging("m"), tagging("n")];
        let chained = chain(&middlewares, handler);

        for _ in 0..2 {
            let d = Arc::new(delivery("myqueue", b"", BasicProperties::default()));
            let rw = chained(context(), ResponseWriter::default(), d).await;
            assert_eq!(rw.body(), b"<m><n>h</n></m>");
        }
    }
}
