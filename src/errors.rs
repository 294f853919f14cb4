use thiserror::Error;

/// Errors surfaced to callers of [`Client::send`](crate::Client::send).
///
/// Transport hiccups are recovered internally by the redial loop and only
/// reach the caller through the [`Timeout`](RpcError::Timeout) or
/// [`Disconnected`](RpcError::Disconnected) paths.
#[derive(Error, Debug)]
pub enum RpcError {
    /// The deadline passed before a reply arrived.
    #[error("request timed out")]
    Timeout,

    /// The broker session was lost before the reply arrived, or the
    /// endpoint was stopped while the request was in flight.
    #[error("broker session lost before a reply arrived")]
    Disconnected,

    #[error(transparent)]
    Publish(#[from] PublishError),

    /// The request was rejected before publishing, e.g. a missing routing
    /// key or a correlation id that is already in flight.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The caller-provided cancellation fired while waiting.
    #[error("request cancelled")]
    Cancelled,

    /// A server-side handler aborted abnormally.
    #[error("handler panicked: {0}")]
    HandlerPanic(String),
}

/// The broker refused to take a publish.
#[derive(Error, Debug)]
pub enum PublishError {
    /// The channel rejected the frame outright.
    #[error("broker refused publish: {0}")]
    Refused(#[source] lapin::Error),

    /// Publisher confirms are enabled and the broker returned a negative
    /// acknowledgement.
    #[error("publisher confirm was nacked")]
    ConfirmNack,

    /// The message was published `mandatory` and came back unrouted.
    #[error("message could not be routed to any queue")]
    Unroutable,
}

/// Transport-internal failures. These drive the redial loop and are logged
/// through the error logger rather than returned to callers.
#[derive(Error, Debug)]
pub(crate) enum ConnectionError {
    #[error(transparent)]
    Broker(#[from] lapin::Error),

    /// The session began closing while an open was still in progress.
    #[error("session is closing")]
    Closed,
}

impl From<lapin::Error> for RpcError {
    fn from(err: lapin::Error) -> Self {
        RpcError::Publish(PublishError::Refused(err))
    }
}
