//! Collaborator interfaces: event subscribers, services and channel observers.

use crate::error::{BusError, BusResult};

/// Receives broadcasts delivered on a topic.
///
/// `reply_to` and `correlation_id` are present when the sender expects an
/// answer; pass them to [`MessageConnector::reply_to_event`] to reply.
/// Handlers that do not reply can ignore both.
///
/// An error returned here is logged by the connector and goes no further.
///
/// [`MessageConnector::reply_to_event`]: crate::connector::MessageConnector::reply_to_event
pub trait EventHandler: Send + Sync {
    fn handle(
        &self,
        message: &[u8],
        reply_to: Option<&str>,
        correlation_id: Option<&str>,
    ) -> BusResult<()>;
}

impl<F> EventHandler for F
where
    F: Fn(&[u8], Option<&str>, Option<&str>) -> BusResult<()> + Send + Sync,
{
    fn handle(
        &self,
        message: &[u8],
        reply_to: Option<&str>,
        correlation_id: Option<&str>,
    ) -> BusResult<()> {
        self(message, reply_to, correlation_id)
    }
}

/// Destination for the answer to one RPC request.
///
/// Every method consumes the sink, so at most one answer is produced per
/// request. A sink dropped without an answer makes the connector reply with
/// an error once the service returns.
pub trait ResultSink: Send {
    /// Answer with a result payload.
    fn write(self: Box<Self>, result: Vec<u8>);

    /// Answer with an error described by `reason`.
    fn reject(self: Box<Self>, reason: &str);

    /// Answer with an error.
    fn reject_error(self: Box<Self>, error: BusError);
}

/// A named RPC target exposing methods through a single dispatch entry point.
pub trait Service: Send + Sync {
    /// Routing name of the service; unique per connector.
    fn name(&self) -> &str;

    /// Handle one request for `method`.
    ///
    /// Answer through `result`, now or later from another thread. Returning
    /// an error (or panicking) before answering rejects the request with that
    /// error's message.
    fn reply(&self, method: &str, request: &[u8], result: Box<dyn ResultSink>) -> BusResult<()>;
}

/// Observes channel membership changes of a connector.
pub trait ChannelListener: Send + Sync {
    fn on_connected(&self, channel: &str);

    fn on_disconnected(&self, channel: &str);
}
