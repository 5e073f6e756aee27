//! Classification of inbound deliveries.
//!
//! The connector tells events, broadcast responses and RPC responses apart
//! using message properties only:
//!
//! 1. `type == eventResponse`: a reply to a broadcast; the correlation id
//!    names the response topic. Without one the reply is dropped.
//! 2. No correlation id, or a reply-to present: an event on the routing key
//!    topic. Events published by this connector itself are suppressed.
//! 3. Anything else: the response to an outstanding request.
//!
//! Requests on the services queue are classified separately, see
//! [`classify_request`].

use crate::broker::{DEATH_HEADER, Delivery};
use crate::descriptors::EVENT_RESPONSE_TYPE;
use crate::error::{BusError, INTERNAL_ERROR};

/// Header carrying the error code of an error response.
pub const ERROR_CODE_HEADER: &str = "x-error-code";

/// What a delivery on the connector's own queue is.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Frame<'a> {
    /// Reply to one of our broadcasts, for the handlers of `topic`.
    EventResponse { topic: &'a str },
    /// Broadcast reply that names no response topic.
    StrayEventResponse,
    /// Broadcast for the handlers of `topic`.
    Event {
        topic: &'a str,
        reply_to: Option<&'a str>,
        correlation_id: Option<&'a str>,
    },
    /// Broadcast we published ourselves.
    OwnEvent,
    /// Response to request `id`; `None` when the correlation id is not a
    /// request id.
    Response { id: Option<i32> },
}

pub(crate) fn classify_frame<'a>(delivery: &'a Delivery, own_queue: &str) -> Frame<'a> {
    let properties = &delivery.properties;
    let correlation_id = properties.correlation_id.as_deref();

    if properties.kind.as_deref() == Some(EVENT_RESPONSE_TYPE) {
        return match correlation_id {
            Some(topic) if !topic.is_empty() => Frame::EventResponse { topic },
            _ => Frame::StrayEventResponse,
        };
    }

    if correlation_id.is_none() || properties.reply_to.is_some() {
        if properties.app_id.as_deref() == Some(own_queue) {
            return Frame::OwnEvent;
        }
        return Frame::Event {
            topic: &delivery.routing_key,
            reply_to: properties.reply_to.as_deref(),
            correlation_id,
        };
    }

    Frame::Response {
        id: correlation_id.and_then(|id| id.parse().ok()),
    }
}

/// The error carried by a response frame, if it is an error response.
pub(crate) fn response_error(delivery: &Delivery) -> Option<BusError> {
    let code = delivery.properties.header(ERROR_CODE_HEADER)?;
    let code = code.parse().unwrap_or(INTERNAL_ERROR);
    Some(BusError::remote(
        code,
        String::from_utf8_lossy(&delivery.body).into_owned(),
    ))
}

/// What to do with a delivery on the services queue.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Request<'a> {
    /// The request bounced through the dead-letter exchange before.
    DeadLettered,
    /// We sent this request; hand it back to the broker.
    OwnRequest { requeue: bool },
    /// Route to `service`.
    Dispatch { service: &'a str, method: &'a str },
}

pub(crate) fn classify_request<'a>(delivery: &'a Delivery, own_queue: &str) -> Request<'a> {
    let properties = &delivery.properties;
    if properties.header(DEATH_HEADER).is_some() {
        return Request::DeadLettered;
    }
    if properties.app_id.as_deref() == Some(own_queue) {
        return Request::OwnRequest {
            requeue: !delivery.redelivered,
        };
    }
    Request::Dispatch {
        service: &delivery.routing_key,
        method: properties.kind.as_deref().unwrap_or_default(),
    }
}
