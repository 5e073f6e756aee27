//! Typed names for broadcast topics and RPC service methods.

use std::fmt;

/// Suffix appended to a topic name to form its response topic.
pub const RESPONSE_SUFFIX: &str = ".response";

/// Reserved message `type` marking a reply to a broadcast-with-response.
pub const EVENT_RESPONSE_TYPE: &str = "eventResponse";

/// A named broadcast subject, optionally paired with a response topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic {
    name: String,
    response: Option<String>,
}

impl Topic {
    /// A topic whose broadcasts expect no reply.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            response: None,
        }
    }

    /// A topic whose broadcasts may be answered on `<name>.response`.
    pub fn with_response(name: impl Into<String>) -> Self {
        let name = name.into();
        let response = format!("{}{}", name, RESPONSE_SUFFIX);
        Self {
            name,
            response: Some(response),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the paired response topic, if any.
    pub fn response_name(&self) -> Option<&str> {
        self.response.as_deref()
    }

    /// The paired response topic, if any.
    pub fn response_topic(&self) -> Option<Topic> {
        self.response.as_ref().map(|name| Topic::new(name.clone()))
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Identifies one method of an RPC service.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceMethod {
    service: String,
    method: String,
}

impl ServiceMethod {
    pub fn new(service: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            method: method.into(),
        }
    }

    /// Service name; used as the routing key on the user's command exchange.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Method name; carried in the message `type` property.
    pub fn method(&self) -> &str {
        &self.method
    }
}

impl fmt::Display for ServiceMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.service, self.method)
    }
}
