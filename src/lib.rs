//! devbus: a message bus for development tools.
//!
//! Clients share live project state over a broker, scoped per user channel:
//! topic broadcasts (optionally answered), RPC requests to named services,
//! a channel switcher enforcing single-channel occupancy and a keep-alive
//! watchdog.

pub mod broker;
pub mod channel;
pub mod config;
pub mod connector;
pub mod correlation;
pub mod descriptors;
pub mod error;
pub mod handler;
pub mod keepalive;
pub mod promise;
pub mod status;

pub use broker::{BrokerConnection, MemoryBroker};
pub use channel::ChannelSwitcher;
pub use config::BusSettings;
pub use connector::{BusContext, HandlerId, ListenerId, MessageConnector};
pub use descriptors::{ServiceMethod, Topic};
pub use error::{BusError, BusResult};
pub use handler::{ChannelListener, EventHandler, ResultSink, Service};
pub use keepalive::{KeepAliveConnector, ServiceRequiredResponder};
pub use promise::{Promise, PromiseState};
pub use status::{ConnectionStatus, StatusKind};
