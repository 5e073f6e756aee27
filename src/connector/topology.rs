//! Per-user broker topology.
//!
//! Every user owns two exchanges:
//! - `t.<user>`: topic exchange for broadcasts, routing key = topic name
//! - `d.<user>`: direct exchange for commands, routing key = service name
//!   (requests) or queue name (replies)

use crate::broker::{BrokerConnection, ExchangeKind, QueueOptions};
use crate::config::BusSettings;
use crate::error::BusResult;

/// Binding key that matches every topic.
pub const ALL_TOPICS: &str = "#";

/// Name of the user's broadcast exchange.
pub fn topic_exchange(user: &str) -> String {
    format!("t.{}", user)
}

/// Name of the user's command exchange.
pub fn command_exchange(user: &str) -> String {
    format!("d.{}", user)
}

pub(crate) fn declare_user_exchanges(connection: &dyn BrokerConnection, user: &str) -> BusResult<()> {
    connection.exchange_declare(&topic_exchange(user), ExchangeKind::Topic)?;
    connection.exchange_declare(&command_exchange(user), ExchangeKind::Direct)
}

/// Bind the connector's own queue to receive every broadcast and the replies
/// addressed to it.
pub(crate) fn bind_own_queue(connection: &dyn BrokerConnection, queue: &str, user: &str) -> BusResult<()> {
    connection.queue_bind(queue, &topic_exchange(user), ALL_TOPICS)?;
    connection.queue_bind(queue, &command_exchange(user), queue)
}

pub(crate) fn unbind_own_queue(
    connection: &dyn BrokerConnection,
    queue: &str,
    user: &str,
) -> BusResult<()> {
    connection.queue_unbind(queue, &topic_exchange(user), ALL_TOPICS)?;
    connection.queue_unbind(queue, &command_exchange(user), queue)
}

/// Name of the queue carrying `user`'s service requests.
///
/// Scoped per user so a request is only ever consumed by a connector on the
/// channel it was sent to, which replies through that channel's exchange.
pub fn services_queue(settings: &BusSettings, user: &str) -> String {
    format!("{}.{}", settings.rpc_queue_name, user)
}

/// Own queue: server-named, private to the connection.
pub(crate) fn own_queue_options() -> QueueOptions {
    QueueOptions {
        exclusive: true,
        auto_delete: true,
        dead_letter_exchange: None,
    }
}

/// Services queue: rejected requests bounce back through the user's
/// command exchange.
pub(crate) fn services_queue_options(settings: &BusSettings, user: &str) -> QueueOptions {
    QueueOptions {
        exclusive: settings.exclusive_services_queue,
        auto_delete: true,
        dead_letter_exchange: Some(command_exchange(user)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;

    #[test]
    fn exchange_names_follow_user() {
        assert_eq!(topic_exchange("alice"), "t.alice");
        assert_eq!(command_exchange("alice"), "d.alice");
    }

    #[test]
    fn services_queue_is_scoped_per_user() {
        let settings = BusSettings::default();
        assert_eq!(services_queue(&settings, "alice"), "devbus.services.alice");
        assert_ne!(
            services_queue(&settings, "alice"),
            services_queue(&settings, "bob")
        );
    }

    #[test]
    fn services_queue_dead_letters_to_command_exchange() {
        let settings = BusSettings {
            exclusive_services_queue: true,
            ..BusSettings::default()
        };
        let options = services_queue_options(&settings, "bob");
        assert!(options.exclusive);
        assert!(options.auto_delete);
        assert_eq!(options.dead_letter_exchange.as_deref(), Some("d.bob"));
    }

    #[test]
    fn own_queue_binding_round_trip() {
        let broker = MemoryBroker::new();
        let connection = broker.connect();
        declare_user_exchanges(&connection, "carol").unwrap();
        let queue = connection.queue_declare(None, &own_queue_options()).unwrap();

        bind_own_queue(&connection, &queue, "carol").unwrap();
        assert_eq!(broker.bindings(&queue, "t.carol"), vec!["#".to_string()]);
        assert_eq!(broker.bindings(&queue, "d.carol"), vec![queue.clone()]);

        unbind_own_queue(&connection, &queue, "carol").unwrap();
        assert!(broker.bindings(&queue, "t.carol").is_empty());
        assert!(broker.bindings(&queue, "d.carol").is_empty());
    }
}
