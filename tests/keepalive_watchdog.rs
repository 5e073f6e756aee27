//! Keep-alive watchdog across two connectors on one broker.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use devbus::config::KeepAliveSettings;
use devbus::{
    BusContext, BusSettings, KeepAliveConnector, MemoryBroker, MessageConnector,
    ServiceRequiredResponder,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn connector(broker: &MemoryBroker, user: &str) -> MessageConnector {
    let connector =
        MessageConnector::new(BusContext::in_memory(broker, BusSettings::default())).unwrap();
    connector.connect_to_channel_sync(user).unwrap();
    connector
}

fn fast_settings() -> KeepAliveSettings {
    KeepAliveSettings {
        probe_interval_ms: 40,
        response_timeout_ms: 120,
        service_type: "indexer".to_string(),
    }
}

fn counting_watchdog(connector: &MessageConnector) -> (KeepAliveConnector, Arc<AtomicUsize>) {
    let exits = Arc::new(AtomicUsize::new(0));
    let counter = exits.clone();
    let watchdog = KeepAliveConnector::with_terminator(connector.clone(), fast_settings(), move || {
        counter.fetch_add(1, Ordering::SeqCst);
    })
    .expect("watchdog should start");
    (watchdog, exits)
}

fn wait_until(condition: impl Fn() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}

#[test]
fn unanswered_probe_terminates_exactly_once() {
    init_logging();
    let broker = MemoryBroker::new();
    let watched = connector(&broker, "alice");
    let (watchdog, exits) = counting_watchdog(&watched);

    assert!(
        wait_until(|| watchdog.terminated(), Duration::from_secs(2)),
        "terminator should run when nobody answers"
    );
    std::thread::sleep(Duration::from_millis(400));
    assert_eq!(exits.load(Ordering::SeqCst), 1, "terminator must run once");
}

#[test]
fn answered_probes_keep_process_alive() {
    init_logging();
    let broker = MemoryBroker::new();
    let watched = connector(&broker, "alice");
    let provider = connector(&broker, "alice");
    let _responder = ServiceRequiredResponder::register(&provider, "indexer");
    let (watchdog, exits) = counting_watchdog(&watched);

    // Several probe rounds.
    std::thread::sleep(Duration::from_millis(600));
    assert_eq!(exits.load(Ordering::SeqCst), 0);
    assert!(!watchdog.terminated());
    watchdog.dispose();
}

#[test]
fn responder_for_other_service_type_does_not_confirm() {
    init_logging();
    let broker = MemoryBroker::new();
    let watched = connector(&broker, "alice");
    let provider = connector(&broker, "alice");
    let _responder = ServiceRequiredResponder::register(&provider, "formatter");
    let (watchdog, _exits) = counting_watchdog(&watched);

    assert!(wait_until(|| watchdog.terminated(), Duration::from_secs(2)));
}

#[test]
fn disposed_watchdog_never_terminates() {
    init_logging();
    let broker = MemoryBroker::new();
    let watched = connector(&broker, "alice");
    let (watchdog, exits) = counting_watchdog(&watched);

    watchdog.dispose();
    watchdog.dispose();
    std::thread::sleep(Duration::from_millis(400));
    assert_eq!(exits.load(Ordering::SeqCst), 0);
}
