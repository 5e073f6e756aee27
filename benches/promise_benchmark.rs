//! Benchmark for promise settlement and request correlation.
//!
//! Measures the in-process cost of the request path: registering a pending
//! promise, settling it from the response side, and full round trips over the
//! in-memory broker.

use std::sync::Arc;
use std::time::Duration;

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use devbus::correlation::CorrelationTable;
use devbus::{
    BusContext, BusResult, BusSettings, MemoryBroker, MessageConnector, Promise, ResultSink,
    Service, ServiceMethod,
};

struct Echo;

impl Service for Echo {
    fn name(&self) -> &str {
        "echo"
    }

    fn reply(&self, _method: &str, request: &[u8], result: Box<dyn ResultSink>) -> BusResult<()> {
        result.write(request.to_vec());
        Ok(())
    }
}

fn benchmark_promise_chains(c: &mut Criterion) {
    let mut group = c.benchmark_group("promise_chain");
    for depth in [1usize, 8, 64] {
        group.bench_with_input(BenchmarkId::from_parameter(depth), &depth, |b, &depth| {
            b.iter(|| {
                let root: Promise<u64> = Promise::new();
                let mut tail = root.clone();
                for _ in 0..depth {
                    tail = tail.then(|value| value + 1);
                }
                root.set_result(0);
                tail.result()
            });
        });
    }
    group.finish();
}

fn benchmark_correlation_table(c: &mut Criterion) {
    let table: CorrelationTable<Vec<u8>> = CorrelationTable::new();
    c.bench_function("correlation_add_and_settle", |b| {
        b.iter(|| {
            let id = table.add(Promise::new());
            if let Some(promise) = table.get_promise_and_remove(id) {
                promise.set_result(Vec::new());
            }
        });
    });
}

fn benchmark_request_round_trip(c: &mut Criterion) {
    let broker = MemoryBroker::new();
    let server = MessageConnector::new(BusContext::in_memory(&broker, BusSettings::default()))
        .expect("server connector");
    server.add_service(Arc::new(Echo)).expect("echo service");
    server.connect_to_channel_sync("bench").expect("server join");
    let client = MessageConnector::new(BusContext::in_memory(&broker, BusSettings::default()))
        .expect("client connector");
    client.connect_to_channel_sync("bench").expect("client join");

    let method = ServiceMethod::new("echo", "ping");
    let mut group = c.benchmark_group("request_round_trip");
    for size in [16usize, 4096] {
        let payload = vec![b'x'; size];
        group.bench_with_input(BenchmarkId::from_parameter(size), &payload, |b, payload| {
            b.iter(|| {
                client
                    .request(&method, payload.clone())
                    .blocking_get(Duration::from_secs(5))
                    .expect("echo reply")
            });
        });
    }
    group.finish();

    client.close(Duration::from_millis(100));
    server.close(Duration::from_millis(100));
}

criterion_group!(
    benches,
    benchmark_promise_chains,
    benchmark_correlation_table,
    benchmark_request_round_trip
);
criterion_main!(benches);
