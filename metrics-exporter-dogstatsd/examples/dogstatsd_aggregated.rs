use std::time::Duration;

use metrics::{counter, gauge, histogram};
use metrics_exporter_dogstatsd::{AggregationMode, DogStatsDBuilder, Matcher};

fn main() {
    tracing_subscriber::fmt::init();

    let handle = DogStatsDBuilder::default()
        .with_remote_address("localhost:9125")
        .expect("failed to parse remote address")
        .with_aggregation_mode(AggregationMode::Aggregated)
        .with_flush_interval(Duration::from_secs(5))
        .with_prefix("demo")
        .with_global_tags([("env", "dev")])
        .with_histogram_buckets(&[0.01, 0.05, 0.1, 0.5, 1.0])
        .with_histogram_buckets_for_metric(Matcher::Suffix("_bytes".to_string()), &[512.0, 4096.0, 65536.0])
        .install()
        .expect("failed to install DogStatsD recorder");

    gauge!("testing").set(42.0);

    let server_loops = counter!("tcp_server_loops", "system" => "foo");
    let server_loops_delta_secs = histogram!("tcp_server_loop_delta_secs", "system" => "foo");
    let payload_bytes = histogram!("tcp_server_payload_bytes", "system" => "foo");

    // Pretend to do some work, reporting a few times before shutting down.
    for _ in 0..200 {
        server_loops.increment(1);
        server_loops_delta_secs.record(rand::random_range(0.0..1.0));
        payload_bytes.record(rand::random_range(0.0..100_000.0));

        let lucky = gauge!("lucky_iterations");
        if rand::random_bool(0.75) {
            lucky.increment(1.0);
        } else {
            lucky.decrement(1.0);
        }

        std::thread::sleep(Duration::from_millis(100));
    }

    handle.shutdown().expect("failed to send final metrics");
}
