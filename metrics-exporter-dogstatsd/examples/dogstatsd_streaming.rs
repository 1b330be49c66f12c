use std::time::{Duration, Instant};

use metrics::counter;
use metrics_exporter_dogstatsd::{AggregationMode, DogStatsDBuilder};

fn main() {
    tracing_subscriber::fmt::init();

    let handle = DogStatsDBuilder::default()
        .with_remote_address("localhost:9125")
        .expect("failed to parse remote address")
        .with_aggregation_mode(AggregationMode::Streaming)
        .with_telemetry(false)
        .with_sample_rate(0.5)
        .with_fail_callback(|error| eprintln!("metric lost: {error}"))
        .install()
        .expect("failed to install DogStatsD recorder");

    // Increment a counter every second or so for half a minute, each update going out on its own line.
    let started = Instant::now();
    while started.elapsed() < Duration::from_secs(30) {
        counter!("idle_metric").increment(1);
        std::thread::sleep(Duration::from_secs(1));
    }

    handle.shutdown().expect("failed to send final metrics");
}
