use crate::changes::Change;

use prometheus::{exponential_buckets, Histogram, HistogramOpts, IntCounterVec, Opts, Registry};

use std::fmt::{self, Debug};

const CHANGE_AND_OUTCOME: &[&str] = &["change", "outcome"];

/// Owns the prometheus registry and every metric that's recorded during a sync
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    api_server_request_times: Histogram,
    sync_operations: IntCounterVec,
}

impl Debug for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("Metrics")
    }
}

impl Default for Metrics {
    fn default() -> Metrics {
        Metrics::new()
    }
}

impl Metrics {
    pub fn new() -> Metrics {
        let registry = Registry::new();

        // 5ms, 10ms, 20ms ... ~10s
        let request_time_opts = HistogramOpts::new(
            "api_server_request_time",
            "Total time from sending the request to receiving the response headers",
        )
        .subsystem("client")
        .buckets(exponential_buckets(0.005, 2.0, 12).unwrap());
        let api_server_request_times = Histogram::with_opts(request_time_opts).unwrap();
        registry
            .register(Box::new(api_server_request_times.clone()))
            .unwrap();

        let sync_operation_opts = Opts::new(
            "sync_operations",
            "the number of apply and delete operations performed, by outcome",
        )
        .variable_label("change")
        .variable_label("outcome");
        let sync_operations = IntCounterVec::new(sync_operation_opts, CHANGE_AND_OUTCOME).unwrap();
        registry.register(Box::new(sync_operations.clone())).unwrap();

        Metrics {
            registry,
            api_server_request_times,
            sync_operations,
        }
    }

    pub fn client_metrics(&self) -> ClientMetrics {
        ClientMetrics {
            api_server_request_times: self.api_server_request_times.clone(),
        }
    }

    pub fn operation_completed(&self, change: Change, outcome: &str) {
        self.sync_operations
            .with_label_values(&[change.as_str(), outcome])
            .inc();
    }

    pub fn operation_count(&self, change: Change, outcome: &str) -> u64 {
        self.sync_operations
            .with_label_values(&[change.as_str(), outcome])
            .get() as u64
    }

    pub fn encode_as_text(&self) -> Result<Vec<u8>, prometheus::Error> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let mut buffer = Vec::with_capacity(4096);
        encoder.encode(self.registry.gather().as_slice(), &mut buffer)?;
        Ok(buffer)
    }
}

#[derive(Clone)]
pub struct ClientMetrics {
    api_server_request_times: Histogram,
}

impl Debug for ClientMetrics {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("ClientMetrics")
    }
}

impl ClientMetrics {
    pub fn request_started(&self) -> prometheus::HistogramTimer {
        self.api_server_request_times.start_timer()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn metrics_are_created_successfully() {
        let _metrics = Metrics::new();
    }

    #[test]
    fn sync_operations_are_counted_and_encoded() {
        let metrics = Metrics::new();
        metrics.operation_completed(Change::Apply, "created");
        metrics.operation_completed(Change::Apply, "created");
        metrics.operation_completed(Change::Delete, "absent");
        assert_eq!(2, metrics.operation_count(Change::Apply, "created"));
        assert_eq!(1, metrics.operation_count(Change::Delete, "absent"));

        {
            let _timer = metrics.client_metrics().request_started();
        }

        let text = String::from_utf8(metrics.encode_as_text().unwrap()).unwrap();
        assert!(text.contains("client_api_server_request_time"));
        assert!(text.contains(r#"sync_operations{change="apply",outcome="created"} 2"#));
    }
}
