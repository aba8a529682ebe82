use std::sync::LazyLock;

use prometheus::{
    register_histogram_with_registry, register_int_counter_with_registry,
    register_int_gauge_with_registry,
};
use prometheus::{
    Encoder, Histogram, IntCounter, IntGauge, Registry as PrometheusRegistry, TextEncoder,
};
use tracing::error;

use crate::cache::Error;

macro_rules! counter {
    ($name:ident, $metric:literal, $help:literal) => {
        pub static $name: LazyLock<IntCounter> = LazyLock::new(|| {
            register_int_counter_with_registry!($metric, $help, &METRICS_PROVIDER.registry)
                .expect(concat!("Failed to register ", $metric, " metric"))
        });
    };
}

counter!(
    CACHE_HITS,
    "cache_hits_total",
    "Manifest requests served from the cache"
);
counter!(
    CACHE_MISSES,
    "cache_misses_total",
    "Manifest requests that required an upstream pull or wait"
);
counter!(
    UPSTREAM_PULLS,
    "upstream_pulls_total",
    "Manifest pulls performed against an upstream registry"
);
counter!(
    UPSTREAM_PULL_FAILURES,
    "upstream_pull_failures_total",
    "Manifest pulls that failed"
);
counter!(
    PRUNED_MANIFESTS,
    "pruned_manifests_total",
    "Manifest holders removed by prune"
);
counter!(PRUNED_BLOBS, "pruned_blobs_total", "Blobs removed by prune");

pub static METRICS_PROVIDER: LazyLock<MetricsProvider> =
    LazyLock::new(|| MetricsProvider::new().expect("Unable to create metrics provider"));

pub struct MetricsProvider {
    registry: PrometheusRegistry,
    pub metric_http_request_total: IntCounter,
    pub metric_http_request_duration: Histogram,
    pub metric_http_request_in_flight: IntGauge,
}

impl MetricsProvider {
    pub fn new() -> Result<Self, Error> {
        let registry = PrometheusRegistry::new();

        let metric_http_request_total = register_int_counter_with_registry!(
            "http_requests_total",
            "Total number of HTTP requests made.",
            &registry
        )
        .map_err(|error| {
            error!("Unable to create http_requests_total metric: {error}");
            Error::Internal(String::from("Unable to create http_requests_total metric"))
        })?;

        let metric_http_request_duration = register_histogram_with_registry!(
            "http_request_duration_ms",
            "The HTTP request latencies in milliseconds.",
            &registry
        )
        .map_err(|error| {
            error!("Unable to create http_request_duration metric: {error}");
            Error::Internal(String::from(
                "Unable to create http_request_duration metric",
            ))
        })?;

        let metric_http_request_in_flight = register_int_gauge_with_registry!(
            "http_requests_in_flight",
            "The current number of in-flight HTTP requests.",
            &registry
        )
        .map_err(|error| {
            error!("Unable to create http_requests_in_flight metric: {error}");
            Error::Internal(String::from(
                "Unable to create http_requests_in_flight metric",
            ))
        })?;

        Ok(Self {
            registry,
            metric_http_request_total,
            metric_http_request_duration,
            metric_http_request_in_flight,
        })
    }

    pub fn gather(&self) -> Result<(String, Vec<u8>), Error> {
        let mut buffer = vec![];
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|error| Error::Internal(format!("Unable to encode metrics: {error}")))?;
        Ok((encoder.format_type().to_string(), buffer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather() {
        CACHE_HITS.inc();
        METRICS_PROVIDER.metric_http_request_total.inc();

        let (content_type, body) = METRICS_PROVIDER.gather().unwrap();
        let body = String::from_utf8(body).unwrap();

        assert!(content_type.starts_with("text/plain"));
        assert!(body.contains("cache_hits_total"));
        assert!(body.contains("http_requests_total"));
    }
}
