use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

pub trait Metrics {
    fn increment_open_connections(&self) {
        METRICS_HUB.open_connections.inc();
    }

    fn decrement_open_connections(&self) {
        METRICS_HUB.open_connections.dec();
    }

    fn increment_frames_sent(&self) {
        METRICS_HUB.frames_sent.inc();
    }

    fn increment_frames_received(&self) {
        METRICS_HUB.frames_received.inc();
    }

    fn increment_wait_timeouts(&self) {
        METRICS_HUB.wait_timeouts.inc();
    }

    fn increment_transport_errors(&self) {
        METRICS_HUB.transport_errors.inc();
    }
}

pub struct MetricsHub {
    open_connections: IntGauge,
    frames_sent: IntCounter,
    frames_received: IntCounter,
    wait_timeouts: IntCounter,
    transport_errors: IntCounter,
    registry: Registry,
}

impl MetricsHub {
    pub fn new() -> Result<Self, prometheus::Error> {
        let open_connections =
            IntGauge::new("harness_open_connections", "Open harness websocket connections")?;
        let frames_sent = IntCounter::new("harness_frames_sent", "Frames sent to the server")?;
        let frames_received =
            IntCounter::new("harness_frames_received", "Frames received from the server")?;
        let wait_timeouts =
            IntCounter::new("harness_wait_timeouts", "Expectations that timed out")?;
        let transport_errors =
            IntCounter::new("harness_transport_errors", "Socket level failures")?;

        let registry = Registry::new();
        registry.register(Box::new(open_connections.clone()))?;
        registry.register(Box::new(frames_sent.clone()))?;
        registry.register(Box::new(frames_received.clone()))?;
        registry.register(Box::new(wait_timeouts.clone()))?;
        registry.register(Box::new(transport_errors.clone()))?;

        Ok(MetricsHub {
            open_connections,
            frames_sent,
            frames_received,
            wait_timeouts,
            transport_errors,
            registry,
        })
    }

    pub fn get_metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    pub fn reset(&self) {
        self.open_connections.set(0);
        self.frames_sent.reset();
        self.frames_received.reset();
        self.wait_timeouts.reset();
        self.transport_errors.reset();
    }
}

lazy_static! {
    static ref METRICS_HUB: MetricsHub =
        MetricsHub::new().unwrap_or_else(|e| panic!("Error registering harness metrics: {}", e));
}

pub fn get_metrics() -> Vec<prometheus::proto::MetricFamily> {
    METRICS_HUB.get_metrics()
}

/// Renders every harness metric in the prometheus text format.
pub fn render_metrics() -> Result<String, prometheus::Error> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&get_metrics(), &mut buffer)?;

    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Probe;

    impl Metrics for Probe {}

    #[test]
    fn rendered_metrics_include_counters() {
        Probe.increment_frames_sent();

        let text = render_metrics().unwrap();
        assert!(text.contains("harness_frames_sent"));
        assert!(text.contains("harness_open_connections"));
    }
}
