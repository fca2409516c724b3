use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry, TextEncoder,
};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub orders_created_total: IntCounter,
    pub order_transitions_total: IntCounterVec,
    pub positions_in_queue: IntGauge,
    pub location_writes_total: IntCounterVec,
    pub rate_limited_total: IntCounterVec,
    pub notifications_total: IntCounterVec,
    pub http_request_duration_seconds: HistogramVec,
    pub route_sequencing_seconds: Histogram,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let orders_created_total =
            IntCounter::new("orders_created_total", "Orders accepted by the API")
                .expect("valid orders_created_total metric");

        let order_transitions_total = IntCounterVec::new(
            Opts::new("order_transitions_total", "Order status changes by target status"),
            &["to"],
        )
        .expect("valid order_transitions_total metric");

        let positions_in_queue = IntGauge::new(
            "positions_in_queue",
            "Position samples waiting for the location publisher",
        )
        .expect("valid positions_in_queue metric");

        let location_writes_total = IntCounterVec::new(
            Opts::new("location_writes_total", "Position samples by publisher outcome"),
            &["outcome"],
        )
        .expect("valid location_writes_total metric");

        let rate_limited_total = IntCounterVec::new(
            Opts::new("rate_limited_total", "Requests rejected by the rate limiter"),
            &["class"],
        )
        .expect("valid rate_limited_total metric");

        let notifications_total = IntCounterVec::new(
            Opts::new("notifications_total", "Notification dispatches by outcome"),
            &["outcome"],
        )
        .expect("valid notifications_total metric");

        let http_request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "http_request_duration_seconds",
                "Latency of HTTP requests in seconds",
            ),
            &["status_class"],
        )
        .expect("valid http_request_duration_seconds metric");

        let route_sequencing_seconds = Histogram::with_opts(HistogramOpts::new(
            "route_sequencing_seconds",
            "Time spent geocoding and sequencing a driver route",
        ))
        .expect("valid route_sequencing_seconds metric");

        registry
            .register(Box::new(orders_created_total.clone()))
            .expect("register orders_created_total");
        registry
            .register(Box::new(order_transitions_total.clone()))
            .expect("register order_transitions_total");
        registry
            .register(Box::new(positions_in_queue.clone()))
            .expect("register positions_in_queue");
        registry
            .register(Box::new(location_writes_total.clone()))
            .expect("register location_writes_total");
        registry
            .register(Box::new(rate_limited_total.clone()))
            .expect("register rate_limited_total");
        registry
            .register(Box::new(notifications_total.clone()))
            .expect("register notifications_total");
        registry
            .register(Box::new(http_request_duration_seconds.clone()))
            .expect("register http_request_duration_seconds");
        registry
            .register(Box::new(route_sequencing_seconds.clone()))
            .expect("register route_sequencing_seconds");

        Self {
            registry,
            orders_created_total,
            order_transitions_total,
            positions_in_queue,
            location_writes_total,
            rate_limited_total,
            notifications_total,
            http_request_duration_seconds,
            route_sequencing_seconds,
        }
    }

    pub fn encode(&self) -> Result<String, String> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        TextEncoder::new()
            .encode(&metric_families, &mut buffer)
            .map_err(|err| format!("failed to encode metrics: {err}"))?;

        String::from_utf8(buffer).map_err(|err| format!("metrics are not valid utf8: {err}"))
    }
}
