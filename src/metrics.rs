use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};

/// Request metrics for the sync pipeline, served at `/metrics`.
pub struct Metrics {
    registry: Registry,
    pub request_duration: HistogramVec,
    pub request_size: HistogramVec,
    pub request_count: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let request_duration = HistogramVec::new(
            HistogramOpts::new(
                "search_indexer_request_duration",
                "Time (seconds) the indexer takes to process a sync request from a managed cluster.",
            )
            .buckets(vec![0.25, 0.5, 1.0, 1.5, 2.0, 2.5, 5.0, 10.0]),
            &["code"],
        )?;
        registry.register(Box::new(request_duration.clone()))?;

        let request_size = HistogramVec::new(
            HistogramOpts::new(
                "search_indexer_request_size",
                "Number of changes (add, update, delete) in a sync request from a managed cluster.",
            ),
            &["code"],
        )?;
        registry.register(Box::new(request_size.clone()))?;

        let request_count = IntCounterVec::new(
            Opts::new(
                "search_indexer_request_count",
                "Total incoming sync requests from managed clusters.",
            ),
            &["managed_cluster_name"],
        )?;
        registry.register(Box::new(request_count.clone()))?;

        Ok(Self {
            registry,
            request_duration,
            request_size,
            request_count,
        })
    }

    /// Renders the registry in the Prometheus text exposition format.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}
