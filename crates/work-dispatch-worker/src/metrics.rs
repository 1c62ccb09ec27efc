use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};

/// Prometheus metrics for one dispatch loop
pub struct DispatchMetrics {
    pub registry: Registry,

    // Items by outcome: acked, failed
    pub items_total: IntCounterVec,
    pub fetch_errors_total: IntCounter,

    // Per processing unit
    pub unit_processed_total: IntCounterVec,
    pub unit_processing: IntGaugeVec,
    pub unit_errors_total: IntCounterVec,
    pub unit_processing_duration: HistogramVec,

    pub last_processed_timestamp: IntGauge,
}

impl DispatchMetrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let items_total = IntCounterVec::new(
            Opts::new("wd_items_total", "Work items settled, by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(items_total.clone()))?;

        let fetch_errors_total =
            IntCounter::new("wd_fetch_errors_total", "Failed fetches from the work source")?;
        registry.register(Box::new(fetch_errors_total.clone()))?;

        let unit_processed_total = IntCounterVec::new(
            Opts::new("wd_unit_processed_total", "Targets executed by each processing unit"),
            &["unit"],
        )?;
        registry.register(Box::new(unit_processed_total.clone()))?;

        let unit_processing = IntGaugeVec::new(
            Opts::new("wd_unit_processing", "Targets each processing unit is executing now"),
            &["unit"],
        )?;
        registry.register(Box::new(unit_processing.clone()))?;

        let unit_errors_total = IntCounterVec::new(
            Opts::new("wd_unit_errors_total", "Failed executions by processing unit"),
            &["unit"],
        )?;
        registry.register(Box::new(unit_errors_total.clone()))?;

        let unit_processing_duration = HistogramVec::new(
            HistogramOpts::new(
                "wd_unit_processing_duration_seconds",
                "Processing unit execution time in seconds",
            ),
            &["unit"],
        )?;
        registry.register(Box::new(unit_processing_duration.clone()))?;

        let last_processed_timestamp = IntGauge::new(
            "wd_last_processed_timestamp_seconds",
            "Unix time the last item was settled",
        )?;
        registry.register(Box::new(last_processed_timestamp.clone()))?;

        Ok(DispatchMetrics {
            registry,
            items_total,
            fetch_errors_total,
            unit_processed_total,
            unit_processing,
            unit_errors_total,
            unit_processing_duration,
            last_processed_timestamp,
        })
    }

    pub fn inc_items(&self, outcome: &str) {
        self.items_total.with_label_values(&[outcome]).inc();
    }

    pub fn items(&self, outcome: &str) -> u64 {
        self.items_total.with_label_values(&[outcome]).get()
    }

    pub fn unit_started(&self, unit: &str) {
        self.unit_processing.with_label_values(&[unit]).inc();
    }

    /// Record the end of one execution started with `unit_started`
    pub fn unit_finished(&self, unit: &str, duration_secs: f64, success: bool) {
        self.unit_processing.with_label_values(&[unit]).dec();
        self.unit_processed_total.with_label_values(&[unit]).inc();
        self.unit_processing_duration
            .with_label_values(&[unit])
            .observe(duration_secs);
        if !success {
            self.unit_errors_total.with_label_values(&[unit]).inc();
        }
    }

    /// (processed, errors, processing now) for one unit
    pub fn unit_counts(&self, unit: &str) -> (u64, u64, i64) {
        (
            self.unit_processed_total.with_label_values(&[unit]).get(),
            self.unit_errors_total.with_label_values(&[unit]).get(),
            self.unit_processing.with_label_values(&[unit]).get(),
        )
    }

    /// Render every metric in the Prometheus text format
    pub fn render(&self) -> anyhow::Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}
