use sluice_statsd::{CounterMetric, GaugeMetric, TimerMetric};

/// Counter metrics for histogram pipelines.
///
/// All counters are tagged by `granularity`.
pub enum HistogramCounters {
    /// Incremented for every ripe digest reported downstream.
    Dispatched,

    /// Incremented for every ripe digest that could not be reported.
    ///
    /// The digest is dropped regardless.
    DispatchErrors,

    /// Incremented for every sample or distribution merged into an accumulator.
    IngestPoints,

    /// Incremented for every line that failed to decode or validate.
    ///
    /// Additionally tagged by `reason`.
    IngestBlocked,

    /// Incremented every time a new digest is created for a key.
    BinsCreated,

    /// Incremented every time samples are merged into an existing digest.
    BinsMerged,

    /// Incremented for every entry written straight to the store because the local cache was
    /// full.
    StoreWriteThrough,
}

impl CounterMetric for HistogramCounters {
    fn name(&self) -> &'static str {
        match *self {
            Self::Dispatched => "histogram.accumulator.dispatched",
            Self::DispatchErrors => "histogram.accumulator.dispatch_errors",
            Self::IngestPoints => "histogram.ingest.points",
            Self::IngestBlocked => "histogram.ingest.blocked",
            Self::BinsCreated => "histogram.bins.created",
            Self::BinsMerged => "histogram.bins.merged",
            Self::StoreWriteThrough => "histogram.store.write_through",
        }
    }
}

/// Timer metrics for histogram pipelines.
pub enum HistogramTimers {
    /// Time in milliseconds spent in a single dispatch run.
    ///
    /// This includes reporting points downstream.
    DispatchProcess,

    /// Time in milliseconds spent writing the local cache back into the store.
    Resolve,
}

impl TimerMetric for HistogramTimers {
    fn name(&self) -> &'static str {
        match *self {
            Self::DispatchProcess => "histogram.accumulator.dispatch_process",
            Self::Resolve => "histogram.accumulator.resolve",
        }
    }
}

/// Gauge metrics for histogram pipelines.
pub enum HistogramGauges {
    /// The number of digests in the store, measured after every dispatch run.
    AccumulatorSize,
}

impl GaugeMetric for HistogramGauges {
    fn name(&self) -> &'static str {
        match *self {
            Self::AccumulatorSize => "histogram.accumulator.size",
        }
    }
}
