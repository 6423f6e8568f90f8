use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sluice_statsd::{Metrics, metric};

use crate::accumulator::Accumulator;
use crate::clock::Clock;
use crate::digest::{AgentDigest, Centroid};
use crate::granularity::Granularity;
use crate::key::HistogramKey;
use crate::statsd::{HistogramCounters, HistogramGauges, HistogramTimers};

/// A finished histogram, ready for delivery.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct HistogramPoint {
    /// The metric name.
    pub metric: String,
    /// The source that reported the samples.
    pub source: String,
    /// Point tags.
    pub tags: BTreeMap<String, String>,
    /// Start of the bin in milliseconds since the epoch.
    pub timestamp_ms: i64,
    /// The granularity of the bin.
    pub granularity: Granularity,
    /// The compressed centroids, ordered by mean.
    pub centroids: Vec<Centroid>,
}

impl HistogramPoint {
    /// Converts an accumulated digest into a point.
    pub fn from_digest(key: &HistogramKey, digest: AgentDigest) -> Self {
        Self {
            metric: key.metric().to_owned(),
            source: key.source().to_owned(),
            tags: key.tags().clone(),
            timestamp_ms: key.bin_start(),
            granularity: key.granularity(),
            centroids: digest.centroids(),
        }
    }

    /// Total number of samples in this point.
    pub fn count(&self) -> u64 {
        self.centroids
            .iter()
            .fold(0u64, |total, c| total.saturating_add(c.count))
    }
}

/// An error returned by a [`ReportSink`].
#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    /// Writing the point failed.
    #[error("failed to write point")]
    Io(#[from] io::Error),
    /// The point could not be serialized.
    #[error("failed to serialize point")]
    Serialize(#[from] serde_json::Error),
    /// The receiver refused the point.
    #[error("point rejected: {0}")]
    Rejected(String),
}

/// Receives finished points for delivery.
///
/// Batching, rate limiting, and retries are up to the implementation. Once a point has been
/// handed over, the dispatcher does not retry it.
pub trait ReportSink: fmt::Debug + Send + Sync {
    /// Hands a single point over for delivery.
    fn report(&self, point: HistogramPoint) -> Result<(), ReportError>;
}

/// Outcome of a single [`Dispatcher::run_once`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Ripe digests removed from the accumulator, including failed ones.
    pub dispatched: usize,
    /// Digests that could not be reported.
    pub errors: usize,
}

/// Ships ripe digests from an accumulator to a report sink.
pub struct Dispatcher {
    accumulator: Arc<Accumulator>,
    sink: Arc<dyn ReportSink>,
    clock: Arc<dyn Clock>,
    limit: Option<usize>,
    metrics: Metrics,
}

impl Dispatcher {
    /// Creates a dispatcher.
    ///
    /// If `limit` is set, a single run stops after this many digests. The remaining ripe digests
    /// are picked up by the next run.
    pub fn new(
        accumulator: Arc<Accumulator>,
        sink: Arc<dyn ReportSink>,
        clock: Arc<dyn Clock>,
        limit: Option<usize>,
        metrics: Metrics,
    ) -> Self {
        Self {
            accumulator,
            sink,
            clock,
            limit,
            metrics,
        }
    }

    /// Dispatches ripe digests.
    ///
    /// Every ripe digest is removed from the accumulator, even if it cannot be reported.
    pub fn run_once(&self) -> DispatchStats {
        let granularity = self.accumulator.granularity().name();

        let stats = metric!(
            self.metrics,
            timer(HistogramTimers::DispatchProcess),
            granularity = granularity,
            { self.dispatch() }
        );

        metric!(
            self.metrics,
            counter(HistogramCounters::Dispatched) += stats.dispatched as i64,
            granularity = granularity
        );
        metric!(
            self.metrics,
            counter(HistogramCounters::DispatchErrors) += stats.errors as i64,
            granularity = granularity
        );
        metric!(
            self.metrics,
            gauge(HistogramGauges::AccumulatorSize) = self.accumulator.size() as u64,
            granularity = granularity
        );

        stats
    }

    fn dispatch(&self) -> DispatchStats {
        let mut stats = DispatchStats::default();
        let mut ripe = self.accumulator.ripe_keys(self.clock.now_millis());

        while let Some(key) = ripe.next() {
            let mut dispatched = false;
            let result = self.accumulator.compute(&key, |key, digest| {
                let digest = digest?;
                dispatched = true;

                let point = HistogramPoint::from_digest(key, digest);
                if let Err(error) = self.sink.report(point) {
                    stats.errors += 1;
                    sluice_log::error!(
                        error = &error as &dyn std::error::Error,
                        key = %key,
                        "failed dispatching entry"
                    );
                }

                None
            });

            if let Err(error) = result {
                stats.errors += 1;
                sluice_log::error!(
                    error = &error as &dyn std::error::Error,
                    key = %key,
                    "failed to remove dispatched entry"
                );
            }

            ripe.remove(&key);

            if dispatched {
                stats.dispatched += 1;
                if self.limit.is_some_and(|limit| stats.dispatched >= limit) {
                    break;
                }
            }
        }

        stats
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("accumulator", &self.accumulator)
            .field("sink", &self.sink)
            .field("limit", &self.limit)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use parking_lot::Mutex;

    use super::*;
    use crate::accumulator::AccumulatorConfig;
    use crate::clock::ManualClock;
    use crate::store::DigestStore;

    #[derive(Debug, Default)]
    struct CollectingSink {
        points: Mutex<Vec<HistogramPoint>>,
        fail: bool,
    }

    impl ReportSink for CollectingSink {
        fn report(&self, point: HistogramPoint) -> Result<(), ReportError> {
            if self.fail {
                return Err(ReportError::Rejected("downstream unavailable".to_owned()));
            }
            self.points.lock().push(point);
            Ok(())
        }
    }

    fn key(name: &str) -> HistogramKey {
        let tags = BTreeMap::from([("region".to_owned(), "us-west".to_owned())]);
        HistogramKey::new(Granularity::Minute, 61_000, name, "app-1", tags)
    }

    fn setup(
        sink: Arc<CollectingSink>,
        limit: Option<usize>,
        metrics: Metrics,
    ) -> (Dispatcher, Arc<Accumulator>, ManualClock) {
        let clock = ManualClock::new(0);
        let accumulator = Arc::new(Accumulator::new(
            Arc::new(DigestStore::in_memory(100)),
            AccumulatorConfig {
                granularity: Granularity::Minute,
                memory_cache: true,
                cache_bound: 100,
            },
            Arc::new(clock.clone()),
            Metrics::noop(),
        ));
        let dispatcher = Dispatcher::new(
            accumulator.clone(),
            sink,
            Arc::new(clock.clone()),
            limit,
            metrics,
        );
        (dispatcher, accumulator, clock)
    }

    fn put(accumulator: &Accumulator, name: &str, ttl_secs: u64) {
        accumulator
            .put_value(key(name), 10.0, 32, Duration::from_secs(ttl_secs))
            .unwrap();
    }

    #[test]
    fn test_only_ripe_entries_are_dispatched() {
        let sink = Arc::new(CollectingSink::default());
        let (dispatcher, accumulator, clock) = setup(sink.clone(), None, Metrics::noop());

        put(&accumulator, "a", 1);
        put(&accumulator, "b", 100);
        accumulator.flush().unwrap();

        clock.set(1_000);
        assert_eq!(
            dispatcher.run_once(),
            DispatchStats {
                dispatched: 1,
                errors: 0
            }
        );

        let points = sink.points.lock();
        similar_asserts::assert_eq!(
            *points,
            vec![HistogramPoint {
                metric: "a".to_owned(),
                source: "app-1".to_owned(),
                tags: BTreeMap::from([("region".to_owned(), "us-west".to_owned())]),
                timestamp_ms: 60_000,
                granularity: Granularity::Minute,
                centroids: vec![Centroid::new(10.0, 1)],
            }]
        );
        assert_eq!(accumulator.size(), 1);
        assert!(accumulator.store().contains_key(&key("b")));
    }

    #[test]
    fn test_dispatch_limit() {
        let sink = Arc::new(CollectingSink::default());
        let (dispatcher, accumulator, clock) = setup(sink.clone(), Some(2), Metrics::noop());

        for name in ["a", "b", "c", "d", "e"] {
            put(&accumulator, name, 1);
        }
        clock.set(1_000);

        assert_eq!(dispatcher.run_once().dispatched, 2);
        assert_eq!(dispatcher.run_once().dispatched, 2);
        assert_eq!(dispatcher.run_once().dispatched, 1);
        assert_eq!(dispatcher.run_once().dispatched, 0);
        assert_eq!(sink.points.lock().len(), 5);
    }

    #[test]
    fn test_report_error_removes_entry() {
        let sink = Arc::new(CollectingSink {
            fail: true,
            ..Default::default()
        });
        let (metrics, capture) = Metrics::capturing();
        let (dispatcher, accumulator, clock) = setup(sink, None, metrics);

        put(&accumulator, "a", 1);
        put(&accumulator, "b", 1);
        clock.set(1_000);

        assert_eq!(
            dispatcher.run_once(),
            DispatchStats {
                dispatched: 2,
                errors: 2
            }
        );
        assert_eq!(accumulator.ripe_keys(i64::MAX).count(), 0);
        assert_eq!(accumulator.cache_len(), 0);

        let captured = capture.drain();
        assert!(captured.contains(&"histogram.accumulator.dispatched:2|c|#granularity:minute".to_owned()));
        assert!(
            captured.contains(&"histogram.accumulator.dispatch_errors:2|c|#granularity:minute".to_owned())
        );
        assert!(captured.contains(&"histogram.accumulator.size:0|g|#granularity:minute".to_owned()));
    }

    #[test]
    fn test_merge_after_claim_creates_new_entry() {
        let sink = Arc::new(CollectingSink::default());
        let (dispatcher, accumulator, clock) = setup(sink.clone(), None, Metrics::noop());

        put(&accumulator, "a", 1);
        clock.set(1_000);
        dispatcher.run_once();

        put(&accumulator, "a", 70);
        assert_eq!(dispatcher.run_once().dispatched, 0);

        clock.set(71_000);
        assert_eq!(dispatcher.run_once().dispatched, 1);

        let points = sink.points.lock();
        assert_eq!(points.len(), 2);
        assert!(points.iter().all(|p| p.count() == 1));
    }

    #[test]
    fn test_point_json() {
        let mut digest = AgentDigest::new(32, 0);
        digest.merge_value(1.5);

        let point = HistogramPoint::from_digest(&key("request.latency"), digest);
        insta::assert_snapshot!(serde_json::to_string(&point).unwrap(), @r#"{"metric":"request.latency","source":"app-1","tags":{"region":"us-west"},"timestamp_ms":60000,"granularity":"minute","centroids":[{"mean":1.5,"count":1}]}"#);
    }
}
