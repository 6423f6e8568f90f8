//! A high-level StatsD metric client built on cadence.
//!
//! ## Defining Metrics
//!
//! In order to use metrics, one needs to first define one of the metric traits on a custom enum.
//! The following types of metrics are available: `counter`, `timer`, `gauge` and
//! `distribution`. For explanations on what that means see [Metric Types].
//!
//! The metric traits serve only to provide a type safe metric name. All metric types have exactly
//! the same form, they are different only to ensure that a metric can only be used for the type for
//! which it was defined, (e.g. a counter metric cannot be used as a timer metric).
//!
//! ## Passing the Client
//!
//! There is no process-wide client. Components receive a [`Metrics`] handle at construction and
//! record through it. A handle created with [`Metrics::noop`] turns every [`metric!`] invocation
//! into a noop, so metrics can be used without a statsd server.
//!
//! To connect to a statsd server, use [`init`]:
//!
//! ```no_run
//! # use std::collections::BTreeMap;
//! # use sluice_statsd::MetricsConfig;
//! let metrics = sluice_statsd::init(MetricsConfig {
//!     prefix: "sluice".to_owned(),
//!     host: "localhost:8125".to_owned(),
//!     default_tags: BTreeMap::new(),
//!     sample_rate: 1.0,
//!     aggregate: true,
//! })
//! .unwrap();
//! ```
//!
//! ## Macro Usage
//!
//! The recommended way to record metrics is by using the [`metric!`] macro with a handle:
//!
//! ```
//! use sluice_statsd::{metric, CounterMetric, Metrics};
//!
//! struct MyCounter;
//!
//! impl CounterMetric for MyCounter {
//!     fn name(&self) -> &'static str {
//!         "counter"
//!     }
//! }
//!
//! let metrics = Metrics::noop();
//! metric!(metrics, counter(MyCounter) += 1);
//! ```
//!
//! [Metric Types]: https://github.com/statsd/statsd/blob/master/docs/metric_types.md
use std::collections::BTreeMap;
use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use cadence::{Metric, MetricBuilder, StatsdClient};
use rand::Rng;
use rand::distr::StandardUniform;
use statsdproxy::cadence::StatsdProxyMetricSink;
use statsdproxy::config::AggregateMetricsConfig;

/// Maximum number of metric events that can be queued before we start dropping them.
const METRICS_MAX_QUEUE_SIZE: usize = 100_000;

/// A sample rate between `0.0` and `1.0`.
#[derive(Debug, Clone, Copy)]
pub struct SampleRate(f64);

impl From<f64> for SampleRate {
    fn from(value: f64) -> Self {
        Self(value.clamp(0.0, 1.0))
    }
}

impl From<SampleRate> for f64 {
    fn from(value: SampleRate) -> Self {
        value.0
    }
}

/// Errors raised when connecting the metrics client.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    /// The statsd host could not be resolved.
    #[error("could not resolve statsd host {0}")]
    Resolve(String, #[source] std::io::Error),
    /// The statsd host resolved to no addresses.
    #[error("statsd host {0} resolved to no addresses")]
    NoAddress(String),
}

/// A statsd client with default tags and a sample rate.
pub struct MetricsClient {
    /// The raw statsd client.
    pub statsd_client: StatsdClient,
    /// Default tags to apply to every metric.
    pub default_tags: BTreeMap<String, String>,
    /// Global sample rate.
    pub default_sample_rate: SampleRate,
}

impl fmt::Debug for MetricsClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricsClient")
            .field("default_tags", &self.default_tags)
            .field("default_sample_rate", &self.default_sample_rate)
            .finish_non_exhaustive()
    }
}

impl Deref for MetricsClient {
    type Target = StatsdClient;

    fn deref(&self) -> &StatsdClient {
        &self.statsd_client
    }
}

impl MetricsClient {
    /// Send a metric with the default tags defined on this `MetricsClient`.
    #[inline(always)]
    pub fn send_metric<'a, T>(&'a self, metric: MetricBuilder<'a, '_, T>)
    where
        T: Metric + From<String>,
    {
        self.send_metric_with_sample_rate(metric, None)
    }

    /// Send a metric with an explicit sample rate that overrides the global sample rate.
    #[doc(hidden)]
    #[inline(always)]
    pub fn send_metric_with_sample_rate<'a, T>(
        &'a self,
        mut metric: MetricBuilder<'a, '_, T>,
        sample_rate: Option<SampleRate>,
    ) where
        T: Metric + From<String>,
    {
        let effective_sample_rate = match sample_rate {
            Some(sample_rate) => sample_rate.0.min(self.default_sample_rate.0),
            None => self.default_sample_rate.0,
        };
        if !Self::should_send(effective_sample_rate) {
            return;
        }

        for (k, v) in &self.default_tags {
            metric = metric.with_tag(k, v);
        }

        if effective_sample_rate < 1.0 {
            metric = metric.with_sampling_rate(effective_sample_rate);
        }

        if let Err(error) = metric.try_send() {
            sluice_log::error!(
                error = &error as &dyn std::error::Error,
                maximum_capacity = METRICS_MAX_QUEUE_SIZE,
                "error sending a metric",
            );
        }
    }

    fn should_send(sample_rate: f64) -> bool {
        if sample_rate <= 0.0 {
            false
        } else if sample_rate >= 1.0 {
            true
        } else {
            let s: f64 = rand::rng().sample(StandardUniform);
            s <= sample_rate
        }
    }
}

/// A cheaply cloneable handle to an optional [`MetricsClient`].
///
/// Every component that records metrics receives one of these at construction.
#[derive(Clone, Debug, Default)]
pub struct Metrics {
    client: Option<Arc<MetricsClient>>,
}

impl Metrics {
    /// Wraps a configured client.
    pub fn new(client: MetricsClient) -> Self {
        Self {
            client: Some(Arc::new(client)),
        }
    }

    /// Returns a handle that discards all metrics.
    pub fn noop() -> Self {
        Self::default()
    }

    /// Returns `true` if metrics are sent anywhere.
    pub fn is_enabled(&self) -> bool {
        self.client.is_some()
    }

    /// Returns a handle that captures all metrics in memory, along with the capture.
    ///
    /// Intended for tests.
    pub fn capturing() -> (Self, MetricsCapture) {
        let (rx, sink) = cadence::SpyMetricSink::new();
        let client = MetricsClient {
            statsd_client: StatsdClient::from_sink("", sink),
            default_tags: Default::default(),
            default_sample_rate: 1.0.into(),
        };

        (Self::new(client), MetricsCapture(rx))
    }

    /// Invoke a callback with the client.
    ///
    /// If the handle is a noop, the callback is not invoked. For the most part the [`metric!`]
    /// macro should be used instead.
    #[inline(always)]
    pub fn with_client<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&MetricsClient) -> R,
        R: Default,
    {
        match self.client.as_deref() {
            Some(client) => f(client),
            None => R::default(),
        }
    }
}

/// Metrics captured by a handle from [`Metrics::capturing`].
#[derive(Debug)]
pub struct MetricsCapture(crossbeam_channel::Receiver<Vec<u8>>);

impl MetricsCapture {
    /// Returns all metrics captured since the last call, in statsd line format.
    pub fn drain(&self) -> Vec<String> {
        self.0
            .try_iter()
            .map(|line| String::from_utf8_lossy(&line).into_owned())
            .collect()
    }
}

/// Client configuration used by [`init`].
#[derive(Debug)]
pub struct MetricsConfig {
    /// Prefix which is prepended to all metric names.
    pub prefix: String,
    /// Host and port of the statsd server.
    pub host: String,
    /// Tags that are added to all metrics.
    pub default_tags: BTreeMap<String, String>,
    /// Default sample rate for metrics, between 0.0 (= 0%) and 1.0 (= 100%).
    pub sample_rate: f64,
    /// If metrics should be aggregated locally before they are sent upstream.
    pub aggregate: bool,
}

fn resolve(host: &str) -> Result<SocketAddr, MetricsError> {
    host.to_socket_addrs()
        .map_err(|e| MetricsError::Resolve(host.to_owned(), e))?
        .next()
        .ok_or_else(|| MetricsError::NoAddress(host.to_owned()))
}

/// Creates a metrics handle that reports to statsd.
pub fn init(config: MetricsConfig) -> Result<Metrics, MetricsError> {
    let addr = resolve(&config.host)?;
    sluice_log::info!("reporting metrics to statsd at {addr}");

    let sample_rate = SampleRate::from(config.sample_rate);
    sluice_log::debug!(
        "metrics sample rate is set to {}{}",
        sample_rate.0,
        if sample_rate.0 == 0.0 {
            ", no metrics will be reported"
        } else {
            ""
        }
    );

    let statsd_client = if config.aggregate {
        let sink = StatsdProxyMetricSink::new(move || {
            let upstream = statsdproxy::middleware::upstream::Upstream::new(addr)
                .expect("failed to create statsdproxy metric sink");

            statsdproxy::middleware::aggregate::AggregateMetrics::new(
                AggregateMetricsConfig {
                    aggregate_gauges: true,
                    aggregate_counters: true,
                    flush_interval: Duration::from_millis(50),
                    flush_offset: 0,
                    max_map_size: None,
                },
                upstream,
            )
        });

        StatsdClient::from_sink(&config.prefix, sink)
    } else {
        let sink = StatsdProxyMetricSink::new(move || {
            statsdproxy::middleware::upstream::Upstream::new(addr)
                .expect("failed to create statsdproxy metric sink")
        });

        StatsdClient::from_sink(&config.prefix, sink)
    };

    Ok(Metrics::new(MetricsClient {
        statsd_client,
        default_tags: config.default_tags,
        default_sample_rate: sample_rate,
    }))
}

/// Internal prelude for the macro.
#[doc(hidden)]
pub mod _pred {
    pub use cadence::prelude::*;
}

/// A metric for capturing timings.
///
/// Timings are a positive number of milliseconds between a start and end time.
///
/// ## Example
///
/// ```
/// use sluice_statsd::{metric, Metrics, TimerMetric};
///
/// enum MyTimer {
///     Resolve,
/// }
///
/// impl TimerMetric for MyTimer {
///     fn name(&self) -> &'static str {
///         match self {
///             Self::Resolve => "resolve",
///         }
///     }
/// }
///
/// # let metrics = Metrics::noop();
/// # use std::time::Instant;
/// let start_time = Instant::now();
/// metric!(metrics, timer(MyTimer::Resolve) = start_time.elapsed());
///
/// // measure time implicitly by enclosing a code block in a metric
/// metric!(metrics, timer(MyTimer::Resolve), {
///     // do work
/// });
/// ```
pub trait TimerMetric {
    /// Returns the timer metric name that will be sent to statsd.
    fn name(&self) -> &'static str;
}

/// A metric for capturing counters.
///
/// Counters are simple values incremented or decremented by a client. The rates at which these
/// events occur or average values will be determined by the server receiving them.
pub trait CounterMetric {
    /// Returns the counter metric name that will be sent to statsd.
    fn name(&self) -> &'static str;
}

/// A metric for capturing distributions.
///
/// A distribution is often similar to timers. Distributions can be thought of as a more general
/// (not limited to timing things) form of timers.
pub trait DistributionMetric {
    /// Returns the distribution metric name that will be sent to statsd.
    fn name(&self) -> &'static str;
}

/// A metric for capturing gauges.
///
/// Gauge values are an instantaneous measurement of a value determined by the client. They do not
/// change unless changed by the client.
pub trait GaugeMetric {
    /// Returns the gauge metric name that will be sent to statsd.
    fn name(&self) -> &'static str;
}

/// Emits a metric through a [`Metrics`] handle.
///
/// The first argument is the handle. See [crate-level documentation](self) for examples.
#[macro_export]
macro_rules! metric {
    // counter increment
    ($metrics:expr, counter($id:expr) += $value:expr $(, $($k:ident).* = $v:expr)* $(,)?) => {
        match $value {
            value if value != 0 => {
                $metrics.with_client(|client| {
                    use $crate::_pred::*;
                    client.send_metric(
                        client.count_with_tags(&$crate::CounterMetric::name(&$id), value)
                        $(.with_tag(stringify!($($k).*), $v))*
                    )
                })
            },
            _ => {},
        };
    };

    // gauge set
    ($metrics:expr, gauge($id:expr) = $value:expr $(, $($k:ident).* = $v:expr)* $(,)?) => {
        $metrics.with_client(|client| {
            use $crate::_pred::*;
            client.send_metric(
                client.gauge_with_tags(&$crate::GaugeMetric::name(&$id), $value)
                    $(.with_tag(stringify!($($k).*), $v))*
            )
        })
    };

    // distribution
    ($metrics:expr, distribution($id:expr) = $value:expr $(, $($k:ident).* = $v:expr)* $(,)?) => {
        $metrics.with_client(|client| {
            use $crate::_pred::*;
            client.send_metric(
                client.distribution_with_tags(&$crate::DistributionMetric::name(&$id), $value)
                    $(.with_tag(stringify!($($k).*), $v))*
            )
        })
    };

    // timer value
    ($metrics:expr, timer($id:expr) = $value:expr $(, $($k:ident).* = $v:expr)* $(,)?) => {
        $metrics.with_client(|client| {
            use $crate::_pred::*;
            client.send_metric(
                // NOTE: cadence converts a Duration to nanos, but timers are reported in milliseconds.
                client.distribution_with_tags(&$crate::TimerMetric::name(&$id), $value.as_nanos() as f64 / 1e6)
                    $(.with_tag(stringify!($($k).*), $v))*
            )
        })
    };

    // timed block
    ($metrics:expr, timer($id:expr), $($($k:ident).* = $v:expr,)* $block:block) => {{
        let now = std::time::Instant::now();
        let rv = {$block};
        $crate::metric!($metrics, timer($id) = now.elapsed() $(, $($k).* = $v)*);
        rv
    }};
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::{CounterMetric, DistributionMetric, GaugeMetric, Metrics, TimerMetric};

    enum TestGauges {
        CacheSize,
        StoreSize,
    }

    impl GaugeMetric for TestGauges {
        fn name(&self) -> &'static str {
            match self {
                Self::CacheSize => "cache_size",
                Self::StoreSize => "store_size",
            }
        }
    }

    struct TestCounter;

    impl CounterMetric for TestCounter {
        fn name(&self) -> &'static str {
            "points"
        }
    }

    struct TestDistribution;

    impl DistributionMetric for TestDistribution {
        fn name(&self) -> &'static str {
            "centroids"
        }
    }

    struct TestTimer;

    impl TimerMetric for TestTimer {
        fn name(&self) -> &'static str {
            "resolve"
        }
    }

    #[test]
    fn test_capturing_client() {
        let (metrics, capture) = Metrics::capturing();

        metric!(
            metrics,
            gauge(TestGauges::CacheSize) = 123,
            granularity = "minute",
            port = "2878"
        );
        metric!(
            metrics,
            gauge(TestGauges::StoreSize) = 456,
            granularity = "hour",
            port = "2879"
        );

        assert_eq!(
            capture.drain(),
            [
                "cache_size:123|g|#granularity:minute,port:2878",
                "store_size:456|g|#granularity:hour,port:2879"
            ]
        )
    }

    #[test]
    fn test_noop_client() {
        let metrics = Metrics::noop();
        assert!(!metrics.is_enabled());

        // Must not panic or send anything.
        metric!(metrics, counter(TestCounter) += 1);
        let sent: bool = metrics.with_client(|_| true);
        assert!(!sent);
    }

    #[test]
    fn test_counter_tags_with_dots_and_zero() {
        let (metrics, capture) = Metrics::capturing();

        metric!(
            metrics,
            counter(TestCounter) += 10,
            hc.granularity = "minute",
            port = "2878",
        );
        metric!(metrics, counter(TestCounter) += 0);

        assert_eq!(
            capture.drain(),
            ["points:10|c|#hc.granularity:minute,port:2878"]
        );
    }

    #[test]
    fn test_distribution() {
        let (metrics, capture) = Metrics::capturing();

        metric!(
            metrics,
            distribution(TestDistribution) = 17,
            granularity = "day",
        );

        assert_eq!(capture.drain(), ["centroids:17|d|#granularity:day"]);
    }

    #[test]
    fn test_timer() {
        let (metrics, capture) = Metrics::capturing();

        let duration = Duration::from_millis(1500);
        metric!(metrics, timer(TestTimer) = duration, granularity = "minute");

        assert_eq!(capture.drain(), ["resolve:1500|d|#granularity:minute"]);
    }

    #[test]
    fn test_timed_block() {
        let (metrics, capture) = Metrics::capturing();

        let value = metric!(metrics, timer(TestTimer), granularity = "hour", { 42 });

        assert_eq!(value, 42);
        let captures = capture.drain();
        assert_eq!(captures.len(), 1);
        assert!(captures[0].starts_with("resolve:"));
        assert!(captures[0].ends_with("|d|#granularity:hour"));
    }

    #[test]
    fn test_cloned_handles_share_client() {
        let (metrics, capture) = Metrics::capturing();
        let cloned = metrics.clone();

        metric!(cloned, counter(TestCounter) += 1);

        assert_eq!(capture.drain(), ["points:1|c"]);
    }
}
