use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use sluice_statsd::{Metrics, metric};

use crate::accumulator::Accumulator;
use crate::clock::Clock;
use crate::decoder::{DecodeError, DecodedPoint, PointDecoder, PointValue};
use crate::granularity::Granularity;
use crate::key::HistogramKey;
use crate::statsd::HistogramCounters;
use crate::store::StoreError;
use crate::tape::{Tape, TapeError};

/// Why a line was not accumulated.
#[derive(Debug)]
pub enum BlockReason<'a> {
    /// The line could not be decoded.
    Decode(&'a DecodeError),
    /// The pipeline does not accept this kind of point.
    Unsupported(&'static str),
    /// The accumulator rejected the point.
    Store(&'a StoreError),
}

impl BlockReason<'_> {
    /// A short, stable identifier for metric tags.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Decode(error) => error.reason(),
            Self::Unsupported(_) => "unsupported",
            Self::Store(_) => "store",
        }
    }
}

impl fmt::Display for BlockReason<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Decode(error) => error.fmt(f),
            Self::Unsupported(reason) => f.write_str(reason),
            Self::Store(error) => error.fmt(f),
        }
    }
}

/// Receives lines that were rejected during ingestion.
pub trait BlockedSink: fmt::Debug + Send + Sync {
    /// Reports a rejected line along with the reason.
    fn block(&self, line: &str, reason: &BlockReason<'_>);
}

/// A [`BlockedSink`] that logs rejected lines.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogBlockedSink;

impl BlockedSink for LogBlockedSink {
    fn block(&self, line: &str, reason: &BlockReason<'_>) {
        sluice_log::debug!(
            target: "sluice::blocked",
            reason = reason.name(),
            "blocked line {line:?}: {reason}"
        );
    }
}

/// Parameters for an [`IngestionTask`].
#[derive(Clone, Debug)]
pub struct IngestConfig {
    /// The granularity keys are computed for.
    pub granularity: Granularity,
    /// Compression of newly created digests.
    pub compression: u16,
    /// Delay after which a newly created digest becomes ripe.
    pub flush_delay: Duration,
    /// Maximum number of lines taken from the tape at once.
    pub batch_size: usize,
}

/// Moves lines from one tape into an accumulator.
///
/// Every line is decoded, validated, and merged into the digest for its key. Lines that fail are
/// reported to the blocked sink without affecting the rest of the batch.
pub struct IngestionTask {
    config: IngestConfig,
    tape: Arc<dyn Tape>,
    decoder: Arc<dyn PointDecoder>,
    accumulator: Arc<Accumulator>,
    blocked: Arc<dyn BlockedSink>,
    clock: Arc<dyn Clock>,
    metrics: Metrics,
}

impl IngestionTask {
    /// Creates a new ingestion task.
    pub fn new(
        config: IngestConfig,
        tape: Arc<dyn Tape>,
        decoder: Arc<dyn PointDecoder>,
        accumulator: Arc<Accumulator>,
        blocked: Arc<dyn BlockedSink>,
        clock: Arc<dyn Clock>,
        metrics: Metrics,
    ) -> Self {
        Self {
            config,
            tape,
            decoder,
            accumulator,
            blocked,
            clock,
            metrics,
        }
    }

    /// Processes a single batch from the tape and returns the number of lines taken.
    pub fn run_once(&self) -> Result<usize, TapeError> {
        let lines = self.tape.poll(self.config.batch_size)?;
        for line in &lines {
            if line.trim().is_empty() {
                continue;
            }
            self.ingest(line);
        }
        Ok(lines.len())
    }

    /// Processes batches until the tape has no full batch left.
    pub fn drain(&self) -> Result<usize, TapeError> {
        let mut total = 0;
        loop {
            let taken = self.run_once()?;
            total += taken;
            if taken < self.config.batch_size {
                return Ok(total);
            }
        }
    }

    fn ingest(&self, line: &str) {
        let point = match self.decoder.decode(line) {
            Ok(point) => point,
            Err(error) => return self.block(line, &BlockReason::Decode(&error)),
        };

        match self.accumulate(point) {
            Ok(()) => (),
            Err(IngestFailure::Unsupported(reason)) => {
                self.block(line, &BlockReason::Unsupported(reason))
            }
            Err(IngestFailure::Store(error)) => self.block(line, &BlockReason::Store(&error)),
        }
    }

    fn accumulate(&self, point: DecodedPoint) -> Result<(), IngestFailure> {
        let granularity = self.config.granularity;
        if granularity == Granularity::Dist && matches!(point.value, PointValue::Sample(_)) {
            return Err(IngestFailure::Unsupported(
                "samples are not accepted by distribution pipelines",
            ));
        }

        let timestamp_ms = point
            .timestamp_ms
            .unwrap_or_else(|| self.clock.now_millis());
        let key = HistogramKey::new(
            granularity,
            timestamp_ms,
            point.metric,
            point.source,
            point.tags,
        );

        let compression = self.config.compression;
        let ttl = self.config.flush_delay;
        match point.value {
            PointValue::Sample(value) => self.accumulator.put_value(key, value, compression, ttl),
            PointValue::Distribution { centroids, .. } => self
                .accumulator
                .put_distribution(key, &centroids, compression, ttl),
        }
        .map_err(IngestFailure::Store)?;

        metric!(
            self.metrics,
            counter(HistogramCounters::IngestPoints) += 1,
            granularity = granularity.name()
        );

        Ok(())
    }

    fn block(&self, line: &str, reason: &BlockReason<'_>) {
        metric!(
            self.metrics,
            counter(HistogramCounters::IngestBlocked) += 1,
            granularity = self.config.granularity.name(),
            reason = reason.name()
        );

        if let BlockReason::Store(error) = reason {
            sluice_log::error!(
                error = *error as &dyn std::error::Error,
                granularity = self.config.granularity.name(),
                "failed to accumulate point"
            );
        }

        self.blocked.block(line, reason);
    }
}

impl fmt::Debug for IngestionTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IngestionTask")
            .field("config", &self.config)
            .field("tape", &self.tape)
            .finish_non_exhaustive()
    }
}

enum IngestFailure {
    Unsupported(&'static str),
    Store(StoreError),
}
