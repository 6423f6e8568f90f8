use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// The time window a pipeline aggregates samples into.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    /// One-minute bins.
    Minute,
    /// One-hour bins.
    Hour,
    /// One-day bins.
    Day,
    /// Pre-aggregated distributions whose bin is supplied by the sender.
    Dist,
}

struct GranularityInfo {
    duration: Option<Duration>,
    name: &'static str,
    wire_id: u8,
    flush_delay: Duration,
}

const fn info(granularity: Granularity) -> GranularityInfo {
    match granularity {
        Granularity::Minute => GranularityInfo {
            duration: Some(Duration::from_secs(60)),
            name: "minute",
            wire_id: 0,
            flush_delay: Duration::from_secs(70),
        },
        Granularity::Hour => GranularityInfo {
            duration: Some(Duration::from_secs(3600)),
            name: "hour",
            wire_id: 1,
            flush_delay: Duration::from_secs(4200),
        },
        Granularity::Day => GranularityInfo {
            duration: Some(Duration::from_secs(86400)),
            name: "day",
            wire_id: 2,
            flush_delay: Duration::from_secs(18000),
        },
        Granularity::Dist => GranularityInfo {
            duration: None,
            name: "distribution",
            wire_id: 3,
            flush_delay: Duration::from_secs(70),
        },
    }
}

impl Granularity {
    /// All granularities in pipeline order.
    pub const ALL: [Self; 4] = [Self::Minute, Self::Hour, Self::Day, Self::Dist];

    /// Returns the bin width, or `None` for [`Granularity::Dist`].
    pub const fn duration(self) -> Option<Duration> {
        info(self).duration
    }

    /// Returns the bin width in milliseconds.
    ///
    /// Distributions have no fixed width of their own and return `0`.
    pub fn duration_millis(self) -> i64 {
        self.duration().map_or(0, |d| d.as_millis() as i64)
    }

    /// The name used in file names, metric tags and logs.
    pub const fn name(self) -> &'static str {
        info(self).name
    }

    /// The default delay between the creation of a bin and its dispatch.
    ///
    /// Exceeds the bin width so that late samples still land in an open bin.
    pub const fn default_flush_delay(self) -> Duration {
        info(self).flush_delay
    }

    /// Truncates a timestamp to the start of the bin containing it.
    ///
    /// Distributions are not truncated.
    pub fn bin_start(self, timestamp_ms: i64) -> i64 {
        match self.duration_millis() {
            0 => timestamp_ms,
            width => timestamp_ms.div_euclid(width) * width,
        }
    }

    pub(crate) const fn wire_id(self) -> u8 {
        info(self).wire_id
    }

    pub(crate) fn from_wire_id(id: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|g| g.wire_id() == id)
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
