//! Pipeline configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::digest::{AgentDigest, MAX_COMPRESSION, MIN_COMPRESSION};
use crate::granularity::Granularity;

/// Parameters of a single histogram pipeline.
///
/// Fields whose default depends on the granularity are optional. Use the accessors, which take
/// the pipeline's [`Granularity`], to read effective values.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// TCP ports that accept lines for this pipeline.
    ///
    /// Defaults to no ports.
    pub ports: Vec<u16>,

    /// Seconds after the first sample until a digest becomes ripe.
    ///
    /// Defaults to `70` for minute, `4200` for hour, `18000` for day and `70` for distribution
    /// pipelines.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flush_delay: Option<u64>,

    /// The number of ingestion shards per port.
    ///
    /// Defaults to `4` for minute pipelines and `1` otherwise.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fanout: Option<usize>,

    /// Expected number of live digests, used to size the store.
    ///
    /// Defaults to `100000`.
    pub capacity: u64,

    /// Expected average size of an encoded key in bytes.
    ///
    /// Defaults to `150`.
    pub avg_key_size: u32,

    /// Expected average size of an encoded digest in bytes.
    ///
    /// This is only a sizing hint. Defaults to `32 + 7 * compression`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_value_size: Option<u32>,

    /// Compression of newly created digests.
    ///
    /// Must be between `20` and `1000`. Defaults to `32`.
    pub compression: u16,

    /// Whether merges are absorbed by a local cache before they reach the store.
    ///
    /// Defaults to `true` for minute pipelines and `false` otherwise.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_cache: Option<bool>,

    /// Whether digests are persisted to the state directory.
    ///
    /// Defaults to `true`.
    pub persisted: bool,

    /// Seconds between writing the local cache back into the store.
    ///
    /// Defaults to `5`.
    pub resolve_interval: u64,

    /// Milliseconds between scans for ripe digests.
    ///
    /// Defaults to `1000`.
    pub dispatch_interval_ms: u64,

    /// Maximum number of digests dispatched in a single scan.
    ///
    /// Defaults to no limit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dispatch_limit: Option<usize>,

    /// Maximum number of lines an ingestion shard takes from its tape at once.
    ///
    /// Defaults to `1000`.
    pub batch_size: usize,

    /// Milliseconds between polls of an ingestion shard's tape.
    ///
    /// Defaults to `100`.
    pub scan_interval_ms: u64,

    /// Maximum number of keys held by the local cache.
    ///
    /// Defaults to `10000`.
    pub cache_bound: usize,
}

impl PipelineConfig {
    /// Delay after the first sample until a digest becomes ripe.
    pub fn flush_delay(&self, granularity: Granularity) -> Duration {
        self.flush_delay
            .map(Duration::from_secs)
            .unwrap_or_else(|| granularity.default_flush_delay())
    }

    /// The number of ingestion shards per port.
    pub fn fanout(&self, granularity: Granularity) -> usize {
        self.fanout.unwrap_or(match granularity {
            Granularity::Minute => 4,
            _ => 1,
        })
    }

    /// Whether the local cache is enabled.
    pub fn memory_cache(&self, granularity: Granularity) -> bool {
        self.memory_cache
            .unwrap_or(granularity == Granularity::Minute)
    }

    /// Expected average size of an encoded digest.
    pub fn avg_value_size(&self) -> u32 {
        self.avg_value_size
            .unwrap_or_else(|| AgentDigest::estimated_size(self.compression))
    }

    /// Interval between resolves.
    pub fn resolve_interval(&self) -> Duration {
        Duration::from_secs(self.resolve_interval)
    }

    /// Interval between dispatch scans.
    pub fn dispatch_interval(&self) -> Duration {
        Duration::from_millis(self.dispatch_interval_ms)
    }

    /// Interval between tape polls.
    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }

    /// Checks the configuration for values the pipeline cannot run with.
    pub fn validate(&self, granularity: Granularity) -> Result<(), InvalidPipelineConfig> {
        if !(MIN_COMPRESSION..=MAX_COMPRESSION).contains(&self.compression) {
            return Err(InvalidPipelineConfig::Compression(self.compression));
        }
        if self.fanout(granularity) == 0 {
            return Err(InvalidPipelineConfig::Fanout);
        }
        if self.capacity == 0 {
            return Err(InvalidPipelineConfig::Capacity);
        }
        if self.batch_size == 0 {
            return Err(InvalidPipelineConfig::BatchSize);
        }
        Ok(())
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            ports: Vec::new(),
            flush_delay: None,
            fanout: None,
            capacity: 100_000,
            avg_key_size: 150,
            avg_value_size: None,
            compression: 32,
            memory_cache: None,
            persisted: true,
            resolve_interval: 5,
            dispatch_interval_ms: 1000,
            dispatch_limit: None,
            batch_size: 1000,
            scan_interval_ms: 100,
            cache_bound: 10_000,
        }
    }
}

/// A [`PipelineConfig`] value that is out of range.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum InvalidPipelineConfig {
    /// Compression outside of the supported range.
    #[error("compression {0} is not between {MIN_COMPRESSION} and {MAX_COMPRESSION}")]
    Compression(u16),
    /// No ingestion shards.
    #[error("fanout must be at least 1")]
    Fanout,
    /// Zero capacity.
    #[error("capacity must be at least 1")]
    Capacity,
    /// Zero batch size.
    #[error("batch size must be at least 1")]
    BatchSize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_per_granularity() {
        let config = PipelineConfig::default();

        assert_eq!(
            config.flush_delay(Granularity::Minute),
            Duration::from_secs(70)
        );
        assert_eq!(
            config.flush_delay(Granularity::Hour),
            Duration::from_secs(4200)
        );
        assert_eq!(
            config.flush_delay(Granularity::Day),
            Duration::from_secs(18000)
        );
        assert_eq!(config.flush_delay(Granularity::Dist), Duration::from_secs(70));

        assert_eq!(config.fanout(Granularity::Minute), 4);
        assert_eq!(config.fanout(Granularity::Day), 1);
        assert!(config.memory_cache(Granularity::Minute));
        assert!(!config.memory_cache(Granularity::Hour));
        assert_eq!(config.avg_value_size(), 32 + 7 * 32);
    }

    #[test]
    fn test_overrides() {
        let config: PipelineConfig = serde_json::from_value(serde_json::json!({
            "flush_delay": 10,
            "fanout": 2,
            "compression": 100,
            "memory_cache": false,
            "avg_value_size": 64,
        }))
        .unwrap();

        assert_eq!(config.flush_delay(Granularity::Hour), Duration::from_secs(10));
        assert_eq!(config.fanout(Granularity::Minute), 2);
        assert!(!config.memory_cache(Granularity::Minute));
        assert_eq!(config.avg_value_size(), 64);
        assert_eq!(config.capacity, 100_000);
    }

    #[test]
    fn test_validate() {
        let mut config = PipelineConfig::default();
        assert_eq!(config.validate(Granularity::Minute), Ok(()));

        config.compression = 19;
        assert_eq!(
            config.validate(Granularity::Minute),
            Err(InvalidPipelineConfig::Compression(19))
        );

        config.compression = 1000;
        config.fanout = Some(0);
        assert_eq!(
            config.validate(Granularity::Minute),
            Err(InvalidPipelineConfig::Fanout)
        );

        config.fanout = None;
        config.capacity = 0;
        assert_eq!(
            config.validate(Granularity::Minute),
            Err(InvalidPipelineConfig::Capacity)
        );
    }

    #[test]
    fn test_serialize_skips_unset() {
        let yaml = serde_json::to_string(&PipelineConfig::default()).unwrap();
        insta::assert_snapshot!(yaml, @r#"{"ports":[],"capacity":100000,"avg_key_size":150,"compression":32,"persisted":true,"resolve_interval":5,"dispatch_interval_ms":1000,"batch_size":1000,"scan_interval_ms":100,"cache_bound":10000}"#);
    }
}
