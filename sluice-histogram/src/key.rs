use std::collections::BTreeMap;
use std::fmt;

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

use crate::codec::{self, CodecError};
use crate::granularity::Granularity;

/// Identifies the series and time bin a digest accumulates.
///
/// Two samples map to the same key if their granularity, bin start, metric name, source, and tags
/// match exactly. Tags are kept in sorted order, so the order in which they arrived is irrelevant.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
pub struct HistogramKey {
    granularity: Granularity,
    bin_start: i64,
    metric: String,
    source: String,
    tags: BTreeMap<String, String>,
}

impl HistogramKey {
    /// Creates a key for a sample at `timestamp_ms`.
    ///
    /// The timestamp is truncated to the start of its bin, except for
    /// [`Granularity::Dist`] where the caller supplies the bin start directly.
    pub fn new(
        granularity: Granularity,
        timestamp_ms: i64,
        metric: impl Into<String>,
        source: impl Into<String>,
        tags: BTreeMap<String, String>,
    ) -> Self {
        Self {
            granularity,
            bin_start: granularity.bin_start(timestamp_ms),
            metric: metric.into(),
            source: source.into(),
            tags,
        }
    }

    /// The granularity of the bin.
    pub fn granularity(&self) -> Granularity {
        self.granularity
    }

    /// Start of the bin in milliseconds since the epoch.
    pub fn bin_start(&self) -> i64 {
        self.bin_start
    }

    /// The metric name.
    pub fn metric(&self) -> &str {
        &self.metric
    }

    /// The source (host) that reported the samples.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Point tags, sorted by name.
    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }

    /// Returns the number of bytes [`encode`](Self::encode) writes.
    pub fn encoded_len(&self) -> usize {
        let tags: usize = self.tags.iter().map(|(k, v)| 4 + k.len() + v.len()).sum();
        1 + 8 + 2 + self.metric.len() + 2 + self.source.len() + 2 + tags
    }

    /// Writes the key in its persistent binary form.
    ///
    /// Fails only if a string field or the tag count exceeds `u16::MAX`.
    pub fn encode(&self, buf: &mut impl BufMut) -> Result<(), CodecError> {
        let tag_count =
            u16::try_from(self.tags.len()).map_err(|_| CodecError::StringTooLong(self.tags.len()))?;

        buf.put_u8(self.granularity.wire_id());
        buf.put_i64(self.bin_start);
        codec::put_str(buf, &self.metric)?;
        codec::put_str(buf, &self.source)?;
        buf.put_u16(tag_count);
        for (key, value) in &self.tags {
            codec::put_str(buf, key)?;
            codec::put_str(buf, value)?;
        }

        Ok(())
    }

    /// Encodes the key into a new vector.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.encode(&mut buf)?;
        Ok(buf)
    }

    /// Reads a key previously written by [`encode`](Self::encode).
    pub fn decode(buf: &mut impl Buf) -> Result<Self, CodecError> {
        codec::ensure(buf, 1 + 8)?;
        let id = buf.get_u8();
        let granularity = Granularity::from_wire_id(id).ok_or(CodecError::InvalidGranularity(id))?;
        let bin_start = buf.get_i64();
        let metric = codec::get_str(buf)?;
        let source = codec::get_str(buf)?;

        codec::ensure(buf, 2)?;
        let tag_count = buf.get_u16();
        let mut tags = BTreeMap::new();
        for _ in 0..tag_count {
            let key = codec::get_str(buf)?;
            let value = codec::get_str(buf)?;
            tags.insert(key, value);
        }

        Ok(Self {
            granularity,
            bin_start,
            metric,
            source,
            tags,
        })
    }

    /// Decodes a key from a byte slice that contains nothing else.
    pub fn from_bytes(mut bytes: &[u8]) -> Result<Self, CodecError> {
        let key = Self::decode(&mut bytes)?;
        codec::finish(&bytes)?;
        Ok(key)
    }
}

impl fmt::Debug for HistogramKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HistogramKey")
            .field("granularity", &self.granularity)
            .field("bin_start", &self.bin_start)
            .field("metric", &self.metric)
            .field("source", &self.source)
            .field("tags", &self.tags)
            .finish()
    }
}

impl fmt::Display for HistogramKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{} [{}] source={}",
            self.metric, self.bin_start, self.granularity, self.source
        )?;
        for (key, value) in &self.tags {
            write!(f, " {key}={value}")?;
        }
        Ok(())
    }
}
