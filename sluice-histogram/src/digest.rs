//! A mergeable approximation of a value distribution.
//!
//! [`AgentDigest`] wraps a merging [`TDigest`]. Single samples are first appended to an unsorted
//! buffer. Once the buffer fills up, buffered samples and existing centroids are merged so that
//! centroids near the median hold more weight than centroids in the tails. The number of
//! centroids after compression is bounded by the compression, regardless of how many samples were
//! merged.

use std::borrow::Cow;

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};
use tdigest::TDigest;

use crate::codec::{self, CodecError};

/// The smallest supported compression.
pub const MIN_COMPRESSION: u16 = 20;

/// The largest supported compression.
pub const MAX_COMPRESSION: u16 = 1000;

/// Unmerged samples are buffered up to this multiple of the compression.
const BUFFER_FACTOR: usize = 5;

/// Encoded size of the fixed digest header.
const HEADER_SIZE: usize = 2 + 8 + 8 + 8 + 4;

/// Encoded size of a single centroid.
const CENTROID_SIZE: usize = 8 + 8;

/// A single `(mean, count)` cluster of samples in a digest.
#[derive(Clone, Copy, Debug, PartialEq, Deserialize, Serialize)]
pub struct Centroid {
    /// The mean of all samples in this centroid.
    pub mean: f64,
    /// The number of samples in this centroid.
    pub count: u64,
}

impl Centroid {
    /// Creates a new centroid.
    pub fn new(mean: f64, count: u64) -> Self {
        Self { mean, count }
    }
}

/// The serialized shape of a [`TDigest`], which does not expose its centroids otherwise.
#[derive(Deserialize)]
struct TDigestParts {
    centroids: Vec<WeightedCentroid>,
}

#[derive(Deserialize)]
struct WeightedCentroid {
    mean: f64,
    weight: f64,
}

/// Creates a digest holding a single pre-aggregated centroid.
fn single_centroid(centroid: &Centroid, max_size: usize) -> TDigest {
    let weight = centroid.count as f64;
    TDigest::new(
        vec![tdigest::Centroid::new(centroid.mean, weight)],
        centroid.mean * weight,
        weight,
        centroid.mean,
        centroid.mean,
        max_size,
    )
}

/// A t-digest with a dispatch time.
///
/// The dispatch time marks when the digest becomes ripe for shipment. It is assigned once when
/// the digest is created. Afterwards, [`set_dispatch_time_forward`](Self::set_dispatch_time_forward)
/// only moves it forward, while [`merge`](Self::merge) keeps the earlier of both times.
///
/// Counts are tracked as floating point weights. They saturate instead of overflowing when they
/// are converted back into integers.
#[derive(Clone, Debug)]
pub struct AgentDigest {
    compression: u16,
    dispatch_time: i64,
    digest: TDigest,
    buffer: Vec<f64>,
}

impl AgentDigest {
    /// Creates an empty digest.
    ///
    /// The compression is clamped into `[MIN_COMPRESSION, MAX_COMPRESSION]`. Configuration
    /// validates the range at startup, so clamping never applies to configured values.
    pub fn new(compression: u16, dispatch_time: i64) -> Self {
        let compression = compression.clamp(MIN_COMPRESSION, MAX_COMPRESSION);
        Self {
            compression,
            dispatch_time,
            digest: TDigest::new_with_size(compression as usize),
            buffer: Vec::with_capacity(BUFFER_FACTOR * compression as usize),
        }
    }

    /// Returns an estimate for the encoded size of a digest with the given compression.
    pub fn estimated_size(compression: u16) -> u32 {
        32 + u32::from(compression) * 7
    }

    /// The compression parameter of this digest.
    pub fn compression(&self) -> u16 {
        self.compression
    }

    /// Timestamp in milliseconds after which the digest is ripe.
    pub fn dispatch_time(&self) -> i64 {
        self.dispatch_time
    }

    /// Moves the dispatch time to `dispatch_time` if it is later than the current one.
    pub fn set_dispatch_time_forward(&mut self, dispatch_time: i64) {
        self.dispatch_time = self.dispatch_time.max(dispatch_time);
    }

    /// Returns `true` if the dispatch time has been reached at `now`.
    pub fn is_ripe(&self, now: i64) -> bool {
        self.dispatch_time <= now
    }

    /// Total number of samples merged into this digest.
    pub fn count(&self) -> u64 {
        (self.digest.count() + self.buffer.len() as f64) as u64
    }

    /// Returns `true` if no samples have been merged.
    pub fn is_empty(&self) -> bool {
        self.digest.is_empty() && self.buffer.is_empty()
    }

    /// The smallest merged sample, if any.
    pub fn min(&self) -> Option<f64> {
        let stored = (!self.digest.is_empty()).then(|| self.digest.min());
        self.buffer
            .iter()
            .copied()
            .chain(stored)
            .reduce(f64::min)
    }

    /// The largest merged sample, if any.
    pub fn max(&self) -> Option<f64> {
        let stored = (!self.digest.is_empty()).then(|| self.digest.max());
        self.buffer
            .iter()
            .copied()
            .chain(stored)
            .reduce(f64::max)
    }

    /// Merges a single sample.
    pub fn merge_value(&mut self, value: f64) {
        self.buffer.push(value);
        if self.buffer.len() >= BUFFER_FACTOR * self.compression as usize {
            self.compress();
        }
    }

    /// Merges a pre-aggregated distribution of `(value, count)` pairs.
    ///
    /// Entries with a count of zero are ignored.
    pub fn merge_distribution(&mut self, centroids: &[Centroid]) {
        let max_size = self.digest.max_size();
        let parts: Vec<_> = centroids
            .iter()
            .filter(|centroid| centroid.count > 0)
            .map(|centroid| single_centroid(centroid, max_size))
            .collect();

        self.merge_digests(parts);
    }

    /// Merges another digest into this one.
    ///
    /// The result keeps the earlier of both dispatch times, so the merged digest becomes ripe
    /// when its oldest part does. A late merge into an existing bin therefore never delays a bin
    /// that is already ripe.
    pub fn merge(&mut self, other: &AgentDigest) {
        self.dispatch_time = self.dispatch_time.min(other.dispatch_time);
        if !other.is_empty() {
            self.merge_digests(vec![other.merged().into_owned()]);
        }
    }

    fn merge_digests(&mut self, others: Vec<TDigest>) {
        if others.is_empty() {
            return;
        }

        self.compress();
        // The size of the first digest determines the size of the result.
        let own = std::mem::replace(&mut self.digest, TDigest::new_with_size(0));
        let mut digests = Vec::with_capacity(others.len() + 1);
        digests.push(own);
        digests.extend(others);
        self.digest = TDigest::merge_digests(digests);
    }

    /// Merges all buffered samples into the centroids.
    pub fn compress(&mut self) {
        if self.buffer.is_empty() {
            return;
        }

        let values = std::mem::take(&mut self.buffer);
        self.digest = self.digest.merge_unsorted(values);
    }

    /// The digest with all buffered samples merged.
    fn merged(&self) -> Cow<'_, TDigest> {
        if self.buffer.is_empty() {
            Cow::Borrowed(&self.digest)
        } else {
            Cow::Owned(self.digest.merge_unsorted(self.buffer.clone()))
        }
    }

    /// Returns the compressed centroids, ordered by mean.
    pub fn centroids(&self) -> Vec<Centroid> {
        if self.is_empty() {
            return Vec::new();
        }

        let parts = serde_json::to_value(&*self.merged())
            .and_then(serde_json::from_value::<TDigestParts>);

        match parts {
            Ok(parts) => parts
                .centroids
                .into_iter()
                .map(|c| Centroid::new(c.mean, c.weight as u64))
                .collect(),
            Err(error) => {
                sluice_log::error!(
                    error = &error as &dyn std::error::Error,
                    "failed to read digest centroids"
                );
                Vec::new()
            }
        }
    }

    /// Estimates the value at quantile `q`, where `q` is clamped into `[0, 1]`.
    ///
    /// Returns `None` for an empty digest.
    pub fn quantile(&self, q: f64) -> Option<f64> {
        if self.is_empty() {
            return None;
        }

        Some(self.merged().estimate_quantile(q.clamp(0.0, 1.0)))
    }

    /// Returns the number of bytes [`encode`](Self::encode) writes.
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.centroids().len() * CENTROID_SIZE
    }

    /// Writes the compressed digest in its persistent binary form.
    pub fn encode(&self, buf: &mut impl BufMut) {
        let centroids = self.centroids();

        buf.put_u16(self.compression);
        buf.put_i64(self.dispatch_time);
        buf.put_f64(self.min().unwrap_or(f64::INFINITY));
        buf.put_f64(self.max().unwrap_or(f64::NEG_INFINITY));
        buf.put_u32(centroids.len() as u32);
        for centroid in &centroids {
            buf.put_f64(centroid.mean);
            buf.put_u64(centroid.count);
        }
    }

    /// Encodes the digest into a new vector.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.encode(&mut buf);
        buf
    }

    /// Reads a digest previously written by [`encode`](Self::encode).
    pub fn decode(buf: &mut impl Buf) -> Result<Self, CodecError> {
        codec::ensure(buf, HEADER_SIZE)?;
        let compression = buf.get_u16();
        let dispatch_time = buf.get_i64();
        let min = buf.get_f64();
        let max = buf.get_f64();
        let len = buf.get_u32() as usize;

        codec::ensure(buf, len * CENTROID_SIZE)?;
        let mut digest = Self::new(compression, dispatch_time);
        if len == 0 {
            return Ok(digest);
        }

        let mut centroids = Vec::with_capacity(len);
        let mut sum = 0.0;
        let mut count = 0.0;
        for _ in 0..len {
            let mean = buf.get_f64();
            let weight = buf.get_u64() as f64;
            sum += mean * weight;
            count += weight;
            centroids.push(tdigest::Centroid::new(mean, weight));
        }

        let max_size = digest.digest.max_size();
        digest.digest = TDigest::new(centroids, sum, count, max, min, max_size);
        Ok(digest)
    }

    /// Decodes a digest from a byte slice that contains nothing else.
    pub fn from_bytes(mut bytes: &[u8]) -> Result<Self, CodecError> {
        let digest = Self::decode(&mut bytes)?;
        codec::finish(&bytes)?;
        Ok(digest)
    }
}

impl PartialEq for AgentDigest {
    fn eq(&self, other: &Self) -> bool {
        self.compression == other.compression
            && self.dispatch_time == other.dispatch_time
            && self.count() == other.count()
            && self.min() == other.min()
            && self.max() == other.max()
            && self.centroids() == other.centroids()
    }
}
