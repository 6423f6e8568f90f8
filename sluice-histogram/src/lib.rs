//! Streaming histogram aggregation for Sluice.
//!
//! Samples arrive as text lines and are merged into [`AgentDigest`]s, compact approximations of
//! value distributions. Every digest belongs to a [`HistogramKey`], which identifies a series and
//! a time bin of a [`Granularity`]. Once a digest's dispatch time has passed, it is ripe and
//! shipped downstream as a [`HistogramPoint`].
//!
//! # Architecture
//!
//! Each granularity runs an independent [`Pipeline`]:
//!
//! ```text
//! listener -> Tape -> IngestionTask -> Accumulator -> DigestStore
//!                                           |
//!                                       Dispatcher -> ReportSink
//! ```
//!
//! - [`Tape`]s buffer raw lines. [`FileTape`]s keep them across restarts.
//! - [`IngestionTask`]s decode lines with a [`PointDecoder`] and merge them into the
//!   [`Accumulator`]. Lines that fail are handed to a [`BlockedSink`].
//! - The [`Accumulator`] is a write-back cache over a [`DigestStore`]. Merges land in a bounded
//!   local cache and are periodically resolved into the store.
//! - The [`Dispatcher`] scans for ripe keys, removes their digests, and reports them to a
//!   [`ReportSink`].
//!
//! # Persistence
//!
//! Stores are opened through a [`StoreLoader`]. A persisted store is an append-only log with a
//! settings sidecar. It is recovered on restart and migrated when its settings change. A store
//! can only be opened by one owner at a time.
//!
//! # Time
//!
//! All components read the time from a [`Clock`]. Timestamps are milliseconds since the epoch.

#![warn(missing_docs)]

mod accumulator;
mod clock;
mod codec;
mod config;
mod decoder;
mod digest;
mod dispatch;
mod granularity;
mod ingest;
mod key;
mod pipeline;
mod statsd;
mod store;
mod tape;

pub use self::accumulator::*;
pub use self::clock::*;
pub use self::codec::CodecError;
pub use self::config::*;
pub use self::decoder::*;
pub use self::digest::*;
pub use self::dispatch::*;
pub use self::granularity::*;
pub use self::ingest::*;
pub use self::key::*;
pub use self::pipeline::*;
pub use self::store::*;
pub use self::tape::*;
