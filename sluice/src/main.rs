//! Sluice accumulates streaming samples into histograms.
//!
//! Applications send samples as text lines over TCP. Sluice merges them into approximate
//! distributions per series and time bin, keeps them on disk while the bin is open, and reports
//! each histogram once its bin has closed. For configuration options, see [`sluice_config`].
//!
//! # Usage
//!
//! ```text
//! sluice --config .sluice run
//! sluice --config .sluice config show
//! ```
//!
//! # Line Format
//!
//! Every line is either a plain sample or a pre-aggregated distribution:
//!
//! ```text
//! request.latency 12.5 1700000000 source=app-1 region=us-west
//! !M 1700000000 #2 1.5 #1 3.0 request.latency source=app-1
//! ```
//!
//! # Workspace Crates
//!
//!  - [`sluice-config`]: Static configuration for the CLI and the server.
//!  - [`sluice-histogram`]: Digests, the persisted store and the accumulation pipelines.
//!  - [`sluice-log`]: Error reporting and logging.
//!  - [`sluice-statsd`]: High-level StatsD metric client for internal measurements.
//!  - [`sluice-system`]: Runtimes and the shutdown controller.
//!
//! [`sluice-config`]: ../sluice_config/index.html
//! [`sluice-histogram`]: ../sluice_histogram/index.html
//! [`sluice-log`]: ../sluice_log/index.html
//! [`sluice-statsd`]: ../sluice_statsd/index.html
//! [`sluice-system`]: ../sluice_system/index.html

mod cli;
mod cliapp;
mod listener;
mod server;
mod setup;
mod sink;

use std::process;

pub fn main() {
    let exit_code = match cli::execute() {
        Ok(()) => 0,
        Err(err) => {
            sluice_log::ensure_error(&err);
            1
        }
    };

    process::exit(exit_code);
}
