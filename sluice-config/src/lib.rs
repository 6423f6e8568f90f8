//! Configuration for the Sluice CLI and server.
//!
//! The configuration lives in a folder, by default `.sluice`, which contains a `config.yml`.
//! Every section is optional:
//!
//! ```yaml
//! logging:
//!   level: info
//!
//! metrics:
//!   statsd: 127.0.0.1:8125
//!   hostname_tag: host
//!
//! histogram:
//!   state_dir: state
//!   minute:
//!     ports: [40001]
//!   dist:
//!     ports: [40000]
//!     persisted: false
//! ```
//!
//! Use [`Config::from_path`] to load and validate a configuration folder.

#![warn(missing_docs)]

mod config;

pub use self::config::*;
