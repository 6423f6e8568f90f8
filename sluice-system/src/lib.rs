//! Foundational system components for Sluice.
//!
//! This crate provides the [`Runtime`] each pipeline runs on and the [`Controller`], which turns
//! process signals into a [`Shutdown`] broadcast.

#![warn(missing_docs)]

mod controller;
mod runtime;

pub use self::controller::*;
pub use self::runtime::*;
