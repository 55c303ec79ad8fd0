//! A multi-resolution time-series aggregation store
//!
//! This crate records three kinds of aggregate -- counters, distinct-value
//! sets and weighted frequency tables -- into time buckets maintained at
//! several resolutions ('rollups') at once, and answers range and total
//! queries against them. Callers configure the rollups once, at construction,
//! and every write lands in every rollup. Queries pick the finest rollup whose
//! retention still covers the requested range unless told otherwise.
//!
//! Every write also lands in the environment-agnostic slice of its key. A
//! query without an environment therefore sees the total across all
//! environments without re-aggregating.
//!
//! The entry point is [`TimeSeriesEngine`], which implements [`Backend`]. All
//! state lives in memory; see [`store`] for the locking scheme.

#![deny(clippy::all)]
#![deny(clippy::cargo)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(clippy::unwrap_used)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_copy_implementations)]
#![deny(missing_debug_implementations)]
#![allow(clippy::cargo_common_metadata)]
#![allow(clippy::multiple_crate_versions)]

pub mod backend;
pub mod clock;
pub mod config;
pub mod counter;
pub mod distinct;
pub mod engine;
pub mod environment;
pub mod frequency;
pub mod rollup;
pub mod store;

pub use backend::{Backend, Error, Query};
pub use clock::{Clock, ManualClock, RealClock};
pub use config::Config;
pub use engine::TimeSeriesEngine;
pub use environment::EnvironmentId;
pub use rollup::{Retention, Rollup, Rollups};
pub use store::Ident;
