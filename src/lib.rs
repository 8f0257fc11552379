//! benchkit: experiment driver for a client/server program under test.
//!
//! For each value of one configuration field the harness:
//! - rewrites the shared JSON configuration artifact
//! - builds and (re)starts the server, or keeps one server for the run
//! - times repeated client runs
//! - reduces the timings to a mean with a Student's-t confidence interval
//!
//! The collected curve is plotted with error bars and saved as a PNG.

pub mod config;
pub mod config_store;
pub mod error;
pub mod interrupt;
pub mod process;
pub mod report;
pub mod runner;
pub mod sampler;
pub mod stats;
