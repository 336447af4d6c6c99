//! Node-aware STREAM memory bandwidth benchmark.
//!
//! Ranks are grouped by host; the four STREAM kernels run on every rank and
//! their timings are reduced into process, node and cluster statistics at
//! world rank 0.

pub mod aggregate;
pub mod clock;
pub mod comm;
pub mod config;
pub mod kernel;
pub mod report;
pub mod runner;
pub mod topology;
