//! Fleet orchestration engine: resolves a declarative query over a host
//! inventory into a concrete set of hosts and drives a sequence of shell
//! commands to completion across them, with controlled parallelism,
//! per-host state tracking, success-threshold gating and bounded-time
//! execution.

pub mod backend;
pub mod cli;
pub mod config;
pub mod nodeset;
pub mod query;
pub mod report;
pub mod transport;
