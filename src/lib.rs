//! stracefile - convert strace logs into Chrome trace files
//!
//! This library turns the line-oriented log produced by `strace -f -T -ttt -q`
//! into a chronologically consistent `traceEvents` document: log lines are
//! classified and built into events, thread ancestry is reconstructed from
//! creation calls, display names and parent/child flow edges are synthesized,
//! and the result is merged with an independently sampled cgroup resource
//! series.

pub mod ancestry;
pub mod cli;
pub mod event;
pub mod merge;
pub mod metadata;
pub mod parser;
pub mod resources;
pub mod strace;
