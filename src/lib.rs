//! # labpipe
//!
//! Plumbing for distributed laboratory pipelines: portable file tokens,
//! a fingerprint-keyed work cache that computes each result at most once,
//! nested progress logs, and grid submission lines.

pub mod cache;
pub mod config;
pub mod daemon;
pub mod error;
pub mod files;
pub mod fsutil;
pub mod grid;
pub mod log;
pub mod model;
pub mod progress;
pub mod telemetry;
