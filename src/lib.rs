//! Courier - Admission-Controlled Calls to Rate-Limited APIs
//!
//! This crate sends every outbound call to a remote HTTP API through one
//! admission controller: a concurrency bound, a global sliding-window quota
//! and stricter per-category quotas. Retryable outcomes are absorbed with
//! exponential backoff. Long-running export jobs are driven through start,
//! poll and download by a state machine built on the same dispatcher.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod jobs;
pub mod ratelimit;
pub mod transport;
pub mod webhook;

pub use error::{CourierError, Result};
