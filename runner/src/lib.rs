//! The kubeload load engine.
//!
//! Drives weighted-random request mixes through a pool of long-lived HTTP
//! clients against a kube-apiserver, collecting per-request latency and a
//! typed error report.
#![warn(missing_docs)]

pub mod client;
pub mod limit;
pub mod metrics;
pub mod random;
pub mod request;
pub mod run;
pub mod schedule;
