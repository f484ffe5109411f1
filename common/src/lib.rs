//! Shared types for the kubeload benchmarking harness.
#![warn(missing_docs)]

pub mod group;
pub mod profile;
pub mod report;
pub mod telemetry;
