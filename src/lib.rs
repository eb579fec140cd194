//! talos-bootstrap: declarative, exactly-once Talos cluster bootstrap
//!
//! This crate triggers the one-time bootstrap of a Talos machine through its
//! gRPC machine API, retrying until a deadline, and exposes that operation
//! as a Kubernetes custom resource.

pub mod client;
pub mod controller;
pub mod crd;
pub mod error;
pub mod leader;
pub mod telemetry;

#[cfg(feature = "rest-api")]
pub mod rest_api;

pub use crate::error::{Error, Result};
