//! cassandra-k8s: Kubernetes operator for Cassandra and DSE datacenters
//!
//! This crate provides the reconcile engine of the operator: rack topology
//! planning, per-rack scaling with safe decommission, host maintenance
//! (EMM) arbitration and replacement of nodes with inaccessible volumes.

pub mod controller;
pub mod crd;
pub mod error;
pub mod telemetry;

#[cfg(feature = "rest-api")]
pub mod rest_api;

pub use crate::error::{Error, Result};
