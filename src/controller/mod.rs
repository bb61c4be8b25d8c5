//! Controller module for CassandraDatacenter reconciliation
//!
//! This module contains the controller loop, the per-pass checks and the
//! capability traits they act through.

pub mod conditions;
pub mod context;
pub mod decommission;
pub mod emm;
mod finalizers;
pub mod labels;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod mgmt_api;
pub mod nodes;
pub mod ops;
pub mod pods;
pub mod pvc_health;
pub mod racks;
mod reconciler;
pub mod resources;
pub mod restart;
pub mod result;
pub mod topology;

#[cfg(test)]
mod emm_test;
#[cfg(test)]
mod fakes;

pub use finalizers::CASSANDRA_DATACENTER_FINALIZER;
pub use reconciler::{reconcile_pass, run_controller, ControllerState, OperatorConfig};
pub use result::ReconcileResult;
