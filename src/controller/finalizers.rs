//! Finalizer handling for CassandraDatacenter cleanup
//!
//! Workloads and the disruption budget carry an owner reference and are
//! garbage collected. Volume claims come from claim templates and have no
//! owner, so they are deleted here before the finalizer is released.

use kube::ResourceExt;
use tracing::{info, warn};

use super::ops::DatacenterOps;
use crate::crd::CassandraDatacenter;
use crate::error::Result;

/// Finalizer name used to protect CassandraDatacenter resources
pub const CASSANDRA_DATACENTER_FINALIZER: &str =
    "cassandradatacenter.cassandra.datastax.com/finalizer";

/// Delete every volume claim of the datacenter. Individual failures are
/// logged and the first one is returned after all deletions were tried.
pub async fn delete_datacenter_claims(ops: &dyn DatacenterOps, dc: &CassandraDatacenter) -> Result<usize> {
    let claims = ops.list_pvcs(&dc.datacenter_labels()).await?;
    info!(
        "Deleting {} volume claims of datacenter {}",
        claims.len(),
        dc.dc_name()
    );

    let mut first_error = None;
    let mut deleted = 0;
    for claim in &claims {
        match ops.delete_pvc(&claim.name_any()).await {
            Ok(()) => deleted += 1,
            Err(e) => {
                warn!("Failed to delete claim {}: {:?}", claim.name_any(), e);
                first_error.get_or_insert(e);
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(deleted),
    }
}

/// A deletion timestamp means deletion was requested and only finalizers
/// hold the object
pub fn is_being_deleted(dc: &CassandraDatacenter) -> bool {
    dc.metadata.deletion_timestamp.is_some()
}

pub fn has_finalizer(dc: &CassandraDatacenter) -> bool {
    dc.finalizers()
        .iter()
        .any(|f| f == CASSANDRA_DATACENTER_FINALIZER)
}
