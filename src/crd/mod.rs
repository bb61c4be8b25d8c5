//! Custom Resource Definitions for the Cassandra operator

mod cassandra_datacenter;
pub mod types;


pub use cassandra_datacenter::{
    CassandraDatacenter, CassandraDatacenterSpec, CassandraDatacenterStatus, SpecValidationError,
    DEFAULT_RACK_NAME,
};
pub use types::*;
