//! simplevm-client - portal control plane library.
//!
//! This module exposes the connectors and the RPC facade for integration
//! testing.

pub mod bibigrid;
pub mod config;
pub mod error;
pub mod forc;
pub mod grpc;
pub mod metadata;
pub mod openstack;
pub mod ports;
pub mod store;
pub mod userdata;

pub mod proto {
    tonic::include_proto!("simplevm");
}
