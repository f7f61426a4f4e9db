//! zstor Protocol - gRPC service definitions
//!
//! This crate contains the protobuf-generated code of the shard (datastor)
//! service client.

/// Shard service (object and namespace operations)
pub mod datastor {
    tonic::include_proto!("zstor.datastor");
}
