//! zstor Client - Object storage over a cluster of shards
//!
//! This crate provides the [`Client`] facade: objects are split into chunks,
//! compressed, encrypted, erasure coded (or replicated) and spread over the
//! shards of a [`Cluster`](zstor_datastor::Cluster). Their metadata records
//! can be linked into chains and walked with a [`TraverseIterator`].

pub mod cancel;
pub mod client;
pub mod pipeline;
pub mod processing;
pub mod redundancy;
pub mod traverse;

// Re-exports
pub use cancel::run_cancellable;
pub use client::Client;
pub use pipeline::Pipeline;
pub use processing::Processor;
pub use redundancy::Redundancy;
pub use traverse::{Direction, EpochRange, TraverseIterator};
