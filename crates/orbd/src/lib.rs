//! orbd - Orb anchoring node daemon
//!
//! An Orb node accepts Sidetree DID operations, batches them into
//! content-addressed anchor linksets, collects witness countersignatures
//! against a configurable policy, and federates anchor events to peers
//! over signed HTTP.

pub mod cas;
pub mod config;
pub mod inbox;
pub mod monitor;
pub mod outbox;
pub mod pipeline;
pub mod server;
pub mod sidetree;
pub mod stats;
pub mod storage;
