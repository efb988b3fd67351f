//! Orb networking primitives
//!
//! Signed HTTP plumbing shared by the daemon: HTTP Signatures over
//! `(request-target) host date digest`, the signed client used for all
//! outbound federation traffic, actor document retrieval with caching,
//! and the WebCAS fetch client.

pub mod actor;
pub mod client;
pub mod httpsig;
pub mod webcas;
