//! Sidetree operation processing and DID resolution

pub mod processor;
pub mod resolver;

pub use processor::{IngestOutcome, OperationProcessor, ProcessorConfig, ProcessorError};
pub use resolver::{DidResolver, ResolutionResult, ResolverError};
