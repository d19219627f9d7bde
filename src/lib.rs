//! # netop
//!
//! Cancellable, retryable HTTP operations with composable processing
//! pipelines.
//!
//! ## Features
//!
//! - **Async/Await**: operations run on tokio and never block a thread while
//!   waiting for a retry
//! - **Composable**: request processors, response validators and typed result
//!   pipelines
//! - **Resilient**: jittered backoff for idempotent requests, early retry when
//!   the network comes back or a sibling request succeeds
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use netop::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let transport = Arc::new(ReqwestTransport::new(&ReqwestConfig::default())?);
//!     let operation = Operation::builder(Request::get("https://example.com/")?, transport)
//!         .validator(StatusCodeValidator::default())
//!         .start()?;
//!     let result = operation.wait().await;
//!     if let Ok(outcome) = result.as_ref() {
//!         println!("{} bytes", outcome.value.len());
//!     }
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

// Re-export core types and modules
pub use netop_core::{
    EngineConfig, Error, Operation, OperationBuilder, OperationId, OperationOutcome,
    OperationResult, OperationState, Request, ResponseHead, Result, StatusRange, codec, config,
    error, events, logging, operation, processor, request, retry, transport,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for convenient imports
pub mod prelude {
    pub use netop_core::prelude::*;
}
