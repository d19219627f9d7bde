//! netop core library
//!
//! Wraps one logical HTTP exchange in a cancellable, retryable
//! [`Operation`]. Every attempt runs the same pipeline:
//!
//! ```text
//! request processors → transport → response validators → result processor
//!                                                      ↘ failure → retry providers → helpers → next attempt
//! ```
//!
//! # Features
//!
//! - **Composable stages**: request processors, response validators and
//!   result processors with `map`, `flat_map`, `flat_map_error` and `dispatched`
//! - **Retry orchestration**: idempotency-aware jittered backoff, early retry
//!   on reachability changes and sibling successes
//! - **Race-free lifecycle**: one result, written once, whichever of transport
//!   callbacks, timers, external events or `cancel()` gets there first
//! - **Pluggable transport**: a `reqwest` adapter behind the default feature
//!
//! # Example
//!
//! ```rust,no_run
//! use netop_core::prelude::*;
//! use serde::Deserialize;
//! use std::sync::Arc;
//!
//! #[derive(Deserialize)]
//! struct User {
//!     name: String,
//! }
//!
//! # async fn example() -> Result<()> {
//! let transport = Arc::new(ReqwestTransport::new(&ReqwestConfig::default())?);
//! let operation = Operation::builder(Request::get("https://api.example.com/users/1")?, transport)
//!     .validator(StatusCodeValidator::default())
//!     .result_processor(StatusCheck::<Bytes>::default().flat_map(Decode::<User>::json()))
//!     .start()?;
//!
//! let result = operation.wait().await;
//! match result.as_ref() {
//!     Ok(outcome) => println!("hello {}", outcome.value.name),
//!     Err(e) => eprintln!("{}", e.report()),
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
// Suppressed globally:
// - module_name_repetitions: RetryConfig in retry, OperationBuilder in operation
// - missing_errors_doc / missing_panics_doc: documented where non-obvious
// - must_use_candidate / return_self_not_must_use: builder-heavy API
// - struct_excessive_bools: RetryConfig carries one flag per retry class
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::struct_excessive_bools)]
#![allow(clippy::doc_markdown)]

// Re-exports of external dependencies
pub use bytes;
pub use http;
pub use url;

pub mod codec;
pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod operation;
pub mod processor;
pub mod request;
pub mod retry;
pub mod transport;

// Test utilities (available in dev-dependencies context)
#[cfg(any(test, feature = "test-utils", debug_assertions))]
pub mod testing;

pub use config::EngineConfig;
pub use error::{ContextExt, Error, Result, TransportError};
pub use operation::{
    Operation, OperationBuilder, OperationId, OperationOutcome, OperationResult, OperationState,
};
pub use request::{Request, ResponseHead, StatusRange};

/// Prelude module for convenient imports
///
/// ```rust
/// use netop_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::codec::{Decoder, Encoder, JsonDecoder, JsonEncoder, TextDecoder};
    pub use crate::config::EngineConfig;
    pub use crate::error::{ContextExt, Error, Result};
    pub use crate::events::{HostEventBus, ManualReachability, ReachabilityMonitor};
    pub use crate::logging::{LogConfig, LogFormat, LogLevel, init_logging, try_init_logging};
    pub use crate::operation::{
        Operation, OperationBuilder, OperationOutcome, OperationResult, OperationState,
    };
    pub use crate::processor::{
        BearerToken, ContentTypeValidator, Decode, EncodeBody, ExecutionContext, Identity,
        Recover, RequestProcessor, ResponseValidator, ResultProcessor, ResultProcessorExt,
        SetHeader, StatusCheck, StatusCodeValidator,
    };
    pub use crate::request::{Request, ResponseHead, StatusRange};
    pub use crate::retry::{RetryConfig, RetryDecision, RetryHelper, RetryProvider};
    #[cfg(feature = "reqwest")]
    pub use crate::transport::{ReqwestConfig, ReqwestTransport};
    pub use crate::transport::Transport;
    pub use bytes::Bytes;
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
