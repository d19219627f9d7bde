//! The three processing stages wrapped around every attempt.
//!
//! - [`RequestProcessor`]s transform the outgoing request (async, in order).
//! - [`ResponseValidator`]s inspect the response head (sync, in order).
//! - A [`ResultProcessor`] turns the body into the operation's value.

mod request;
mod result;
mod validator;

pub use request::{
    BearerToken, EncodeBody, FnRequestProcessor, RequestProcessor, SetHeader,
    SharedRequestProcessor, TokenSource, request_processor_fn,
};
pub use result::{
    BoxResultProcessor, Decode, Dispatched, ExecutionContext, FlatMap, FlatMapError, Identity,
    Map, NoMatchingDecoder, NothingToRecover, Recover, ResultProcessor, ResultProcessorExt,
    StatusCheck, TryMap,
};
pub use validator::{
    ContentTypeValidator, FnResponseValidator, ResponseValidator, SharedResponseValidator,
    StatusCodeValidator, UnsupportedMediaType, response_validator_fn,
};

pub(crate) use request::run_request_processors;
pub(crate) use validator::run_response_validators;
