//! What a finished attempt hands to the result processor.

use crate::error::{Error, Result};
use crate::transport::Destination;
use bytes::Bytes;
use std::path::PathBuf;

/// The raw result of a successful attempt.
///
/// Implemented for [`Bytes`] (in-memory operations) and [`PathBuf`]
/// (to-file operations, where the transport wrote the body to disk).
pub trait OperationSource: Send + Sync + 'static + Sized {
    /// Builds the source from the attempt's accumulated body and file location.
    fn from_attempt(body: Bytes, location: Option<PathBuf>) -> Result<Self>;

    /// Body bytes, when the source holds them in memory.
    fn body_bytes(&self) -> Option<Bytes>;

    /// Where the transport should put the body for this source type.
    fn destination(download_to: Option<&PathBuf>) -> Destination;
}

impl OperationSource for Bytes {
    fn from_attempt(body: Bytes, _location: Option<PathBuf>) -> Result<Self> {
        Ok(body)
    }

    fn body_bytes(&self) -> Option<Bytes> {
        Some(self.clone())
    }

    fn destination(_download_to: Option<&PathBuf>) -> Destination {
        Destination::Memory
    }
}

impl OperationSource for PathBuf {
    fn from_attempt(_body: Bytes, location: Option<PathBuf>) -> Result<Self> {
        location.ok_or_else(|| Error::broken_contract("download finished without a file location"))
    }

    fn body_bytes(&self) -> Option<Bytes> {
        None
    }

    fn destination(download_to: Option<&PathBuf>) -> Destination {
        match download_to {
            Some(path) => Destination::File(path.clone()),
            None => Destination::Memory,
        }
    }
}
