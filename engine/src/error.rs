use std::io;

use thiserror::Error;

use crate::{
    invoke::{Signature, ValueType},
    region::{ExecutableRegion, RegionId},
    Protection,
};

pub type Result<T> = std::result::Result<T, Error>;

/// Everything the engine reports back to its caller.
///
/// Calling into memory that is not executable or was never written is not in
/// here: that is a broken caller contract and panics instead.
#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to allocate {size} bytes as {protection}")]
    Allocation {
        size: usize,
        protection: Protection,
        #[source]
        source: io::Error,
    },

    #[error("failed to apply {protection} protection")]
    Protection {
        protection: Protection,
        #[source]
        source: io::Error,
    },

    #[error("{len} bytes at offset {offset} do not fit into a region of {size} bytes")]
    OutOfBounds { offset: usize, len: usize, size: usize },

    #[error("arguments ({}) do not match {expected}", display_types(.found))]
    SignatureMismatch {
        expected: Signature,
        found: Vec<ValueType>,
    },

    #[error("{signature} cannot be called on this target: {reason}")]
    UnsupportedSignature {
        signature: Signature,
        reason: &'static str,
    },

    #[error("line {line} `{text}`: {message}")]
    Assembly {
        line: usize,
        text: String,
        message: String,
    },

    #[error(transparent)]
    Release(#[from] ReleaseError),
}

impl Error {
    pub(crate) fn denied(protection: Protection, message: &'static str) -> Self {
        Error::Protection {
            protection,
            source: io::Error::new(io::ErrorKind::PermissionDenied, message),
        }
    }
}

/// Returned when a region is handed to an allocator that did not create it.
///
/// The region is still alive inside the error; take it back with
/// [`ReleaseError::into_region`] and release it through its own allocator.
#[derive(Debug, Error)]
#[error("region {id} does not belong to this allocator")]
pub struct ReleaseError {
    pub id: RegionId,
    region: Box<ExecutableRegion>,
}

impl ReleaseError {
    pub(crate) fn new(region: ExecutableRegion) -> Self {
        Self {
            id: region.id(),
            region: Box::new(region),
        }
    }

    pub fn into_region(self) -> ExecutableRegion {
        *self.region
    }
}

fn display_types(types: &[ValueType]) -> String {
    types
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
