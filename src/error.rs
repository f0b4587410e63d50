// src/error.rs

//! Defines the primary error type for the entire runtime.

use crate::proclet::ProcletId;
use thiserror::Error;

/// The error taxonomy from the invocation path and the controller protocol,
/// collapsed into a single enum. `Wrong-client` is deliberately absent: it is
/// recovered internally by the RPC client manager and never surfaces past it.
#[derive(Error, Debug, Clone)]
pub enum NuError {
    #[error("out of memory: proclet {0:?} could not satisfy the allocation")]
    OutOfMemory(ProcletId),

    #[error("proclet {0:?} no longer resolves (destroyed or never existed)")]
    DestroyedTarget(ProcletId),

    #[error("closure raised an exception: {0}")]
    ClosureException(String),

    #[error("serialization failure: {0}")]
    SerializationFailure(String),

    #[error("proclet {0:?} is pinned and cannot be migrated")]
    Pinned(ProcletId),

    #[error("no migration destination available")]
    NoDestination,

    #[error("controller has no free capacity for a new proclet")]
    ControllerOutOfCapacity,

    #[error("connection error: {0}")]
    Io(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("unrecognized reply code {0}")]
    UnrecognizedReply(u8),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type NuResult<T> = Result<T, NuError>;

impl From<std::io::Error> for NuError {
    fn from(e: std::io::Error) -> Self {
        NuError::Io(e.to_string())
    }
}

impl From<config::ConfigError> for NuError {
    fn from(e: config::ConfigError) -> Self {
        NuError::Config(e.to_string())
    }
}

impl From<bincode::error::EncodeError> for NuError {
    fn from(e: bincode::error::EncodeError) -> Self {
        NuError::SerializationFailure(e.to_string())
    }
}

impl From<bincode::error::DecodeError> for NuError {
    fn from(e: bincode::error::DecodeError) -> Self {
        NuError::SerializationFailure(e.to_string())
    }
}
