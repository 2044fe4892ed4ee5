//! Error types surfaced by the bridge.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::value::NativeAddress;

/// Failure reported by a [`NativeAllocator`](crate::native::NativeAllocator).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NativeError {
    /// The native heap could not satisfy the request.
    #[error("native allocation of {bytes} bytes failed")]
    OutOfMemory {
        /// Requested size.
        bytes: usize,
    },
    /// The allocator returned an address that collides with the immediate space.
    #[error("native allocator returned misaligned address {0}")]
    Misaligned(NativeAddress),
    /// The address was never handed out by this allocator, or was already freed.
    #[error("address {0} is not owned by this allocator")]
    UnknownAddress(NativeAddress),
    /// The native free routine reported a failure.
    #[error("freeing {address} failed: {reason}")]
    FreeFailed {
        /// Address being released.
        address: NativeAddress,
        /// Allocator-specific description.
        reason: String,
    },
}

/// Failure to take the execution lock.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum GilError {
    /// The waiting thread was interrupted before it obtained the lock.
    #[error("GIL acquisition interrupted")]
    Interrupted,
    /// The deadline passed before the lock became available.
    #[error("GIL acquisition timed out")]
    TimedOut,
}

impl GilError {
    /// Both variants leave the lock untouched, so the caller may try again.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::Interrupted | Self::TimedOut)
    }
}

/// Exception raised by native code through the `raise` upcall.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("native exception: {message}")]
pub struct NativeException {
    /// Message supplied by native code.
    pub message: String,
}

impl NativeException {
    /// Creates an exception with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Failure to load or initialise an extension library.
#[derive(Debug, Error)]
pub enum ExtensionError {
    /// The dynamic loader rejected the file.
    #[error("failed to load extension {path:?}")]
    Load {
        /// Path passed to [`Extension::open`](crate::Extension::open).
        path: PathBuf,
        /// Loader error.
        #[source]
        source: libloading::Error,
    },
    /// The library has no `Init_<name>` entry point.
    #[error("extension `{name}` has no `{symbol}` entry point")]
    MissingInit {
        /// Extension name derived from the file stem.
        name: String,
        /// Symbol that was looked up.
        symbol: String,
        /// Loader error.
        #[source]
        source: libloading::Error,
    },
    /// The path has no usable file stem.
    #[error("cannot derive an extension name from {0:?}")]
    InvalidName(PathBuf),
}

/// Errors returned by [`Bridge`](crate::Bridge) operations.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Native resource allocation failed while creating a handle.
    #[error("handle allocation failed")]
    Allocation(#[source] NativeError),
    /// `resolve` was given an address no live handle owns.
    #[error("no handle owns address {0}")]
    UnknownAddress(NativeAddress),
    /// The handle still exists but its managed object has been collected.
    #[error("object behind {0} has been collected")]
    Collected(NativeAddress),
    /// The address uses a reserved immediate pattern.
    #[error("{0} is not a valid immediate")]
    InvalidImmediate(NativeAddress),
    /// The allocator handed out an address that a live handle already owns.
    #[error("native allocator reused live address {0}")]
    AddressInUse(NativeAddress),
    /// Wrong number of arguments for a native method.
    #[error("wrong number of arguments (given {given}, expected {expected})")]
    ArityMismatch {
        /// Arguments supplied.
        given: usize,
        /// Arguments the method takes.
        expected: usize,
    },
    /// More arguments than a C `int` can count.
    #[error("too many arguments ({0})")]
    TooManyArguments(usize),
    /// Native code raised an exception.
    #[error(transparent)]
    Raised(#[from] NativeException),
    /// The execution lock could not be taken.
    #[error(transparent)]
    Gil(#[from] GilError),
    /// The bridge has been shut down.
    #[error("bridge has been shut down")]
    ShutDown,
    /// A background thread could not be spawned.
    #[error("failed to spawn thread `{name}`")]
    Spawn {
        /// Thread name.
        name: String,
        /// OS error.
        #[source]
        source: io::Error,
    },
    /// Extension loading failed.
    #[error(transparent)]
    Extension(#[from] ExtensionError),
    /// No native method with that name is defined on the owner.
    #[error("undefined method `{name}` for {owner}")]
    UndefinedMethod {
        /// Owner the method was looked up on.
        owner: String,
        /// Method name.
        name: String,
    },
}

impl From<NativeError> for BridgeError {
    fn from(err: NativeError) -> Self {
        Self::Allocation(err)
    }
}

impl BridgeError {
    /// Returns `true` if the operation failed only because the lock was not
    /// obtained and may be retried.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Gil(err) if err.is_retryable())
    }
}
