// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Error types for engine-level operations and individual sessions.
//!
//! No `thiserror`/`anyhow` here: hand-rolled enums with manual `Display` and
//! `std::error::Error` impls, matching the rest of this crate's dependency
//! discipline. The buffer pool has no error type of its own: a failed chunk
//! allocation is an allocator-level out-of-memory abort (see §7), not a
//! recoverable condition this crate catches and reports.

use std::fmt;
use std::io;

/// Errors from engine-level operations (registering emitters, connecting,
/// shutting down).
#[derive(Debug)]
pub enum EngineError {
    /// An emitter with this identity is already registered.
    AlreadyRegistered,
    /// The engine has already been stopped.
    EngineStopped,
    /// A shutdown wait was interrupted.
    Interrupted(String),
    /// Underlying socket/poll I/O failure.
    Io(io::Error),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyRegistered => write!(f, "emitter already registered"),
            Self::EngineStopped => write!(f, "engine stopped"),
            Self::Interrupted(msg) => write!(f, "shutdown wait interrupted: {msg}"),
            Self::Io(e) => write!(f, "I/O failure: {e}"),
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for EngineError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

/// Errors surfaced by a single session's I/O path.
#[derive(Debug)]
pub enum SessionError {
    /// The session is closing or already closed.
    Closed,
    /// Underlying socket failure.
    Io(io::Error),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "session closed"),
            Self::Io(e) => write!(f, "session I/O failure: {e}"),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Closed => None,
        }
    }
}

impl From<io::Error> for SessionError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}
