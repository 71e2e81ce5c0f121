//! Error types for remote-pull
//!
//! Every failure carries the phase it happened in, so callers can tell
//! "could not reach the host" apart from "reached the host but the
//! command or transfer failed".

use std::{fmt, io, path::PathBuf};

use thiserror::Error;

/// Which logical step of an operation a failure belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// A standalone remote command
    Command,
    /// Streaming a file into the remote sink
    Transfer,
    /// The command executed after a successful transfer
    PostCommand,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Command => "command",
            Phase::Transfer => "transfer",
            Phase::PostCommand => "post-command",
        })
    }
}

/// Main error type
#[derive(Error, Debug)]
pub enum Error {
    /// Application settings file is unreadable or malformed
    #[error("failed to load settings from '{path}': {message}")]
    Settings { path: PathBuf, message: String },

    /// SSH config file exists but could not be read
    #[error("failed to read SSH config '{path}': {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Secure channel could not be established (includes auth exhaustion)
    #[error("failed to dial {target}: {source}")]
    Dial {
        target: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to create {phase} session: {source}")]
    SessionCreation {
        phase: Phase,
        #[source]
        source: io::Error,
    },

    /// Local source file could not be inspected, opened or read
    #[error("failed to read source file '{path}': {source}")]
    SourceFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write {phase} stream: {source}")]
    StreamWrite {
        phase: Phase,
        #[source]
        source: io::Error,
    },

    /// The remote side failed to run or exited unsuccessfully
    #[error("{phase} failed: {reason}")]
    RemoteExecution {
        phase: Phase,
        #[source]
        reason: RemoteFailure,
    },
}

/// Why a remote process is considered failed
#[derive(Error, Debug)]
pub enum RemoteFailure {
    #[error("remote process exited with status {0}")]
    ExitStatus(i32),

    /// The sink answered with a warning or fatal reply
    #[error("remote peer rejected the transfer: {0}")]
    Rejected(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    pub fn remote(phase: Phase, reason: impl Into<RemoteFailure>) -> Self {
        Error::RemoteExecution {
            phase,
            reason: reason.into(),
        }
    }

    pub fn stream(phase: Phase, source: io::Error) -> Self {
        Error::StreamWrite { phase, source }
    }

    pub fn source_file(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Error::SourceFile {
            path: path.into(),
            source,
        }
    }

    /// `true` when the host could not be reached at all
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Error::Dial { .. })
    }

    /// The phase a session-level failure happened in, if any
    pub fn phase(&self) -> Option<Phase> {
        match self {
            Error::SessionCreation { phase, .. }
            | Error::StreamWrite { phase, .. }
            | Error::RemoteExecution { phase, .. } => Some(*phase),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
