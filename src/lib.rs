//! Streams a local file to a remote host over SSH using the scp sink
//! protocol, then runs a command on the same connection.

pub mod adapter;
pub mod config;
pub mod error;
pub mod progress;
pub mod remote;
pub mod services;
mod util;

pub use error::{Error, Phase, RemoteFailure, Result};
pub use remote::Remote;
