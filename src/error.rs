//! Data-plane error taxonomy.
//!
//! The control plane (filter sync, persistence, config) works with
//! `anyhow::Result`; the poll loop needs to tell permission failures and
//! explicit stops apart from everything else, so it gets a typed error.

use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("I/O error: {0}")]
    Io(#[source] io::Error),

    /// EPERM from a socket or device operation, usually the OS power manager
    /// cutting the app off from the network.
    #[error("Permission denied: {0}")]
    Permission(#[source] io::Error),

    #[error("Bad file descriptor: {0}")]
    BadDescriptor(#[source] io::Error),

    /// Stop was requested through the error pipe.
    #[error("Tunnel interrupted")]
    Interrupted,

    #[error("WireGuard error: {0}")]
    Protocol(String),

    #[error("Too many errors recently, last: {0}")]
    TooManyErrors(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl TunnelError {
    /// Classifies a raw OS error.
    pub fn from_io(e: io::Error) -> Self {
        match e.raw_os_error() {
            Some(libc::EPERM) => TunnelError::Permission(e),
            Some(libc::EBADF) => TunnelError::BadDescriptor(e),
            _ => TunnelError::Io(e),
        }
    }

    pub fn is_permission(&self) -> bool {
        matches!(self, TunnelError::Permission(_))
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, TunnelError::Interrupted)
    }
}

impl From<io::Error> for TunnelError {
    fn from(e: io::Error) -> Self {
        TunnelError::from_io(e)
    }
}

pub type TunnelResult<T> = std::result::Result<T, TunnelError>;
