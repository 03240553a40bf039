//! Error types for clrbridge.

use std::path::PathBuf;

use thiserror::Error;

use crate::runtime::{ClrFlavor, VersionInfo};

#[derive(Debug, Error)]
pub enum Error {
    #[error("No matching DAC found: {0}")]
    NotFound(String),

    #[error("Mismatched DAC {path}: expected version {expected}, found {actual}")]
    VersionMismatch {
        path: PathBuf,
        expected: VersionInfo,
        actual: String,
    },

    #[error("Mismatched architecture: expected {expected}-byte pointers, found {actual}-byte")]
    ArchitectureMismatch { expected: u32, actual: u32 },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid method signature at slot {slot}: {reason}")]
    InvalidMethodSignature { slot: usize, reason: String },

    #[error("No layout registered for {flavor} runtime {version}")]
    UnsupportedLayout {
        flavor: ClrFlavor,
        version: VersionInfo,
    },

    #[error("Failed to read target memory at address {address:#x}: {message}")]
    MemoryReadFailed { address: u64, message: String },

    #[error("Invalid image {path}: {message}")]
    InvalidImage { path: PathBuf, message: String },

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(&'static str),

    #[error("Failed to load native library: {0}")]
    Library(String),

    #[error("{context} failed: 0x{hr:08X}")]
    Hresult { context: &'static str, hr: u32 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether this error means "nothing matched" rather than a hard failure.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(_) => true,
            Error::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_is_not_found() {
        assert!(Error::NotFound("mscordaccore.dll".into()).is_not_found());

        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        assert!(Error::Io(io_err).is_not_found());

        let err = Error::ArchitectureMismatch {
            expected: 8,
            actual: 4,
        };
        assert!(!err.is_not_found());
    }

    #[test]
    fn test_hresult_display() {
        let err = Error::Hresult {
            context: "CLRDataCreateInstance",
            hr: 0x80004005,
        };
        assert_eq!(err.to_string(), "CLRDataCreateInstance failed: 0x80004005");
    }
}
