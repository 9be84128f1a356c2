//! Common error types for the Isoforge ecosystem.

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`IsoforgeError`].
pub type IsoforgeResult<T> = Result<T, IsoforgeError>;

/// Common errors across the Isoforge ecosystem.
#[derive(Error, Diagnostic, Debug)]
pub enum IsoforgeError {
    /// An OS mount or unmount call failed.
    #[error("Mount operation failed: {operation}")]
    #[diagnostic(
        code(isoforge::mount),
        help("Mount operations require elevated privileges (sudo)")
    )]
    Mount {
        /// Description of the mount or unmount that failed.
        operation: String,
    },

    /// An external packing or image-authoring tool exited nonzero.
    #[error("Repack tool failed: {message}")]
    #[diagnostic(
        code(isoforge::repack),
        help("Ensure mksquashfs and xorriso are installed and on PATH")
    )]
    Repack {
        /// Description of the failed invocation.
        message: String,
    },

    /// An internal consistency failure. This is a programming error,
    /// not a condition callers are expected to recover from.
    #[error("Invariant violated: {message}")]
    #[diagnostic(
        code(isoforge::invariant),
        help("This is a bug, please report it at https://github.com/isoforge/isoforge/issues")
    )]
    Invariant {
        /// The violated invariant.
        message: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(isoforge::io))]
    Io(#[from] std::io::Error),

    /// Configuration error.
    #[error("Configuration error: {message}")]
    #[diagnostic(code(isoforge::config))]
    Config {
        /// The error message.
        message: String,
    },

    /// An editing action failed. Action errors propagate through the
    /// core unchanged; the core never interprets or retries them.
    #[error("Action failed: {message}")]
    #[diagnostic(code(isoforge::action))]
    Action {
        /// The error message.
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = IsoforgeError::Mount {
            operation: "mount -t iso9660 image.iso /mnt".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Mount operation failed: mount -t iso9660 image.iso /mnt"
        );
    }

    #[test]
    fn error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: IsoforgeError = io_err.into();
        assert!(matches!(err, IsoforgeError::Io(_)));
    }

    #[test]
    fn invariant_display() {
        let err = IsoforgeError::Invariant {
            message: "teardown called twice".to_string(),
        };
        assert!(err.to_string().contains("teardown called twice"));
    }
}
