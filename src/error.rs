//! Domain-specific errors for package lifecycle operations.
//!
//! Every task failure is reported through [`Error`]; the coarse
//! [`ErrorCode`] (plus a numeric value and the display string) is what
//! failure notifications carry across process boundaries.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    /// The task was canceled by the user or controller before commit.
    #[error("canceled")]
    Canceled,

    /// Archive layout, manifest, report or registry state violates the
    /// package contract (includes conflicts like double installations).
    #[error("{0}")]
    Package(String),

    /// The digest computed over the package stream does not match the
    /// digest embedded in the package footer.
    #[error("package digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    /// A signature was present but could not be verified under the
    /// configured chain of trust.
    #[error("{0}")]
    SignatureInvalid(String),

    /// The package carries no signature and the policy forbids that.
    #[error("cannot install unsigned packages")]
    UnsignedNotAllowed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A filesystem operation failed with context that a bare
    /// `io::Error` cannot carry (privilege errors included).
    #[error("{0}")]
    Filesystem(String),

    #[error("{0}")]
    NotInstalled(String),

    #[error("{0}")]
    Parse(String),

    /// Invariant violation; should not occur.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Attach a path or operation context to a low-level I/O failure.
    pub fn io_context(context: impl Into<String>, err: std::io::Error) -> Self {
        Self::Filesystem(format!("{}: {err}", context.into()))
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Canceled => ErrorCode::Canceled,
            Self::Package(_) | Self::DigestMismatch { .. } => ErrorCode::Package,
            Self::SignatureInvalid(_) | Self::UnsignedNotAllowed => ErrorCode::Signature,
            Self::Io(_) | Self::Filesystem(_) => ErrorCode::Io,
            Self::NotInstalled(_) => ErrorCode::NotInstalled,
            Self::Parse(_) => ErrorCode::Parse,
            Self::Internal(_) => ErrorCode::Internal,
        }
    }
}

impl From<serde_norway::Error> for Error {
    fn from(err: serde_norway::Error) -> Self {
        Self::Parse(err.to_string())
    }
}

/// Coarse error classification exposed on task failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorCode {
    Canceled = 1,
    Package = 2,
    Io = 3,
    Signature = 4,
    NotInstalled = 5,
    Parse = 6,
    Internal = 7,
}

impl ErrorCode {
    /// Numeric value for IPC surfaces that want a plain integer.
    pub fn as_int(self) -> u32 {
        self as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_mapping() {
        assert_eq!(Error::Canceled.code(), ErrorCode::Canceled);
        assert_eq!(Error::Package("x".into()).code(), ErrorCode::Package);
        assert_eq!(
            Error::DigestMismatch {
                expected: "aa".into(),
                actual: "bb".into()
            }
            .code(),
            ErrorCode::Package
        );
        assert_eq!(Error::UnsignedNotAllowed.code(), ErrorCode::Signature);
        assert_eq!(
            Error::NotInstalled("x".into()).code(),
            ErrorCode::NotInstalled
        );
        assert_eq!(ErrorCode::Canceled.as_int(), 1);
    }
}
