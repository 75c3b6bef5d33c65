//! Error types for lazarus-core.

use lazarus_abi::{FailureKind, OpCode};
use thiserror::Error;

/// Result type for lazarus-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in lazarus-core.
#[derive(Debug, Error)]
pub enum Error {
    /// The artifact is missing, unreadable, or could not be staged.
    #[error("bad image: {0}")]
    BadImage(String),

    /// Failed to load dynamic library.
    #[error("failed to load library: {0}")]
    LibraryLoad(#[from] libloading::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The loaded module's headers could not be parsed.
    #[error("image parse error: {0}")]
    ImageParse(String),

    /// Saved state no longer matches the new image's state section.
    #[error("state invalidated: {0}")]
    StateInvalidated(String),

    /// A guest call raised a CPU exception.
    #[error("guest fault: {0:?}")]
    GuestFault(FailureKind),

    /// The guest rejected a load/unload with a non-zero status.
    #[error("guest rejected {0:?} with status {1}")]
    GuestRejected(OpCode, i32),

    /// Fault handler installation failed.
    #[error("fault handler: {0}")]
    Handler(String),
}

impl Error {
    /// The failure classification this error surfaces on the public context.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Error::BadImage(_)
            | Error::LibraryLoad(_)
            | Error::Io(_)
            | Error::ImageParse(_) => FailureKind::BadImage,
            Error::StateInvalidated(_) => FailureKind::StateInvalidated,
            Error::GuestFault(kind) => *kind,
            Error::GuestRejected(..) => FailureKind::User,
            Error::Handler(_) => FailureKind::OtherException,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_kind_mapping() {
        assert_eq!(
            Error::BadImage("x".into()).failure_kind(),
            FailureKind::BadImage
        );
        assert_eq!(
            Error::StateInvalidated("len".into()).failure_kind(),
            FailureKind::StateInvalidated
        );
        assert_eq!(
            Error::GuestFault(FailureKind::Segfault).failure_kind(),
            FailureKind::Segfault
        );
        assert_eq!(
            Error::GuestRejected(OpCode::Load, 1).failure_kind(),
            FailureKind::User
        );
    }
}
