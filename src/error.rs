//! Error types for the mirror filesystem and its remote collaborator.

use thiserror::Error;

/// Coarse classification of a remote failure. The message is kept verbatim.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemoteErrorKind {
    ResourceNotFound,
    InvalidState,
    InvalidInput,
}

/// Opaque failure reported by the remote API client.
#[derive(Clone, Debug, Error)]
#[error("{kind:?}: {message}")]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::ResourceNotFound, message)
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::InvalidState, message)
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorKind::InvalidInput, message)
    }
}

pub type RemoteResult<T> = Result<T, RemoteError>;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("no such file or directory: {0}")]
    NotFound(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("is a directory: {0}")]
    IsADirectory(String),

    #[error("operation not supported: {0}")]
    NotSupported(String),

    #[error("file exists: {0}")]
    AlreadyExists(String),

    #[error("directory not empty: {0}")]
    NotEmpty(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("no such attribute: {0}")]
    NoAttribute(String),

    #[error(transparent)]
    Remote(#[from] RemoteError),
}

impl FsError {
    /// errno handed back to the kernel for this error.
    pub fn errno(&self) -> i32 {
        match self {
            FsError::NotFound(_) => libc::ENOENT,
            FsError::NotADirectory(_) => libc::ENOTDIR,
            FsError::IsADirectory(_) => libc::EISDIR,
            FsError::NotSupported(_) => libc::ENOTSUP,
            FsError::AlreadyExists(_) => libc::EEXIST,
            FsError::NotEmpty(_) => libc::ENOTEMPTY,
            FsError::InvalidArgument(_) => libc::EINVAL,
            FsError::NoAttribute(_) => libc::ENODATA,
            FsError::Remote(_) => libc::EIO,
        }
    }
}

pub type FsResult<T> = Result<T, FsError>;

/// Failures while bringing a mount up or down.
#[derive(Debug, Error)]
pub enum MountError {
    #[error("filesystem setup failed: {0}")]
    Fs(#[from] FsError),

    #[error("fuse session: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_errors_surface_as_eio() {
        let err: FsError = RemoteError::not_found("file-xxxx").into();
        assert_eq!(err.errno(), libc::EIO);
        assert!(err.to_string().contains("file-xxxx"));
    }

    #[test]
    fn local_errors_map_to_posix_codes() {
        assert_eq!(FsError::NotFound("/a".into()).errno(), libc::ENOENT);
        assert_eq!(FsError::NotADirectory("/a".into()).errno(), libc::ENOTDIR);
        assert_eq!(FsError::NotSupported("write".into()).errno(), libc::ENOTSUP);
        assert_eq!(FsError::NotEmpty("/a".into()).errno(), libc::ENOTEMPTY);
    }
}
