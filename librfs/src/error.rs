use std::time::Duration;

use thiserror::Error;

/// Outcome of a failed backend call, recorded once on the entry it was
/// resolving and replayed to every later accessor.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendFailure {
    #[error("{message}")]
    Backend { message: String },
    #[error("backend did not answer within {after:?}")]
    TimedOut { after: Duration },
}

impl BackendFailure {
    pub fn from_anyhow(err: anyhow::Error) -> Self {
        BackendFailure::Backend {
            message: format!("{err:#}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RfsError {
    #[error("malformed path: {0:?}")]
    MalformedPath(String),
    #[error("no such resource: {0}")]
    NotFound(String),
    #[error("{0} is not open for writing")]
    NotWritable(String),
    #[error("offset out of range for {0}")]
    OutOfRange(String),
    #[error("resolving {path} failed: {source}")]
    AlreadyFailed {
        path: String,
        #[source]
        source: BackendFailure,
    },
}

impl RfsError {
    pub fn malformed(path: impl Into<String>) -> Self {
        RfsError::MalformedPath(path.into())
    }

    /// Errno reported to the kernel for this error.
    pub fn errno(&self) -> libc::c_int {
        match self {
            RfsError::MalformedPath(_) | RfsError::NotFound(_) => libc::ENOENT,
            RfsError::NotWritable(_) => libc::EBADF,
            RfsError::OutOfRange(_) => libc::EFBIG,
            RfsError::AlreadyFailed { .. } => libc::EIO,
        }
    }
}

pub type Result<T> = std::result::Result<T, RfsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(RfsError::malformed("").errno(), libc::ENOENT);
        assert_eq!(RfsError::NotFound("a".into()).errno(), libc::ENOENT);
        let failed = RfsError::AlreadyFailed {
            path: "a:".into(),
            source: BackendFailure::Backend {
                message: "boom".into(),
            },
        };
        assert_eq!(failed.errno(), libc::EIO);
        assert_eq!(failed.to_string(), "resolving a: failed: boom");
    }

    #[test]
    fn test_backend_failure_keeps_context_chain() {
        let err = anyhow::anyhow!("connection refused").context("GET https://example.com");
        let failure = BackendFailure::from_anyhow(err);
        assert_eq!(
            failure.to_string(),
            "GET https://example.com: connection refused"
        );
    }
}
