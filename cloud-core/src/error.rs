use thiserror::Error;

/// Every fallible orchestrator operation reports one of these kinds so callers
/// at the boundary can map them to a response code without guessing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CloudError {
    /// Template, instance, vhost or port is absent.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Duplicate hostname, fqdn, vhost or port.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Remote call failure, checksum mismatch, timeout, DNS failure,
    /// disallowed transition or pool exhaustion.
    #[error("Unavailable: {0}")]
    Unavailable(String),

    /// A multi-step remote operation partially completed and then errored.
    #[error("Failed: {0}")]
    Failed(String),

    /// The stored metadata revision moved underneath a write.
    #[error("Conflict: {0}")]
    Conflict(String),
}

impl CloudError {
    /// The human readable reason without the kind prefix.
    pub fn reason(&self) -> &str {
        match self {
            CloudError::NotFound(s)
            | CloudError::AlreadyExists(s)
            | CloudError::Unavailable(s)
            | CloudError::Failed(s)
            | CloudError::Conflict(s) => s,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, CloudError::NotFound(_))
    }

    /// Re-label an error as a partial failure of a larger operation, keeping
    /// the original reason for diagnosis.
    pub fn into_failed(self, step: &str) -> Self {
        match self {
            CloudError::Failed(s) => CloudError::Failed(s),
            other => CloudError::Failed(format!("{step}: {other}")),
        }
    }
}

impl From<std::io::Error> for CloudError {
    fn from(err: std::io::Error) -> Self {
        CloudError::Unavailable(format!("I/O error: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, CloudError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_kind_and_reason() {
        let err = CloudError::Unavailable("timeout waiting for lock".into());
        assert_eq!(err.to_string(), "Unavailable: timeout waiting for lock");
        assert_eq!(err.reason(), "timeout waiting for lock");
    }

    #[test]
    fn test_into_failed_wraps_once() {
        let err = CloudError::Unavailable("resize refused".into()).into_failed("create web");
        assert_eq!(
            err,
            CloudError::Failed("create web: Unavailable: resize refused".into())
        );

        let again = err.clone().into_failed("outer");
        assert_eq!(again, err);
    }

    #[test]
    fn test_io_errors_are_unavailable() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert!(matches!(CloudError::from(io), CloudError::Unavailable(_)));
    }
}
