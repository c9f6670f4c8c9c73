use thiserror::Error;

/// Error type shared by all reconcilers.
///
/// Every failure carries a machine-readable reason that ends up in status
/// conditions and events. The variant decides the retry policy: `Generic`
/// errors requeue with backoff, `Stalling` errors park the object until its
/// generation (or the reconcile-requested annotation) changes.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        #[from]
        source: kube::Error,
    },

    /// Recoverable failure, requeued with backoff.
    #[error("{reason}: {message}")]
    Generic { reason: String, message: String },

    /// Terminal-until-input-changes failure. The work queue will not retry
    /// until the object's generation or reconcile request changes.
    #[error("{reason}: {message}")]
    Stalling { reason: String, message: String },
}

impl ReconcileError {
    pub fn generic(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Generic {
            reason: reason.into(),
            message: message.into(),
        }
    }

    pub fn stalling(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Stalling {
            reason: reason.into(),
            message: message.into(),
        }
    }

    /// Whether this error parks the object instead of requeuing it.
    pub fn is_stalling(&self) -> bool {
        matches!(self, Self::Stalling { .. })
    }

    /// The reason recorded on conditions and events.
    pub fn reason(&self) -> &str {
        match self {
            Self::Kube { .. } => crate::conditions::reasons::FAILED,
            Self::Generic { reason, .. } | Self::Stalling { reason, .. } => reason,
        }
    }

    /// Whether the work queue should retry this error.
    ///
    /// Kubernetes conflicts and transient API errors retry; stalling errors
    /// do not.
    pub fn is_retryable(&self) -> bool {
        !self.is_stalling()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generic_errors_are_retryable() {
        let err = ReconcileError::generic("FetchFailed", "connection refused");
        assert!(err.is_retryable());
        assert!(!err.is_stalling());
        assert_eq!(err.reason(), "FetchFailed");
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn stalling_errors_park_the_object() {
        let err = ReconcileError::stalling("URLInvalid", "scheme 'ftp' is not supported");
        assert!(err.is_stalling());
        assert!(!err.is_retryable());
        assert_eq!(err.reason(), "URLInvalid");
    }

    #[test]
    fn kube_errors_use_the_generic_failed_reason() {
        let err = ReconcileError::from(kube::Error::LinesCodecMaxLineLengthExceeded);
        assert_eq!(err.reason(), crate::conditions::reasons::FAILED);
        assert!(err.is_retryable());
    }
}
