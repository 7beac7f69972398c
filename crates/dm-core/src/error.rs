use thiserror::Error;

pub type DmResult<T> = Result<T, DmError>;

#[derive(Debug, Error)]
pub enum DmError {
    /// Malformed submission or argument. Returned to the caller, never logged as a fault.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("key derivation failed: {0}")]
    DerivationFailure(String),

    #[error("key wrap failed: {0}")]
    WrapFailure(String),

    #[error("key unwrap failed: {0}")]
    UnwrapFailure(String),

    #[error("chunk cipher failed: {0}")]
    Cipher(String),

    #[error("job {job_id}: destination assignment failed: {reason}")]
    JobTransientFailure { job_id: String, reason: String },

    #[error("job {job_id} faulted after {attempts} attempts: {reason}")]
    JobFault {
        job_id: String,
        attempts: u32,
        reason: String,
    },

    #[error("ownership violation: {0}")]
    OwnershipViolation(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("queue error: {0}")]
    Queue(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DmError {
    /// Errors caused by the caller's request rather than by the system.
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            DmError::InvalidInput(_) | DmError::NotFound(_) | DmError::OwnershipViolation(_)
        )
    }

    /// Failures of a cryptographic primitive. These always abort the operation.
    pub fn is_crypto_error(&self) -> bool {
        matches!(
            self,
            DmError::DerivationFailure(_)
                | DmError::WrapFailure(_)
                | DmError::UnwrapFailure(_)
                | DmError::Cipher(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_errors_are_classified() {
        assert!(DmError::InvalidInput("x".into()).is_input_error());
        assert!(DmError::OwnershipViolation("x".into()).is_input_error());
        assert!(!DmError::Store("x".into()).is_input_error());
        assert!(!DmError::UnwrapFailure("x".into()).is_input_error());
    }

    #[test]
    fn crypto_errors_are_classified() {
        assert!(DmError::UnwrapFailure("bad tag".into()).is_crypto_error());
        assert!(DmError::DerivationFailure("timeout".into()).is_crypto_error());
        assert!(!DmError::InvalidInput("x".into()).is_crypto_error());
    }

    #[test]
    fn job_fault_message_names_attempts() {
        let err = DmError::JobFault {
            job_id: "j1".into(),
            attempts: 3,
            reason: "backend down".into(),
        };
        assert_eq!(
            err.to_string(),
            "job j1 faulted after 3 attempts: backend down"
        );
    }
}
