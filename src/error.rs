/// Exit status for aborts the operator caused or can act on directly.
pub const EXIT_OPERATOR_ABORT: i32 = 3;
/// Exit status for every other failure.
pub const EXIT_FAILURE: i32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum MoveError {
    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    #[error("Guest '{guest}' {reason}")]
    PreconditionViolation { guest: String, reason: String },

    #[error("{disk} is not the same size on local vs remote: {expected}B on local VS {actual}B on remote")]
    SizeMismatch {
        disk: String,
        expected: u64,
        actual: u64,
    },

    #[error("Creation of {disk} on {host} declined by operator")]
    ProvisioningDeclined { disk: String, host: String },

    #[error("Operator declined: {0}")]
    Declined(String),

    #[error("Could not create {disk} on {host}: {reason}")]
    ProvisioningFailed {
        disk: String,
        host: String,
        reason: String,
    },

    #[error("Transfer of {disk} failed: {reason}")]
    TransferError { disk: String, reason: String },

    #[error("Definition of '{guest}' could not be moved: {reason}")]
    TransportError { guest: String, reason: String },

    #[error("Cannot reach {host}: {reason}")]
    Unreachable { host: String, reason: String },

    #[error("Hypervisor error on {host}: {message}")]
    Hypervisor { host: String, message: String },

    #[error("Command `{command}` failed on {host}: {stderr}")]
    CommandFailed {
        host: String,
        command: String,
        stderr: String,
    },

    #[error("Gave up waiting for '{guest}' after {seconds}s")]
    Timeout { guest: String, seconds: u64 },

    #[error("Interrupted while {0}")]
    Cancelled(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Definition parse error: {0}")]
    Xml(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Serde(String),
}

impl MoveError {
    pub fn guest_not_found(name: impl Into<String>) -> Self {
        MoveError::NotFound {
            kind: "Guest",
            name: name.into(),
        }
    }

    pub fn volume_not_found(path: impl Into<String>) -> Self {
        MoveError::NotFound {
            kind: "Volume",
            name: path.into(),
        }
    }

    /// Process exit status to report for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            MoveError::NotFound { .. }
            | MoveError::PreconditionViolation { .. }
            | MoveError::SizeMismatch { .. }
            | MoveError::ProvisioningDeclined { .. }
            | MoveError::Declined(_)
            | MoveError::Unreachable { .. } => EXIT_OPERATOR_ABORT,
            _ => EXIT_FAILURE,
        }
    }
}

impl From<toml::de::Error> for MoveError {
    fn from(err: toml::de::Error) -> Self {
        MoveError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for MoveError {
    fn from(err: serde_json::Error) -> Self {
        MoveError::Serde(err.to_string())
    }
}

impl From<roxmltree::Error> for MoveError {
    fn from(err: roxmltree::Error) -> Self {
        MoveError::Xml(err.to_string())
    }
}
