use thiserror::Error;

/// Exit status used when a requested network interface does not exist (ENODEV).
pub const EXIT_INTERFACE_NOT_FOUND: i32 = 19;
/// Exit status used for malformed user-supplied values (EINVAL).
pub const EXIT_INVALID_PARAMETER: i32 = 22;
/// Exit status used when a shaping rule already exists on the device (EEXIST).
pub const EXIT_RULE_EXISTS: i32 = 17;
/// Exit status used when a required external program is not installed.
pub const EXIT_COMMAND_NOT_FOUND: i32 = 127;

/// Common error types for tcshape
#[derive(Error, Debug)]
pub enum TcshapeError {
    #[error("network interface not found: {device}")]
    NetworkInterfaceNotFound { device: String },

    #[error("external command failed (status {status}): {command}: {stderr}")]
    ExternalToolFailure {
        command: String,
        status: i32,
        stderr: String,
    },

    #[error("invalid value for {name}: '{value}' ({reason})")]
    InvalidParameter {
        name: String,
        value: String,
        reason: String,
    },

    #[error("inconsistent tc state on {device}: {record} references unknown {reference}")]
    ParseInconsistency {
        device: String,
        record: String,
        reference: String,
    },

    #[error("command not found: {program}")]
    CommandNotFound { program: String },

    #[error(
        "shaping rules already exist on {device}; use --add, --change or --overwrite"
    )]
    ShapingRuleExists { device: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TcshapeError {
    /// Shorthand for an `InvalidParameter` error.
    pub fn invalid(name: &str, value: impl Into<String>, reason: impl Into<String>) -> Self {
        TcshapeError::InvalidParameter {
            name: name.to_string(),
            value: value.into(),
            reason: reason.into(),
        }
    }

    /// Process exit status for this error.
    ///
    /// External tool failures propagate the tool's own status so that scripts
    /// wrapping tcshape see the same code as the underlying `tc` invocation.
    pub fn exit_code(&self) -> i32 {
        match self {
            TcshapeError::NetworkInterfaceNotFound { .. } => EXIT_INTERFACE_NOT_FOUND,
            TcshapeError::InvalidParameter { .. } => EXIT_INVALID_PARAMETER,
            TcshapeError::CommandNotFound { .. } => EXIT_COMMAND_NOT_FOUND,
            TcshapeError::ShapingRuleExists { .. } => EXIT_RULE_EXISTS,
            TcshapeError::ExternalToolFailure { status, .. } if *status > 0 => *status,
            _ => 1,
        }
    }

    /// Whether the error only affects one device of a multi-device request.
    pub fn is_recoverable_per_device(&self) -> bool {
        matches!(self, TcshapeError::NetworkInterfaceNotFound { .. })
    }
}

pub type TcshapeResult<T> = Result<T, TcshapeError>;
