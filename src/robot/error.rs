/// Error types for Hetzner Robot operations
use thiserror::Error;

/// How many individual errors an aggregated report spells out.
pub const MAX_REPORTED_ERRORS: usize = 5;

/// Errors that can occur while talking to the Robot webservice or to servers.
#[derive(Error, Debug)]
pub enum RobotError {
    /// HTTP request failed before a response arrived.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The webservice answered 404.
    #[error("not found: {0}")]
    NotFound(String),

    /// The webservice answered with a status outside the success family.
    #[error("unexpected status {status}, body: {body}")]
    Api { status: u16, body: String },

    /// A success response did not match the expected shape.
    #[error("failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),

    /// SSH connection or remote command failed.
    #[error("SSH error on {host}: {message}")]
    Ssh { host: String, message: String },

    /// A polling loop hit its deadline.
    #[error("timed out after {secs} seconds: {what}")]
    Timeout { secs: u64, what: String },

    /// Every VLAN of the auto-pick pool is used by an existing vSwitch.
    #[error("no free VLAN in [{min}..{max}], all are taken")]
    VlanPoolExhausted { min: u16, max: u16 },

    /// Caller supplied a value the webservice would reject.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Provider configuration is incomplete or malformed.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Work was abandoned because a sibling operation failed.
    #[error("cancelled after another server failed")]
    Cancelled,

    /// A worker task ended without reporting a result.
    #[error("provisioning task ended without a result: {0}")]
    TaskAborted(String),

    /// Several independent operations failed.
    #[error("{0}")]
    Aggregate(String),
}

impl RobotError {
    /// True when the remote side reported the entity as missing.
    pub fn is_not_found(&self) -> bool {
        matches!(self, RobotError::NotFound(_))
    }

    /// Fold a list of failures into one error, naming at most
    /// [`MAX_REPORTED_ERRORS`] of them.
    pub fn aggregate(errors: Vec<RobotError>) -> Option<RobotError> {
        if errors.is_empty() {
            return None;
        }

        let total = errors.len();
        let shown: Vec<String> = errors
            .iter()
            .take(MAX_REPORTED_ERRORS)
            .map(|e| e.to_string())
            .collect();

        let mut message = format!("errors occurred: {}", shown.join("; "));
        if total > shown.len() {
            message.push_str(&format!(" (and {} more)", total - shown.len()));
        }

        Some(RobotError::Aggregate(message))
    }
}

pub type Result<T> = std::result::Result<T, RobotError>;
