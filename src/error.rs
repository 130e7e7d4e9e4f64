use std::{
    error::Error,
    fmt::{self, Display},
};

/// The result type used in the entire federation crate.
pub type Result<T> = std::result::Result<T, CflErr>;

/// The federation crate's error type.
#[derive(Debug, Clone, PartialEq)]
pub enum CflErr {
    KeyMismatch {
        key: String,
    },
    ShapeMismatch {
        key: String,
        got: Vec<usize>,
        expected: Vec<usize>,
    },
    EmptySourceSet {
        op: &'static str,
    },
    InsufficientMembers {
        op: &'static str,
        got: usize,
        required: usize,
    },
    NonSquareMatrix {
        rows: usize,
        cols: usize,
    },
    UnknownMember {
        index: usize,
        roster: usize,
    },
    OracleFailure {
        client: Option<usize>,
        reason: String,
    },
    InvalidConfig(String),
}

impl CflErr {
    /// Whether the caller may recover by dropping the offending client from the round.
    ///
    /// # Returns
    /// `true` only for oracle failures, every other variant is a contract violation.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, CflErr::OracleFailure { .. })
    }
}

impl Display for CflErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CflErr::KeyMismatch { key } => {
                write!(f, "parameter maps have different key sets, `{key}` is missing")
            }
            CflErr::ShapeMismatch { key, got, expected } => write!(
                f,
                "shape mismatch for `{key}`, got {got:?} and expected {expected:?}"
            ),
            CflErr::EmptySourceSet { op } => write!(f, "{op} called with no contributors"),
            CflErr::InsufficientMembers { op, got, required } => write!(
                f,
                "{op} requires at least {required} members, got {got}"
            ),
            CflErr::NonSquareMatrix { rows, cols } => {
                write!(f, "expected a square similarity matrix, got {rows}x{cols}")
            }
            CflErr::UnknownMember { index, roster } => {
                write!(f, "member {index} is out of range for a roster of {roster}")
            }
            CflErr::OracleFailure {
                client: Some(client),
                reason,
            } => write!(f, "training oracle failed for client {client}: {reason}"),
            CflErr::OracleFailure {
                client: None,
                reason,
            } => write!(f, "training oracle failed for the server: {reason}"),
            CflErr::InvalidConfig(msg) => write!(f, "invalid config: {msg}"),
        }
    }
}

impl Error for CflErr {}
