use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Unexpected message in state {state}: expected {expected}, found {found}")]
    UnexpectedMessage {
        state:    String,
        expected: String,
        found:    String,
    },

    #[error("Parallel branch {branch} has not completed")]
    BranchIncomplete { branch: usize },

    #[error("Branch completion does not match any open parallel block")]
    JoinMismatch,

    #[error("The channel from {0} was closed")]
    Disconnected(String),

    #[error("Unknown role: {0}")]
    UnknownRole(String),

    #[error("A session lock was poisoned by a panicking thread")]
    Poisoned,
}
