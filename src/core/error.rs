use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Io,
    Codec,
    NotFound,
    InvalidInput,
    InvalidState,
    /// A mutation was applied to state that cannot logically accept it,
    /// e.g. removing an id that is not present in the merged view.
    InvalidMutation,
    /// The record exists but its writing transaction has not flushed yet.
    /// Transient: callers may retry after that transaction finishes.
    RecordNotYetWritten,
    /// Two writers targeted the same record key at the same time.
    ConcurrentWriteConflict,
    /// A NOT node was left without an enclosing universe after resolution.
    UnresolvedFormula,
    Internal,
}

#[derive(Debug)]
pub struct Error {
    pub kind: ErrorKind,
    pub context: String,
}

impl Error {
    pub fn new(kind: ErrorKind, context: String) -> Self {
        Error { kind, context }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::RecordNotYetWritten | ErrorKind::ConcurrentWriteConflict
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.context)
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error {
            kind: ErrorKind::Io,
            context: err.to_string(),
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error {
            kind: ErrorKind::Codec,
            context: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
