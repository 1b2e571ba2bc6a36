//! Errors raised by the analysis.
//!
//! Every error is fatal to the current analysis run. Errors raised while evaluating a program
//! node are wrapped in [`Error::At`] on their way up, so the caller can recover the chain of
//! enclosing AST nodes via [`Error::path`].

use std::fmt;

use thiserror::Error;

use crate::ast::NodeId;

/// Shorthand for results carrying an analysis [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

macro_rules! invariant_error {
    ($msg:expr) => {
        crate::error::Error::Invariant {
            message: $msg.to_string(),
        }
    };

    ($fmt:expr, $($arg:tt)*) => {
        crate::error::Error::Invariant {
            message: format!($fmt, $($arg)*),
        }
    };
}

pub(crate) use invariant_error;

/// A literal that could not be parsed.
///
/// Carries the full source string and the 0-based column of the first offending character.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsingError {
    pub source: String,
    pub column: usize,
    pub message: String,
}

impl ParsingError {
    pub fn new(source: &str, column: usize, message: impl Into<String>) -> Self {
        Self {
            source: source.to_string(),
            column,
            message: message.into(),
        }
    }
}

impl fmt::Display for ParsingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at column {} in {:?}", self.message, self.column, self.source)
    }
}

impl std::error::Error for ParsingError {}

#[derive(Error, Debug)]
pub enum Error {
    /// An internal invariant of the bit graph or of a write-once map was violated.
    #[error("Invariant violated: {message}")]
    Invariant { message: String },

    /// An operator received the wrong number of operand values.
    #[error("Operator {operator} expects {expected} argument(s), got {actual}")]
    WrongArgumentNumber {
        operator: &'static str,
        expected: String,
        actual: usize,
    },

    /// A bit registered as input already carries dependencies.
    #[error("Bit {bit} is not a fresh input bit: {reason}")]
    NotAnInputBit { bit: String, reason: String },

    /// The textual handler configuration is malformed or incomplete.
    #[error("Cannot initialize method invocation handler from {config:?}: {message}")]
    HandlerInit { config: String, message: String },

    /// A literal (bit, value, bit set or security level) could not be parsed.
    #[error("Parsing error: {0}")]
    Parsing(#[from] ParsingError),

    /// The construct is not supported by the interpreter (e.g. `while` loops).
    #[error("Not implemented: {0}")]
    Unsupported(String),

    /// A variable is read before any value was bound to it in the current frame.
    #[error("Variable {0} has no value")]
    UnboundVariable(String),

    /// A top-level input variable is written a second time.
    #[error("Input variable {0} is already bound")]
    InputRedeclared(String),

    /// The run was cancelled through its cancellation token.
    #[error("Analysis cancelled")]
    Cancelled,

    /// Writing diagnostics failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An error raised while processing the given program node.
    #[error("{source}\n  at {kind} #{node}")]
    At {
        node: NodeId,
        kind: &'static str,
        source: Box<Error>,
    },
}

impl Error {
    /// Wraps the error with the program node being processed.
    pub fn at(self, node: NodeId, kind: &'static str) -> Self {
        Error::At {
            node,
            kind,
            source: Box::new(self),
        }
    }

    /// The innermost error, without the node path.
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::At { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Chain of program nodes enclosing the failure, outermost first.
    pub fn path(&self) -> Vec<NodeId> {
        let mut path = Vec::new();
        let mut current = self;
        while let Error::At { node, source, .. } = current {
            path.push(*node);
            current = source;
        }
        path
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.root_cause(), Error::Cancelled)
    }
}

/// Attaches the enclosing program node to an error result.
pub(crate) trait ResultExt<T> {
    fn at(self, node: NodeId, kind: &'static str) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn at(self, node: NodeId, kind: &'static str) -> Result<T> {
        self.map_err(|e| e.at(node, kind))
    }
}
