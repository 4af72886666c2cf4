use std::io;

use thiserror::Error;

/// `Result` alias which automatically uses `ShellError` as the error type.
pub type Result<T> = std::result::Result<T, ShellError>;

/// Enum representing every type of error which can occur in the shell core.
///
/// Parse problems are deliberately absent: a bad parse yields a `SyntaxError`
/// node embedded in the AST, so completion and highlighting keep working on
/// broken input and the session reports the error itself.
#[derive(Error, Debug)]
pub enum ShellError {
    /// `open()` failed while resolving a path redirection.
    #[error("cannot open '{path}': {source}")]
    Redirection { path: String, source: io::Error },
    #[error("pipe() failed: {0}")]
    PipeFailed(io::Error),
    #[error("fork() failed: {0}")]
    ForkFailed(io::Error),
    #[error("dup2() failed: {0}")]
    RewiringFailed(io::Error),
    #[error("no such job: {0}")]
    UnknownJob(String),
    #[error("unknown option: {0}")]
    UnknownOption(String),
    /// A builtin rejected its arguments or failed partway through.
    #[error("{0}")]
    Builtin(String),
    #[error("could not read '{path}': {source}")]
    ScriptUnreadable { path: String, source: io::Error },
    #[error("line editor failure: {0}")]
    Editor(String),
}
