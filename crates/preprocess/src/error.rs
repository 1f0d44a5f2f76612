//! Define the `Location`, `Error`, and `Result` types.
//!
//! Every preprocessor diagnostic carries the position of the offending token
//! in the file that was being scanned when it was raised, plus the include
//! backtrace reconstructed from the stack of files still being included.

use std::fmt;
use std::path::PathBuf;

/// The location of a token or error within a source file.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Location {
    /// Path of the file being preprocessed. Empty for the top-level
    /// driver-synthesized source.
    pub path: PathBuf,
    /// 1-based line number.
    pub line: u32,
    /// 1-based byte column within the line.
    pub column: u32,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}:{}", self.path.display(), self.line, self.column)
    }
}

/// A preprocessing error with full provenance.
#[derive(Debug)]
pub struct Error {
    /// Where the offending token starts.
    pub location: Location,
    /// Error message. May be empty for the `abort` directive, where the
    /// location itself is the diagnostic.
    pub message: String,
    /// One `path:line` entry per include frame that was still open,
    /// innermost first.
    pub included_from: Vec<String>,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.location, self.message)?;
        for origin in &self.included_from {
            write!(f, "\n\tincluded from {origin}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {}

/// Result of a preprocessor operation.
pub type Result<T> = std::result::Result<T, Error>;
