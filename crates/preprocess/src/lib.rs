//! Preprocessor for the Lyrical language.
//!
//! The preprocessor consumes a source buffer and produces a circular list
//! of [`chunk::Chunk`]s, each binding a run of produced text to its
//! provenance. It handles `` `include `` (files and deduplicated modules),
//! `` `define ``/`` `locdef ``/`` `enddef ``/`` `undef `` macros,
//! `` `ifdef ``-family conditionals, `` `foreach `` loop templating,
//! `` `abort ``, `FILE`/`LINE` substitution, `#{ … }#` nested comments,
//! `_` token pasting, and the `.lyx` dual text/code format with
//! `<% … %>` code blocks and `$name` interpolation.
//!
//! The concatenation of all chunk contents in forward order is the final
//! preprocessed source handed to the compiler front-end; per-offset chunk
//! metadata is preserved for error reporting.

pub mod chunk;
pub mod error;
pub mod macros;
pub mod preprocessor;
pub mod scan;

pub use chunk::{Chunk, ChunkId, ChunkStore};
pub use error::{Error, Location, Result};
pub use preprocessor::{
    preprocess, InstallModuleHook, Preprocessed, PredeclaredMacro, PreprocessConfig,
    EXPORT_SCOPE_CLOSE, EXPORT_SCOPE_OPEN,
};
pub use scan::{Scanner, StringMode, Symbol};
