//! Driver library for the `lyrical` command-line interface.
//!
//! Ties the pipeline together: the preprocessor, the reference front-end,
//! the portable backend, the per-user compilation cache, and the
//! fork-per-connection HTTP server mode.

pub mod compile;
pub mod frontend;
pub mod server;
