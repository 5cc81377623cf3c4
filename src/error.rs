//! Error taxonomy for every fallible boundary in the crate.
//!
//! Each enum below corresponds to one of the boundaries described in the design: building a
//! configuration, parsing a record line, talking to the filesystem, and the engine's own public
//! operations (which wrap the other three as sources).

use std::io;
use std::path::PathBuf;

use snafu::Snafu;

/// Errors returned while validating an [`crate::config::EngineConfigBuilder`].
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum BuildError {
    #[snafu(display("parameter '{param_name}' was invalid: {reason}"))]
    InvalidParameter {
        param_name: &'static str,
        reason: String,
    },
}

/// Errors raised while encoding or decoding a single block line.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CodecError {
    #[snafu(display("block '{bid}' line {line_no}: line is empty"))]
    EmptyLine { bid: String, line_no: u64 },

    #[snafu(display("block '{bid}' line {line_no}: invalid record ({cause})"))]
    InvalidRecord {
        bid: String,
        line_no: u64,
        cause: String,
    },
}

/// Errors raised by the directory-scoped storage backend.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StorageError {
    #[snafu(display("I/O error on block '{bid}': {source}"))]
    Block { bid: String, source: io::Error },

    #[snafu(display("I/O error at '{}': {source}", path.display()))]
    Path { path: PathBuf, source: io::Error },
}

/// The engine's public error type, covering every operation in [`crate::Engine`].
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum EngineError {
    /// Operation attempted after the engine was closed, or before it finished opening.
    #[snafu(display("engine is not open"))]
    NotOpen,

    /// `id` was empty or otherwise not a legal identifier.
    #[snafu(display("invalid id"))]
    InvalidId,

    /// A configuration option failed validation.
    #[snafu(display("invalid option: {source}"))]
    InvalidOption { source: BuildError },

    /// A stored line failed to parse into a well-formed record.
    #[snafu(display("invalid record: {source}"))]
    InvalidRecord { source: CodecError },

    /// A stored line was empty.
    #[snafu(display("empty line: {source}"))]
    EmptyLine { source: CodecError },

    /// An invariant was violated at runtime; this indicates a bug, not bad input.
    #[snafu(display("internal corruption: {reason}"))]
    InternalCorruption { reason: String },

    /// The underlying filesystem failed in a way that could not be locally recovered from.
    #[snafu(display("I/O error: {source}"))]
    Io { source: StorageError },
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;
