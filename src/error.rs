//! Error types.

use std::io;

/// A single data line could not be turned into a record.
#[derive(thiserror::Error, Debug)]
pub enum LineError {
    #[error("expected {expected} fields, found {found}")]
    FieldCountMismatch { expected: usize, found: usize },

    #[error("invalid value \"{value}\" for field {field}: {reason}")]
    FieldValueInvalid {
        field: &'static str,
        value: String,
        reason: String,
    },
}

/// A failure reported while reading sources. None of these stop the run.
#[derive(thiserror::Error, Debug)]
pub enum ReadError {
    /// The source has no `#Fields` directive before its first data line; the
    /// whole source is skipped.
    #[error("{name}: no #Fields directive before the first data line")]
    MissingFieldMapping { name: String },

    /// One line is skipped.
    #[error("{name}:{line}: {error}")]
    Line {
        name: String,
        line: usize,
        #[source]
        error: LineError,
    },

    /// The rest of the source is skipped.
    #[error("{name}: {error}")]
    Io {
        name: String,
        #[source]
        error: io::Error,
    },
}

/// Terminal aggregation failures.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum StatsError {
    #[error("no log entries to aggregate")]
    EmptyInput,

    #[error("unknown resolution \"{0}\", expected one of: second, minute, quarter-hour, hour, day, week")]
    UnknownResolution(String),
}
