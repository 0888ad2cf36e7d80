//! Error types for pickle-array.

use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::pickle::PickleError;
use crate::record::RecordError;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pickle;

    #[test]
    fn chain_names_each_cause_once() {
        let source = pickle::from_slice(b"x").unwrap_err();
        let err = Error::Decode {
            path: PathBuf::from("bad.pickle"),
            source,
        };
        assert_eq!(err.to_string(), "failed to deserialize bad.pickle");
        assert_eq!(
            format!("{:#}", anyhow::Error::new(err)),
            "failed to deserialize bad.pickle: unknown opcode 0x78 at offset 0"
        );

        let err = Error::Write {
            path: PathBuf::from("out.bin"),
            source: io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        };
        assert_eq!(format!("{:#}", anyhow::Error::new(err)), "failed to write out.bin: denied");
    }

    #[test]
    fn kinds() {
        let err = Error::MissingField {
            path: PathBuf::from("a.pickle"),
            field: "image".into(),
        };
        assert_eq!(err.kind(), ErrorKind::MissingField);
        assert_eq!(err.kind().to_string(), "field lookup");
        assert_eq!(Error::Report(io::ErrorKind::BrokenPipe.into()).kind(), ErrorKind::Write);
    }
}

/// Main error type for the conversion.
#[derive(Error, Debug)]
pub enum Error {
    /// Failed to open or read the input file.
    #[error("failed to read {path}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The input is not a pickle the decoder accepts.
    #[error("failed to deserialize {path}")]
    Decode {
        path: PathBuf,
        #[source]
        source: PickleError,
    },

    /// The pickle decoded, but not into a record.
    #[error("invalid record in {path}")]
    InvalidRecord {
        path: PathBuf,
        #[source]
        source: RecordError,
    },

    /// The record has no field with the requested name.
    #[error("record in {path} has no field \"{field}\"")]
    MissingField { path: PathBuf, field: String },

    /// Failed to write the raw dump.
    #[error("failed to write {path}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The header sidecar could not be encoded or parsed.
    #[error("invalid header {path}")]
    Header {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Failed to report progress on the output stream.
    #[error("failed to report shape")]
    Report(#[source] io::Error),
}

/// The step of the conversion an [`Error`] belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Deserialization,
    MissingField,
    Write,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Open { .. } | Error::Decode { .. } | Error::InvalidRecord { .. } => ErrorKind::Deserialization,
            Error::MissingField { .. } => ErrorKind::MissingField,
            Error::Write { .. } | Error::Header { .. } | Error::Report(_) => ErrorKind::Write,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let step = match self {
            ErrorKind::Deserialization => "deserialization",
            ErrorKind::MissingField => "field lookup",
            ErrorKind::Write => "write",
        };
        f.write_str(step)
    }
}

/// Result type alias for pickle-array operations.
pub type Result<T> = std::result::Result<T, Error>;
