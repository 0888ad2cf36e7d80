//! A restricted decoder for Python pickles.
//!
//! Pickles are programs for a small stack machine, and a full unpickler will
//! import and call whatever the stream names. This decoder never does: it
//! evaluates `REDUCE`/`BUILD` only for the handful of globals NumPy needs to
//! describe arrays and dtypes (see [`Global`]) and rejects everything else
//! with [`PickleError::UnsupportedGlobal`]. Input files are still expected to
//! come from a trusted source; the decoder only guarantees nothing is run.

use std::io::{self, BufRead};

use thiserror::Error;

use crate::dtype::DTypeError;
use crate::image::ImageError;

mod objects;
mod opcodes;
mod unpickler;
mod value;

pub use unpickler::Unpickler;
pub use value::{Global, Value};

#[derive(Debug, Error)]
pub enum PickleError {
    #[error("unexpected end of pickle data")]
    UnexpectedEof,
    #[error("failed to read pickle data")]
    Io(#[source] io::Error),
    #[error("unsupported pickle protocol {0}")]
    UnsupportedProtocol(u8),
    #[error("unknown opcode 0x{opcode:02x} at offset {offset}")]
    UnknownOpcode { opcode: u8, offset: u64 },
    #[error("opcode {name} at offset {offset} is not supported")]
    UnsupportedOpcode { name: &'static str, offset: u64 },
    #[error("refusing to load global {module}.{name}")]
    UnsupportedGlobal { module: String, name: String },
    #[error("pickle stack underflow at offset {0}")]
    StackUnderflow(u64),
    #[error("no mark on the pickle stack at offset {0}")]
    MissingMark(u64),
    #[error("pickle memo has no entry {0}")]
    MissingMemo(u32),
    #[error("integer does not fit in 64 bits")]
    IntegerOverflow,
    #[error("invalid text in pickle: {0}")]
    Encoding(String),
    #[error("malformed pickle: {0}")]
    Invalid(String),
    #[error(transparent)]
    DType(#[from] DTypeError),
    #[error(transparent)]
    Image(#[from] ImageError),
}

impl From<io::Error> for PickleError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof => PickleError::UnexpectedEof,
            _ => PickleError::Io(err),
        }
    }
}

/// Decode one pickled object from `reader`. Data after the `STOP` opcode is
/// left unread.
pub fn from_reader<R: BufRead>(reader: R) -> Result<Value, PickleError> {
    Unpickler::new(reader).load()
}

pub fn from_slice(data: &[u8]) -> Result<Value, PickleError> {
    from_reader(data)
}
