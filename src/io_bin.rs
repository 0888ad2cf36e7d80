use std::ffi::{OsStr, OsString};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};
use crate::image::{Element, Image};
use crate::shape::Shape;

/// suffix of the record files this tool consumes
pub const RECORD_SUFFIX: &str = ".pickle";
/// suffix of the raw dumps it produces
pub const BIN_SUFFIX: &str = ".bin";


/// Description of a raw dump, written next to it as JSON.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Header {
    pub shape: Shape,
    /// numpy descriptor with explicit byte order, e.g. `<f4`
    pub dtype: String,
    /// element order of the dump, always row-major
    pub order: String,
}

impl Header {
    pub fn for_image(image: &Image) -> Header {
        Header {
            shape: image.shape().clone(),
            dtype: image.dtype().descr(),
            order: String::from("C"),
        }
    }
}

/// Derive the dump path for a record file: a trailing `.pickle` becomes
/// `.bin`, anything else gets `.bin` appended.
pub fn bin_path(input: impl AsRef<Path>) -> PathBuf {
    let input = input.as_ref();
    if input.extension() == Some(OsStr::new(&RECORD_SUFFIX[1..])) {
        return input.with_extension(&BIN_SUFFIX[1..]);
    }
    // a bare `.pickle` is a stem without extension
    if input.file_name() == Some(OsStr::new(RECORD_SUFFIX)) {
        return input.with_file_name(BIN_SUFFIX);
    }
    let mut path = OsString::from(input.as_os_str());
    path.push(BIN_SUFFIX);
    PathBuf::from(path)
}

/// sidecar path for a dump: `<dump>.json`
pub fn header_path(bin: impl AsRef<Path>) -> PathBuf {
    let mut path = OsString::from(bin.as_ref().as_os_str());
    path.push(".json");
    PathBuf::from(path)
}

/// Write the image's elements row-major with no header, replacing any
/// existing file. Returns the number of bytes written.
pub fn write_bin(path: impl AsRef<Path>, image: &Image) -> Result<u64> {
    let path = path.as_ref();
    let bytes = image.row_major_bytes();
    fs::write(path, &bytes).map_err(|source| Error::Write {
        path: path.to_path_buf(),
        source,
    })?;
    info!(path = %path.display(), bytes = bytes.len(), "wrote raw array");
    Ok(bytes.len() as u64)
}

/// Read a raw dump of native-endian `T` with a known shape.
pub fn read_bin<T: Element>(path: impl AsRef<Path>, shape: &Shape) -> Result<ArrayD<T>> {
    let path = path.as_ref();
    let open_err = |source| Error::Open {
        path: path.to_path_buf(),
        source,
    };
    let bytes = fs::read(path).map_err(open_err)?;

    let invalid = |msg: String| open_err(io::Error::new(io::ErrorKind::InvalidData, msg));
    let numel = shape
        .checked_numel()
        .ok_or_else(|| invalid(format!("shape {shape} is too large")))?;
    let expected = numel
        .checked_mul(size_of::<T>())
        .ok_or_else(|| invalid(format!("shape {shape} is too large")))?;
    if bytes.len() != expected {
        return Err(invalid(format!(
            "expected {expected} bytes for shape {shape}, found {}",
            bytes.len()
        )));
    }

    let mut values = vec![T::zeroed(); numel];
    bytemuck::cast_slice_mut::<T, u8>(&mut values).copy_from_slice(&bytes);
    ArrayD::from_shape_vec(IxDyn(shape.dims()), values)
        .map_err(|e| invalid(e.to_string()))
}

pub fn write_header(path: impl AsRef<Path>, image: &Image) -> Result<()> {
    let path = path.as_ref();
    let json = serde_json::to_vec_pretty(&Header::for_image(image)).map_err(|source| Error::Header {
        path: path.to_path_buf(),
        source,
    })?;
    fs::write(path, json).map_err(|source| Error::Write {
        path: path.to_path_buf(),
        source,
    })?;
    info!(path = %path.display(), "wrote header");
    Ok(())
}

pub fn read_header(path: impl AsRef<Path>) -> Result<Header> {
    let path = path.as_ref();
    let json = fs::read(path).map_err(|source| Error::Open {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_slice(&json).map_err(|source| Error::Header {
        path: path.to_path_buf(),
        source,
    })
}
