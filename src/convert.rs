//! Record-to-raw conversion.

use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::io_bin::{bin_path, header_path, write_bin, write_header};
use crate::record::{Record, RecordError};
use crate::shape::Shape;

/// field holding the array in the records this tool was made for
pub const DEFAULT_FIELD: &str = "image";

#[derive(Clone, Debug)]
pub struct ConvertOptions {
    /// record field holding the array
    pub field: String,
    /// dump path, derived from the input path when unset
    pub output: Option<PathBuf>,
    /// also write a JSON header next to the dump
    pub write_header: bool,
}

impl Default for ConvertOptions {
    fn default() -> Self {
        ConvertOptions {
            field: DEFAULT_FIELD.to_string(),
            output: None,
            write_header: false,
        }
    }
}

/// What a successful conversion produced.
#[derive(Clone, Debug)]
pub struct Conversion {
    pub shape: Shape,
    pub dtype: DType,
    pub output: PathBuf,
    pub bytes_written: u64,
    pub header: Option<PathBuf>,
}

/// Read the record in `input`, report the shape of its array on `out` as
/// `Shape: (d0, d1, ..)` and dump the elements row-major to the output path.
///
/// Nothing is written to disk unless the record decodes and holds an array.
pub fn convert(input: impl AsRef<Path>, options: &ConvertOptions, out: &mut impl Write) -> Result<Conversion> {
    let input = input.as_ref();

    let record = Record::open(input)?;
    let image = record.image(&options.field).map_err(|source| match source {
        RecordError::MissingField(field) => Error::MissingField {
            path: input.to_path_buf(),
            field,
        },
        source => Error::InvalidRecord {
            path: input.to_path_buf(),
            source,
        },
    })?;
    debug!(field = %options.field, dtype = %image.dtype(), order = ?image.order(), "found array");

    writeln!(out, "Shape: {}", image.shape()).map_err(Error::Report)?;

    let output = match &options.output {
        Some(path) => path.clone(),
        None => bin_path(input),
    };
    let bytes_written = write_bin(&output, image)?;

    let header = if options.write_header {
        let path = header_path(&output);
        write_header(&path, image)?;
        Some(path)
    } else {
        None
    };

    Ok(Conversion {
        shape: image.shape().clone(),
        dtype: image.dtype(),
        output,
        bytes_written,
        header,
    })
}
