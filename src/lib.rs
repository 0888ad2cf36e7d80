/*
    Conversion of pickled NumPy records to headerless raw arrays
    A record is a pickled dict whose "image" field holds an ndarray. The array is decoded
    without executing anything from the file and written out row-major, element for element
 */
pub mod convert;
pub mod dtype;
pub mod error;
pub mod image;
pub mod io_bin;
pub mod pickle;
pub mod record;
pub mod shape;

pub use convert::{convert, Conversion, ConvertOptions};
pub use dtype::DType;
pub use error::{Error, ErrorKind, Result};
pub use image::{Image, Order};
pub use record::Record;
pub use shape::Shape;
