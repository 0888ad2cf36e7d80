//! Records: the string-keyed mapping a data file holds.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use indexmap::IndexMap;
use thiserror::Error;
use tracing::debug;

use crate::error::{Error, Result};
use crate::image::Image;
use crate::pickle::{self, Value};

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;
    use crate::dtype::DType;
    use crate::image::Order;
    use crate::shape::Shape;

    fn text(s: &str) -> Value {
        Value::String(s.to_string())
    }

    fn array() -> Value {
        let dtype = DType::parse("u1").unwrap();
        let image = Image::new(dtype, Shape::from_dims(&[2]), Order::C, vec![1u8, 2]).unwrap();
        Value::Array(Rc::new(image))
    }

    #[test]
    fn keeps_key_order() {
        let record = Record::from_value(Value::Dict(vec![
            (text("z"), Value::Int(1)),
            (Value::Bytes(Rc::from(&b"a"[..])), Value::Int(2)),
        ]))
        .unwrap();
        assert_eq!(record.keys().collect::<Vec<_>>(), vec!["z", "a"]);
    }

    #[test]
    fn image_lookup() {
        let record = Record::from_value(Value::Dict(vec![
            (text("image"), array()),
            (text("label"), text("teapot")),
        ]))
        .unwrap();
        assert_eq!(record.image("image").unwrap().data(), &[1, 2]);
        assert_eq!(record.image("mask"), Err(RecordError::MissingField("mask".into())));
        assert_eq!(
            record.image("label"),
            Err(RecordError::NotAnArray {
                field: "label".into(),
                found: "str"
            })
        );
    }

    #[test]
    fn rejects_non_mappings() {
        assert_eq!(
            Record::from_value(Value::List(vec![])).unwrap_err(),
            RecordError::NotAMapping("list")
        );
        let err = Record::from_value(Value::Dict(vec![(Value::Int(1), Value::None)])).unwrap_err();
        assert_eq!(err, RecordError::NonStringKey("int"));
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum RecordError {
    #[error("expected a dict, found {0}")]
    NotAMapping(&'static str),
    #[error("record keys must be strings, found {0}")]
    NonStringKey(&'static str),
    #[error("no field \"{0}\"")]
    MissingField(String),
    #[error("field \"{field}\" holds {found}, not an array")]
    NotAnArray { field: String, found: &'static str },
}

/// The top-level mapping of a data file, in its original key order.
#[derive(Debug, Clone)]
pub struct Record {
    fields: IndexMap<String, Value>,
}

impl Record {
    /// Read and decode the record stored in `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Record> {
        let path = path.as_ref();
        let f = File::open(path).map_err(|source| Error::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let value = pickle::from_reader(BufReader::new(f)).map_err(|source| match source {
            pickle::PickleError::Io(source) => Error::Open {
                path: path.to_path_buf(),
                source,
            },
            source => Error::Decode {
                path: path.to_path_buf(),
                source,
            },
        })?;
        let record = Record::from_value(value).map_err(|source| Error::InvalidRecord {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), fields = record.len(), "loaded record");
        Ok(record)
    }

    pub fn from_value(value: Value) -> std::result::Result<Record, RecordError> {
        let pairs = match value {
            Value::Dict(pairs) => pairs,
            other => return Err(RecordError::NotAMapping(other.type_name())),
        };
        let mut fields = IndexMap::with_capacity(pairs.len());
        for (key, value) in pairs {
            let key = key
                .as_str()
                .ok_or_else(|| RecordError::NonStringKey(key.type_name()))?
                .to_string();
            fields.insert(key, value);
        }
        Ok(Record { fields })
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// The array stored under `field`.
    pub fn image(&self, field: &str) -> std::result::Result<&Image, RecordError> {
        let value = self
            .get(field)
            .ok_or_else(|| RecordError::MissingField(field.to_string()))?;
        value.as_array().ok_or_else(|| RecordError::NotAnArray {
            field: field.to_string(),
            found: value.type_name(),
        })
    }
}
