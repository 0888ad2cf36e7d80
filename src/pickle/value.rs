use std::fmt;
use std::rc::Rc;

use crate::dtype::DType;
use crate::image::Image;

/// A decoded pickle object.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Bytes(Rc<[u8]>),
    String(String),
    Tuple(Vec<Value>),
    List(Vec<Value>),
    Set(Vec<Value>),
    /// key/value pairs in insertion order
    Dict(Vec<(Value, Value)>),
    /// reference to an allow-listed class or function
    Global(Global),
    /// instance made by an allow-listed constructor whose state was never set
    Object(Global),
    DType(DType),
    Array(Rc<Image>),
    /// numpy scalar, e.g. `np.float32(1.5)`
    Scalar { dtype: DType, data: Rc<[u8]> },
}

/// The classes and functions the decoder is willing to reference.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Global {
    /// `numpy.core.multiarray._reconstruct`
    Reconstruct,
    /// `numpy.ndarray`
    NdArray,
    /// `numpy.dtype`
    DType,
    /// `numpy.core.numeric._frombuffer`
    FromBuffer,
    /// `numpy.core.multiarray.scalar`
    Scalar,
    /// `_codecs.encode`
    CodecsEncode,
    /// `builtins.bytearray`
    ByteArray,
    /// `collections.OrderedDict`
    OrderedDict,
}

impl Global {
    /// Look up an allow-listed global by module and name.
    pub fn resolve(module: &str, name: &str) -> Option<Global> {
        let global = match (module, name) {
            ("numpy.core.multiarray" | "numpy._core.multiarray", "_reconstruct") => Global::Reconstruct,
            ("numpy.core.multiarray" | "numpy._core.multiarray", "scalar") => Global::Scalar,
            ("numpy.core.numeric" | "numpy._core.numeric", "_frombuffer") => Global::FromBuffer,
            ("numpy", "ndarray") => Global::NdArray,
            ("numpy", "dtype") => Global::DType,
            ("_codecs", "encode") => Global::CodecsEncode,
            ("builtins" | "__builtin__", "bytearray") => Global::ByteArray,
            ("collections", "OrderedDict") => Global::OrderedDict,
            _ => return None,
        };
        Some(global)
    }
}

impl fmt::Display for Global {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Global::Reconstruct => "numpy.core.multiarray._reconstruct",
            Global::NdArray => "numpy.ndarray",
            Global::DType => "numpy.dtype",
            Global::FromBuffer => "numpy.core.numeric._frombuffer",
            Global::Scalar => "numpy.core.multiarray.scalar",
            Global::CodecsEncode => "_codecs.encode",
            Global::ByteArray => "builtins.bytearray",
            Global::OrderedDict => "collections.OrderedDict",
        };
        f.write_str(name)
    }
}

impl Value {
    /// short python-ish name of the value's type, for error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "None",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Bytes(_) => "bytes",
            Value::String(_) => "str",
            Value::Tuple(_) => "tuple",
            Value::List(_) => "list",
            Value::Set(_) => "set",
            Value::Dict(_) => "dict",
            Value::Global(_) => "global",
            Value::Object(_) => "object",
            Value::DType(_) => "numpy.dtype",
            Value::Array(_) => "numpy.ndarray",
            Value::Scalar { .. } => "numpy scalar",
        }
    }

    /// Text content. Python 2 byte strings count when they are valid UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s.as_str()),
            Value::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Int(i) => Some(*i != 0),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(&b[..]),
            _ => None,
        }
    }

    /// items of a tuple or list
    pub fn as_seq(&self) -> Option<&[Value]> {
        match self {
            Value::Tuple(items) | Value::List(items) => Some(items.as_slice()),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Image> {
        match self {
            Value::Array(image) => Some(&**image),
            _ => None,
        }
    }
}
