// REDUCE and BUILD for the allow-listed globals.

use std::rc::Rc;

use crate::dtype::DType;
use crate::image::{Image, Order};
use crate::shape::Shape;

use super::{Global, PickleError, Value};


fn invalid(reason: impl Into<String>) -> PickleError {
    PickleError::Invalid(reason.into())
}

/// Apply `global` to `args`, as `REDUCE` and `NEWOBJ` do.
pub(super) fn call(global: Global, args: Value) -> Result<Value, PickleError> {
    let args = match args {
        Value::Tuple(items) => items,
        other => return Err(invalid(format!("{global} called with {} instead of a tuple", other.type_name()))),
    };

    match global {
        Global::Reconstruct => match args.first() {
            Some(Value::Global(Global::NdArray)) => Ok(Value::Object(Global::NdArray)),
            _ => Err(invalid("_reconstruct only builds numpy.ndarray")),
        },
        Global::DType => {
            let descr = args
                .first()
                .and_then(Value::as_str)
                .ok_or_else(|| invalid("numpy.dtype needs a descriptor string"))?;
            Ok(Value::DType(DType::parse(descr)?))
        }
        Global::FromBuffer => match args.as_slice() {
            [buffer, Value::DType(dtype), shape, order] => {
                let data = match buffer {
                    Value::Bytes(data) => data.clone(),
                    other => return Err(invalid(format!("_frombuffer got {} instead of a buffer", other.type_name()))),
                };
                let order = match order.as_str() {
                    Some("C") => Order::C,
                    Some("F") => Order::Fortran,
                    _ => return Err(invalid("_frombuffer order must be 'C' or 'F'")),
                };
                let image = Image::new(*dtype, shape_from(shape)?, order, data)?;
                Ok(Value::Array(Rc::new(image)))
            }
            _ => Err(invalid("_frombuffer expects (buffer, dtype, shape, order)")),
        },
        Global::Scalar => match args.as_slice() {
            [Value::DType(dtype), data] => {
                let data = data
                    .as_bytes()
                    .ok_or_else(|| invalid("numpy scalar without raw data"))?;
                if data.len() != dtype.itemsize() {
                    return Err(invalid(format!("{} byte scalar for dtype {dtype}", data.len())));
                }
                Ok(Value::Scalar {
                    dtype: *dtype,
                    data: Rc::from(data),
                })
            }
            _ => Err(invalid("numpy scalar expects (dtype, data)")),
        },
        Global::CodecsEncode => match args.as_slice() {
            [Value::String(text), encoding] => Ok(Value::Bytes(encode(text, encoding)?.into())),
            _ => Err(invalid("_codecs.encode expects (str, encoding)")),
        },
        Global::ByteArray => match args.as_slice() {
            [] => Ok(Value::Bytes(Rc::from(&b""[..]))),
            [Value::Bytes(data)] => Ok(Value::Bytes(data.clone())),
            [Value::String(text), encoding] => Ok(Value::Bytes(encode(text, encoding)?.into())),
            _ => Err(invalid("unsupported bytearray arguments")),
        },
        Global::OrderedDict => match args.as_slice() {
            [] => Ok(Value::Dict(vec![])),
            [pairs] => {
                let pairs = pairs
                    .as_seq()
                    .ok_or_else(|| invalid("OrderedDict expects a sequence of pairs"))?;
                let mut dict = Value::Dict(vec![]);
                for pair in pairs {
                    match pair.as_seq() {
                        Some([k, v]) => set_item(&mut dict, k.clone(), v.clone())?,
                        _ => return Err(invalid("OrderedDict item is not a pair")),
                    }
                }
                Ok(dict)
            }
            _ => Err(invalid("unsupported OrderedDict arguments")),
        },
        Global::NdArray => Err(invalid("numpy.ndarray cannot be called directly")),
    }
}

/// Set the state of `target`, as `BUILD` does.
pub(super) fn build(target: &mut Value, state: Value) -> Result<(), PickleError> {
    match target {
        Value::Object(Global::NdArray) => {
            let image = array_from_state(&state)?;
            *target = Value::Array(Rc::new(image));
            Ok(())
        }
        Value::DType(dtype) => {
            // (version, byteorder, subarray, names, fields, elsize, alignment, flags)
            let order = state
                .as_seq()
                .and_then(|items| items.get(1))
                .and_then(Value::as_str)
                .and_then(|s| s.chars().next());
            if let Some(order) = order {
                *dtype = dtype.with_byte_order(order)?;
            }
            Ok(())
        }
        // OrderedDict instances may carry an empty attribute dict
        Value::Dict(_) if matches!(&state, Value::None) => Ok(()),
        Value::Dict(_) if matches!(&state, Value::Dict(attrs) if attrs.is_empty()) => Ok(()),
        other => Err(invalid(format!("cannot set the state of {}", other.type_name()))),
    }
}

/// Insert into a dict, replacing an equal key like python does.
pub(super) fn set_item(dict: &mut Value, key: Value, value: Value) -> Result<(), PickleError> {
    let pairs = match dict {
        Value::Dict(pairs) => pairs,
        other => return Err(invalid(format!("cannot set items on {}", other.type_name()))),
    };
    match pairs.iter_mut().find(|(k, _)| *k == key) {
        Some((_, v)) => *v = value,
        None => pairs.push((key, value)),
    }
    Ok(())
}

/// ndarray state: `(version, shape, dtype, is_fortran, rawdata)` or the
/// legacy form without the version.
fn array_from_state(state: &Value) -> Result<Image, PickleError> {
    let items = state
        .as_seq()
        .ok_or_else(|| invalid("ndarray state is not a tuple"))?;
    let (shape, dtype, fortran, raw) = match items {
        [_, shape, dtype, fortran, raw] | [shape, dtype, fortran, raw] => (shape, dtype, fortran, raw),
        _ => return Err(invalid(format!("ndarray state has {} items", items.len()))),
    };

    let Value::DType(dtype) = dtype else {
        return Err(invalid(format!("ndarray dtype is a {}", dtype.type_name())));
    };
    let order = match fortran.as_bool() {
        Some(true) => Order::Fortran,
        Some(false) => Order::C,
        None => return Err(invalid("ndarray fortran flag is not a bool")),
    };
    let data = match raw {
        Value::Bytes(data) => data.clone(),
        Value::List(_) => return Err(invalid("object arrays are not supported")),
        other => return Err(invalid(format!("ndarray data is a {}", other.type_name()))),
    };

    Ok(Image::new(*dtype, shape_from(shape)?, order, data)?)
}

fn shape_from(value: &Value) -> Result<Shape, PickleError> {
    let items = value
        .as_seq()
        .ok_or_else(|| invalid(format!("array shape is a {}", value.type_name())))?;
    let dims = items
        .iter()
        .map(|d| match d {
            Value::Int(n) => usize::try_from(*n).map_err(|_| invalid(format!("negative dimension {n}"))),
            other => Err(invalid(format!("dimension is a {}", other.type_name()))),
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Shape::from(dims))
}

/// `str.encode` for the single-byte encodings python uses to smuggle bytes.
fn encode(text: &str, encoding: &Value) -> Result<Vec<u8>, PickleError> {
    match encoding.as_str() {
        Some("latin1" | "latin-1" | "iso-8859-1") => text
            .chars()
            .map(|c| u8::try_from(c).map_err(|_| PickleError::Encoding(format!("'{c}' is not latin-1"))))
            .collect(),
        Some("ascii") if text.is_ascii() => Ok(text.as_bytes().to_vec()),
        Some("utf-8" | "utf8") => Ok(text.as_bytes().to_vec()),
        _ => Err(invalid("unsupported encoding for _codecs.encode")),
    }
}
