//! NumPy element type descriptors such as `f4`, `<i8` or `c16`.

use std::fmt;
use thiserror::Error;


#[derive(Debug, Error, PartialEq, Eq)]
pub enum DTypeError {
    #[error("empty dtype descriptor")]
    Empty,
    #[error("unknown dtype kind '{0}'")]
    UnknownKind(char),
    #[error("invalid dtype size in \"{0}\"")]
    BadSize(String),
    #[error("invalid byte order '{0}'")]
    BadByteOrder(char),
    #[error("object arrays hold python references, not raw data")]
    Object,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Kind {
    Bool,
    Int,
    UInt,
    Float,
    Complex,
    /// opaque fixed-size records
    Void,
    Bytes,
    /// UCS-4 text
    Unicode,
    DateTime,
    TimeDelta,
}

impl Kind {
    fn code(self) -> char {
        match self {
            Kind::Bool => 'b',
            Kind::Int => 'i',
            Kind::UInt => 'u',
            Kind::Float => 'f',
            Kind::Complex => 'c',
            Kind::Void => 'V',
            Kind::Bytes => 'S',
            Kind::Unicode => 'U',
            Kind::DateTime => 'M',
            Kind::TimeDelta => 'm',
        }
    }

    fn from_code(c: char) -> Result<Kind, DTypeError> {
        Ok(match c {
            'b' | '?' => Kind::Bool,
            'i' => Kind::Int,
            'u' => Kind::UInt,
            'f' => Kind::Float,
            'c' => Kind::Complex,
            'V' => Kind::Void,
            'S' | 'a' => Kind::Bytes,
            'U' => Kind::Unicode,
            'M' => Kind::DateTime,
            'm' => Kind::TimeDelta,
            'O' => return Err(DTypeError::Object),
            other => return Err(DTypeError::UnknownKind(other)),
        })
    }

    /// whether elements of this kind are stored with a byte order
    fn has_byte_order(self, itemsize: usize) -> bool {
        match self {
            Kind::Bool | Kind::Void | Kind::Bytes => false,
            _ => itemsize > 1,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ByteOrder {
    Little,
    Big,
    /// single bytes and opaque data
    NotApplicable,
}

impl ByteOrder {
    pub fn native() -> ByteOrder {
        if cfg!(target_endian = "big") {
            ByteOrder::Big
        } else {
            ByteOrder::Little
        }
    }

    fn from_char(c: char) -> Result<ByteOrder, DTypeError> {
        match c {
            '<' => Ok(ByteOrder::Little),
            '>' => Ok(ByteOrder::Big),
            '=' => Ok(ByteOrder::native()),
            '|' => Ok(ByteOrder::NotApplicable),
            other => Err(DTypeError::BadByteOrder(other)),
        }
    }

    fn as_char(self) -> char {
        match self {
            ByteOrder::Little => '<',
            ByteOrder::Big => '>',
            ByteOrder::NotApplicable => '|',
        }
    }
}

/// Element type of an array: what the bytes mean, how many there are per
/// element and in which order they are stored.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DType {
    kind: Kind,
    itemsize: usize,
    byte_order: ByteOrder,
}

impl DType {
    /// Parse a descriptor such as `f4`, `<i8`, `|u1` or `U10`. Without a
    /// byte-order prefix multi-byte types are taken as native.
    pub fn parse(descr: &str) -> Result<DType, DTypeError> {
        let mut chars = descr.chars();
        let mut first = chars.next().ok_or(DTypeError::Empty)?;

        let order = match first {
            '<' | '>' | '=' | '|' => {
                let order = first;
                first = chars.next().ok_or(DTypeError::Empty)?;
                Some(order)
            }
            _ => None,
        };
        let kind = Kind::from_code(first)?;

        // datetime descriptors carry their unit, e.g. M8[ns]
        let rest = chars.as_str();
        let digits = rest.split('[').next().unwrap_or_default();
        let count: usize = digits
            .parse()
            .map_err(|_| DTypeError::BadSize(descr.to_string()))?;

        let itemsize = match kind {
            Kind::Unicode => count
                .checked_mul(4)
                .ok_or_else(|| DTypeError::BadSize(descr.to_string()))?,
            _ => count,
        };
        let valid = match kind {
            Kind::Bool => itemsize == 1,
            Kind::Int | Kind::UInt => matches!(itemsize, 1 | 2 | 4 | 8),
            Kind::Float => matches!(itemsize, 2 | 4 | 8 | 16),
            Kind::Complex => matches!(itemsize, 8 | 16 | 32),
            Kind::DateTime | Kind::TimeDelta => itemsize == 8,
            Kind::Void | Kind::Bytes | Kind::Unicode => itemsize > 0,
        };
        if !valid {
            return Err(DTypeError::BadSize(descr.to_string()));
        }

        let byte_order = if kind.has_byte_order(itemsize) {
            match order {
                Some(c) => ByteOrder::from_char(c)?,
                None => ByteOrder::native(),
            }
        } else {
            ByteOrder::NotApplicable
        };

        Ok(DType {
            kind,
            itemsize,
            byte_order,
        })
    }

    /// Apply a byte-order character as stored in a pickled dtype's state.
    pub fn with_byte_order(mut self, order: char) -> Result<DType, DTypeError> {
        let order = ByteOrder::from_char(order)?;
        if self.kind.has_byte_order(self.itemsize) {
            self.byte_order = order;
        }
        Ok(self)
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    /// bytes per element
    pub fn itemsize(&self) -> usize {
        self.itemsize
    }

    pub fn byte_order(&self) -> ByteOrder {
        self.byte_order
    }

    pub fn is_native_endian(&self) -> bool {
        self.byte_order == ByteOrder::NotApplicable || self.byte_order == ByteOrder::native()
    }

    /// descriptor with an explicit byte order, e.g. `<f4`
    pub fn descr(&self) -> String {
        let count = match self.kind {
            Kind::Unicode => self.itemsize / 4,
            _ => self.itemsize,
        };
        format!("{}{}{}", self.byte_order.as_char(), self.kind.code(), count)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.descr())
    }
}
