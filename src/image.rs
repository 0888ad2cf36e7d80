//! The n-dimensional array carried in a record.

use std::borrow::Cow;
use std::rc::Rc;

use bytemuck::Pod;
use ndarray::{ArrayD, ArrayView, IxDyn, ShapeBuilder};
use num_complex::{Complex32, Complex64};
use thiserror::Error;

use crate::dtype::{DType, Kind};
use crate::shape::Shape;


#[derive(Debug, Error)]
pub enum ImageError {
    #[error("array of shape {shape} and dtype {dtype} needs {expected} bytes, got {actual}")]
    SizeMismatch {
        shape: Shape,
        dtype: DType,
        expected: usize,
        actual: usize,
    },
    #[error("array of shape {0} is too large")]
    TooLarge(Shape),
    #[error("cannot read {dtype} elements as {requested}")]
    TypeMismatch { dtype: DType, requested: &'static str },
}

/// Memory order of the stored element bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Order {
    /// row-major, last axis fastest
    C,
    /// column-major, first axis fastest
    Fortran,
}

/// An array as stored: element type, shape, memory order and the raw bytes.
#[derive(Clone, Debug, PartialEq)]
pub struct Image {
    dtype: DType,
    shape: Shape,
    order: Order,
    data: Rc<[u8]>,
}

impl Image {
    pub fn new(dtype: DType, shape: Shape, order: Order, data: impl Into<Rc<[u8]>>) -> Result<Image, ImageError> {
        let data = data.into();
        let expected = shape
            .checked_numel()
            .and_then(|n| n.checked_mul(dtype.itemsize()))
            .ok_or_else(|| ImageError::TooLarge(shape.clone()))?;
        if data.len() != expected {
            return Err(ImageError::SizeMismatch {
                shape,
                dtype,
                expected,
                actual: data.len(),
            });
        }
        Ok(Image { dtype, shape, order, data })
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn order(&self) -> Order {
        self.order
    }

    /// element bytes in their stored order
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn nbytes(&self) -> usize {
        self.data.len()
    }

    /// Element bytes in row-major order. Borrowed when the stored layout
    /// already is row-major.
    pub fn row_major_bytes(&self) -> Cow<'_, [u8]> {
        if self.order == Order::C || self.shape.ndim() <= 1 {
            return Cow::Borrowed(&self.data[..]);
        }
        // view the buffer as [itemsize, d0, .., dn] column-major, then move the
        // byte axis last so logical iteration yields whole elements in C order
        let mut dims = Vec::with_capacity(self.shape.ndim() + 1);
        dims.push(self.dtype.itemsize());
        dims.extend_from_slice(self.shape.dims());
        let mut axes: Vec<usize> = (1..dims.len()).collect();
        axes.push(0);

        match ArrayView::from_shape(IxDyn(&dims).f(), &self.data[..]) {
            Ok(view) => Cow::Owned(view.permuted_axes(IxDyn(&axes)).iter().copied().collect()),
            // the length was validated on construction
            Err(_) => unreachable!("image buffer does not match its shape"),
        }
    }

    /// Copy the image into an `ndarray` of `T`, converting to native byte order.
    pub fn to_array<T: Element>(&self) -> Result<ArrayD<T>, ImageError> {
        if T::KIND != self.dtype.kind() || std::mem::size_of::<T>() != self.dtype.itemsize() {
            return Err(ImageError::TypeMismatch {
                dtype: self.dtype,
                requested: std::any::type_name::<T>(),
            });
        }

        let mut bytes = self.row_major_bytes().into_owned();
        if !self.dtype.is_native_endian() {
            let unit = match T::KIND {
                Kind::Complex => self.dtype.itemsize() / 2,
                _ => self.dtype.itemsize(),
            };
            bytes.chunks_exact_mut(unit).for_each(|c| c.reverse());
        }

        let mut values = vec![T::zeroed(); self.shape.numel()];
        bytemuck::cast_slice_mut::<T, u8>(&mut values).copy_from_slice(&bytes);
        let arr = ArrayD::from_shape_vec(IxDyn(self.shape.dims()), values)
            .map_err(|_| ImageError::TooLarge(self.shape.clone()))?;
        Ok(arr)
    }
}

/// Rust element types that can mirror a NumPy dtype.
pub trait Element: Pod {
    const KIND: Kind;
}

macro_rules! impl_element {
    ($kind:expr => $($t:ty),*) => {
        $(impl Element for $t {
            const KIND: Kind = $kind;
        })*
    };
}

impl_element!(Kind::Int => i8, i16, i32, i64);
impl_element!(Kind::UInt => u8, u16, u32, u64);
impl_element!(Kind::Float => f32, f64);
impl_element!(Kind::Complex => Complex32, Complex64);
