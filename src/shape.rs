use std::fmt;

use serde::{Deserialize, Serialize};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn python_tuple_formatting() {
        assert_eq!(Shape::from_dims(&[50, 50, 3]).to_string(), "(50, 50, 3)");
        assert_eq!(Shape::from_dims(&[5]).to_string(), "(5,)");
        assert_eq!(Shape::scalar().to_string(), "()");
    }

    #[test]
    fn numel() {
        assert_eq!(Shape::from_dims(&[2, 3, 4]).numel(), 24);
        assert_eq!(Shape::from_dims(&[2, 0, 4]).numel(), 0);
        // 0-d arrays hold a single element
        assert_eq!(Shape::scalar().numel(), 1);
    }

    #[test]
    fn strides() {
        let shape = Shape::from_dims(&[2, 3, 4]);
        assert_eq!(shape.c_strides(), vec![12, 4, 1]);
        assert_eq!(shape.f_strides(), vec![1, 2, 6]);
    }

    #[test]
    fn c_strides_address_last_axis_fastest() {
        let shape = Shape::from_dims(&[3, 4]);
        let strides = shape.c_strides();
        let addr: usize = [2, 1].iter().zip(&strides).map(|(i, s)| i * s).sum();
        assert_eq!(addr, 9);
    }
}

/// Dimension sizes of an n-dimensional array, outermost axis first.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Shape {
    dims: Vec<usize>,
}

impl Shape {
    pub fn from_dims(dims: &[usize]) -> Shape {
        Shape { dims: dims.to_vec() }
    }

    /// shape of a 0-d array
    pub fn scalar() -> Shape {
        Shape { dims: vec![] }
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn ndim(&self) -> usize {
        self.dims.len()
    }

    pub fn numel(&self) -> usize {
        self.dims.iter().product()
    }

    /// number of elements, or None if it does not fit in a usize
    pub fn checked_numel(&self) -> Option<usize> {
        self.dims.iter().try_fold(1usize, |n, &d| n.checked_mul(d))
    }

    /// element strides for row-major (C) layout, where the last axis varies fastest
    pub fn c_strides(&self) -> Vec<usize> {
        let mut strides = vec![1; self.dims.len()];
        let mut stride = 1;
        for (s, d) in strides.iter_mut().zip(self.dims.iter()).rev() {
            *s = stride;
            stride *= d;
        }
        strides
    }

    /// element strides for column-major (Fortran) layout, where the first axis varies fastest
    pub fn f_strides(&self) -> Vec<usize> {
        let mut strides = vec![1; self.dims.len()];
        let mut stride = 1;
        for (s, d) in strides.iter_mut().zip(self.dims.iter()) {
            *s = stride;
            stride *= d;
        }
        strides
    }
}

impl From<Vec<usize>> for Shape {
    fn from(dims: Vec<usize>) -> Shape {
        Shape { dims }
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.dims.as_slice() {
            [] => write!(f, "()"),
            [d] => write!(f, "({d},)"),
            [first, rest @ ..] => {
                write!(f, "({first}")?;
                for d in rest {
                    write!(f, ", {d}")?;
                }
                write!(f, ")")
            }
        }
    }
}
