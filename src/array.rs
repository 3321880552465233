//! Typed in-memory buffers.
//!
//! `Array` is the one concrete buffer type the engine reads into and
//! writes from: a dtype plus a flat byte vector, always a whole number of
//! records long.  Callers with richer numeric containers adapt them at
//! this seam; the engine itself never sees anything but dtypes and bytes.

use crate::dtype::{Dtype, Endian, Kind};
use crate::error::BigFileError;

// ── Scalar trait ────────────────────────────────────────────────────

/// Rust scalar types that map onto a dtype.  `put`/`get` move values
/// through native-order bytes; `Array` handles any byte swapping.
pub trait Scalar: Copy {
    fn dtype() -> Dtype;
    fn put(self, out: &mut Vec<u8>);
    fn get(bytes: &[u8]) -> Self;
}

macro_rules! impl_scalar {
    ($ty:ty, $kind:expr) => {
        impl Scalar for $ty {
            fn dtype() -> Dtype {
                Dtype::new(Endian::Native, $kind, size_of::<$ty>() as u32)
            }
            fn put(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_ne_bytes());
            }
            fn get(bytes: &[u8]) -> Self {
                <$ty>::from_ne_bytes(bytes.try_into().expect("scalar width"))
            }
        }
    };
}

impl_scalar!(i8, Kind::Int);
impl_scalar!(i16, Kind::Int);
impl_scalar!(i32, Kind::Int);
impl_scalar!(i64, Kind::Int);
impl_scalar!(u8, Kind::Uint);
impl_scalar!(u16, Kind::Uint);
impl_scalar!(u32, Kind::Uint);
impl_scalar!(u64, Kind::Uint);
impl_scalar!(f32, Kind::Float);
impl_scalar!(f64, Kind::Float);

impl Scalar for bool {
    fn dtype() -> Dtype {
        Dtype::new(Endian::Irrelevant, Kind::Bool, 1)
    }
    fn put(self, out: &mut Vec<u8>) {
        out.push(self as u8);
    }
    fn get(bytes: &[u8]) -> Self {
        bytes[0] != 0
    }
}

// ── Array ───────────────────────────────────────────────────────────

/// A typed buffer: `dtype` plus raw bytes, `len()` records long.
#[derive(Debug, Clone, PartialEq)]
pub struct Array {
    dtype: Dtype,
    data: Vec<u8>,
}

impl Array {
    /// Wrap raw bytes.  The byte length must be a whole number of records.
    pub fn from_bytes(dtype: Dtype, data: Vec<u8>) -> Result<Array, BigFileError> {
        let itemsize = dtype.itemsize();
        if itemsize == 0 || data.len() as u64 % itemsize != 0 {
            return Err(BigFileError::Dtype {
                message: format!(
                    "{} bytes is not a whole number of {itemsize}-byte '{dtype}' records",
                    data.len()
                ),
            });
        }
        Ok(Array { dtype, data })
    }

    /// An all-zero buffer of `len` records.
    pub fn zeros(dtype: Dtype, len: u64) -> Array {
        let bytes = dtype.itemsize() * len;
        Array {
            dtype,
            data: vec![0u8; bytes as usize],
        }
    }

    /// Build from a slice of Rust scalars, one record per value.
    pub fn from_scalars<T: Scalar>(values: &[T]) -> Array {
        let dtype = T::dtype();
        let mut data = Vec::with_capacity(values.len() * dtype.width as usize);
        for &v in values {
            v.put(&mut data);
        }
        Array { dtype, data }
    }

    /// Build from a flat slice of scalars viewed as shaped records.
    /// `values.len()` must be a multiple of the shape's element count.
    pub fn from_scalars_shaped<T: Scalar>(
        values: &[T],
        shape: &[u32],
    ) -> Result<Array, BigFileError> {
        let dtype = T::dtype().with_shape(shape);
        let nmemb = dtype.nmemb();
        if nmemb == 0 || values.len() as u64 % nmemb != 0 {
            return Err(BigFileError::Dtype {
                message: format!(
                    "{} scalars do not divide into records of shape {shape:?}",
                    values.len()
                ),
            });
        }
        let mut data = Vec::with_capacity(values.len() * dtype.width as usize);
        for &v in values {
            v.put(&mut data);
        }
        Ok(Array { dtype, data })
    }

    /// Build from complex values given as `(re, im)` pairs of f64.
    pub fn from_complex_pairs(values: &[(f64, f64)]) -> Array {
        let dtype = Dtype::new(Endian::Native, Kind::Complex, 16);
        let mut data = Vec::with_capacity(values.len() * 16);
        for &(re, im) in values {
            re.put(&mut data);
            im.put(&mut data);
        }
        Array { dtype, data }
    }

    pub fn dtype(&self) -> &Dtype {
        &self.dtype
    }

    /// Length in records.
    pub fn len(&self) -> u64 {
        self.data.len() as u64 / self.dtype.itemsize()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// A copy of the records `[start, start + count)`.
    pub fn slice(&self, start: u64, count: u64) -> Result<Array, BigFileError> {
        if start + count > self.len() {
            return Err(BigFileError::Bounds {
                message: format!(
                    "slice [{start}, {}) of an array of {} records",
                    start + count,
                    self.len()
                ),
            });
        }
        let itemsize = self.dtype.itemsize();
        let a = (start * itemsize) as usize;
        let b = ((start + count) * itemsize) as usize;
        Ok(Array {
            dtype: self.dtype.clone(),
            data: self.data[a..b].to_vec(),
        })
    }

    /// The same values with the bytes reordered for `endian`.
    pub fn cast_endian(mut self, endian: Endian) -> Array {
        let from = self.dtype.resolved().endian;
        let to = Dtype {
            endian,
            ..self.dtype.clone()
        }
        .resolved()
        .endian;
        if from != to {
            self.dtype.byte_swap(&mut self.data);
        }
        self.dtype = Dtype {
            endian,
            ..self.dtype
        };
        self
    }

    /// Extract the scalars as `T`, swapping to native order as needed.
    /// The element type must be value-compatible with `T`'s dtype.
    pub fn to_vec<T: Scalar>(&self) -> Result<Vec<T>, BigFileError> {
        let want = T::dtype();
        if self.dtype.kind != want.kind || self.dtype.width != want.width {
            return Err(BigFileError::Dtype {
                message: format!("cannot view '{}' data as '{}'", self.dtype, want),
            });
        }
        let width = self.dtype.width as usize;
        if self.dtype.needs_swap() {
            let mut copy = self.data.clone();
            self.dtype.byte_swap(&mut copy);
            Ok(copy.chunks_exact(width).map(T::get).collect())
        } else {
            Ok(self.data.chunks_exact(width).map(T::get).collect())
        }
    }

    /// Extract complex values as `(re, im)` pairs of f64.  Works for both
    /// complex widths; `c8` components widen from f32.
    pub fn to_complex_pairs(&self) -> Result<Vec<(f64, f64)>, BigFileError> {
        if self.dtype.kind != Kind::Complex {
            return Err(BigFileError::Dtype {
                message: format!("cannot view '{}' data as complex pairs", self.dtype),
            });
        }
        let mut bytes = self.data.clone();
        if self.dtype.needs_swap() {
            self.dtype.byte_swap(&mut bytes);
        }
        let half = self.dtype.width as usize / 2;
        let component = |b: &[u8]| -> f64 {
            if half == 8 {
                f64::get(b)
            } else {
                f32::get(b) as f64
            }
        };
        Ok(bytes
            .chunks_exact(self.dtype.width as usize)
            .map(|c| (component(&c[..half]), component(&c[half..])))
            .collect())
    }
}
