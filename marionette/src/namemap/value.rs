use std::{fmt, mem, os::raw::c_void, ptr, rc::Rc};

/// Everything that can be stored in a [`NameMap`](super::NameMap).
#[derive(Debug, Clone)]
pub enum Value {
    Int(i32),
    SizeT(usize),
    Float(f32),
    Double(f64),
    Pointer(*mut c_void),
    Array(Array),
}

impl Value {
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Int(_) => "int",
            Value::SizeT(_) => "size_t",
            Value::Float(_) => "float",
            Value::Double(_) => "double",
            Value::Pointer(_) => "pointer",
            Value::Array(_) => "array",
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::SizeT(a), Value::SizeT(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Double(a), Value::Double(b)) => a == b,
            (Value::Pointer(a), Value::Pointer(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a.same_view(b),
            _ => false,
        }
    }
}

/// Strided view of elements of `type_size` bytes.
///
/// A view either borrows memory owned by someone else (hosted code saving a
/// buffer) or owns a contiguous copy (values received from another rank).
/// `stride` counts elements, so `1` is contiguous.
#[derive(Clone)]
pub struct Array {
    address: *const u8,
    type_size: usize,
    count: usize,
    stride: usize,
    storage: Option<Rc<[u8]>>,
}

impl fmt::Debug for Array {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Array")
            .field("address", &self.address)
            .field("type_size", &self.type_size)
            .field("count", &self.count)
            .field("stride", &self.stride)
            .field("owned", &self.storage.is_some())
            .finish()
    }
}

impl Array {
    pub fn borrowed(address: *const u8, type_size: usize, count: usize, stride: usize) -> Self {
        Self {
            address,
            type_size,
            count,
            stride: stride.max(1),
            storage: None,
        }
    }

    /// Borrow `values`; the caller keeps them alive while the view is read.
    pub fn from_slice<T: Copy>(values: &[T]) -> Self {
        Self::borrowed(values.as_ptr() as *const u8, mem::size_of::<T>(), values.len(), 1)
    }

    /// Contiguous copy of `values` owned by the array.
    pub fn owned<T: Copy>(values: &[T]) -> Self {
        let bytes = unsafe {
            std::slice::from_raw_parts(values.as_ptr() as *const u8, mem::size_of_val(values))
        };
        Self::from_bytes(bytes.into(), mem::size_of::<T>(), values.len())
    }

    pub(crate) fn from_bytes(storage: Rc<[u8]>, type_size: usize, count: usize) -> Self {
        Self {
            address: storage.as_ptr(),
            type_size,
            count,
            stride: 1,
            storage: Some(storage),
        }
    }

    pub fn address(&self) -> *const u8 {
        self.address
    }

    pub fn type_size(&self) -> usize {
        self.type_size
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn is_owned(&self) -> bool {
        self.storage.is_some()
    }

    fn same_view(&self, other: &Self) -> bool {
        self.address == other.address
            && self.type_size == other.type_size
            && self.count == other.count
            && self.stride == other.stride
    }

    /// Gather the viewed elements into a contiguous byte buffer.
    ///
    /// # Safety
    /// The viewed memory must be valid for `count` strided elements.
    pub unsafe fn gather(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.type_size * self.count);
        for index in 0..self.count {
            let element = self.address.add(index * self.stride * self.type_size);
            bytes.extend_from_slice(std::slice::from_raw_parts(element, self.type_size));
        }
        bytes
    }

    /// Read the elements as `T`, `None` if the element size differs.
    ///
    /// # Safety
    /// As for [`Array::gather`], and the bytes must form valid `T`s.
    pub unsafe fn to_vec<T: Copy>(&self) -> Option<Vec<T>> {
        if mem::size_of::<T>() != self.type_size {
            return None;
        }
        let bytes = self.gather();
        Some(
            (0..self.count)
                .map(|index| ptr::read_unaligned(bytes.as_ptr().add(index * self.type_size) as *const T))
                .collect(),
        )
    }

    /// Owned, contiguous copy of the view.
    ///
    /// # Safety
    /// As for [`Array::gather`].
    pub unsafe fn copy(&self) -> Self {
        Self::from_bytes(self.gather().into(), self.type_size, self.count)
    }
}

/// Typed extraction used by [`NameMap::get_as`](super::NameMap::get_as).
pub trait FromValue: Sized {
    const KIND: &'static str;

    fn from_value(value: Value) -> Option<Self>;
}

macro_rules! from_value {
    ($type:ty, $variant:ident, $kind:literal) => {
        impl FromValue for $type {
            const KIND: &'static str = $kind;

            fn from_value(value: Value) -> Option<Self> {
                match value {
                    Value::$variant(inner) => Some(inner),
                    _ => None,
                }
            }
        }

        impl From<$type> for Value {
            fn from(inner: $type) -> Self {
                Value::$variant(inner)
            }
        }
    };
}

from_value!(i32, Int, "int");
from_value!(usize, SizeT, "size_t");
from_value!(f32, Float, "float");
from_value!(f64, Double, "double");
from_value!(*mut c_void, Pointer, "pointer");
from_value!(Array, Array, "array");
