//! Tensor and memory vocabulary shared with the inference runtime
//!
//! Tensor handles are cheap to clone; clones share the backing storage.
//! This is how borrowed-vs-owned hand-off works across the engine: the
//! caller's step-0 inputs stay alive through the caller's own handles, while
//! everything produced later is owned by whichever frame or response slot
//! holds the last clone.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::error::{PipelineError, Result};

/// Element type of a tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementType {
    /// IEEE 754 half precision
    F16,
    /// IEEE 754 single precision
    F32,
    /// 32-bit signed integer
    I32,
    /// 64-bit signed integer
    I64,
}

impl ElementType {
    /// Size of one element in bytes
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        match self {
            ElementType::F16 => 2,
            ElementType::F32 | ElementType::I32 => 4,
            ElementType::I64 => 8,
        }
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElementType::F16 => write!(f, "f16"),
            ElementType::F32 => write!(f, "f32"),
            ElementType::I32 => write!(f, "i32"),
            ElementType::I64 => write!(f, "i64"),
        }
    }
}

/// Memory placement descriptor for a tensor or an allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryInfo {
    /// Host-resident memory
    Cpu,
    /// Accelerator-resident memory on the given device ordinal
    Accelerator(i32),
}

impl MemoryInfo {
    /// Device ordinal, if accelerator-resident
    #[must_use]
    pub fn device_id(&self) -> Option<i32> {
        match self {
            MemoryInfo::Cpu => None,
            MemoryInfo::Accelerator(id) => Some(*id),
        }
    }

    /// Check whether this descriptor names accelerator memory
    #[must_use]
    pub fn is_accelerator(&self) -> bool {
        matches!(self, MemoryInfo::Accelerator(_))
    }
}

impl fmt::Display for MemoryInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryInfo::Cpu => write!(f, "cpu"),
            MemoryInfo::Accelerator(id) => write!(f, "device:{id}"),
        }
    }
}

/// Tensor type-and-shape info introspected from a compiled model
///
/// Symbolic dimensions (batch, sequence length) are reported as `-1` and must
/// be overridden with concrete values before an element count can exist.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorInfo {
    /// Element type
    pub dtype: ElementType,
    /// Dimension sizes, `-1` for symbolic
    pub shape: Vec<i64>,
}

impl TensorInfo {
    /// Total number of elements
    ///
    /// # Errors
    /// Fails if any dimension is still symbolic.
    pub fn element_count(&self) -> Result<usize> {
        element_count(&self.shape)
    }
}

/// Total number of elements of a fully resolved shape
pub(crate) fn element_count(shape: &[i64]) -> Result<usize> {
    let mut count = 1usize;
    for &dim in shape {
        if dim < 0 {
            return Err(PipelineError::Config {
                reason: format!("shape {shape:?} has an unresolved symbolic dimension"),
            });
        }
        count = count.saturating_mul(dim as usize);
    }
    Ok(count)
}

/// Read one dimension of a shape, bounds-checked
pub(crate) fn dim_at(shape: &[i64], index: usize) -> Result<i64> {
    shape.get(index).copied().ok_or_else(|| PipelineError::Config {
        reason: format!("dimension index {index} out of range for shape {shape:?}"),
    })
}

/// Override one dimension of a shape, bounds-checked
pub(crate) fn set_dim(shape: &mut [i64], index: usize, value: i64) -> Result<()> {
    dim_at(shape, index)?;
    shape[index] = value;
    Ok(())
}

static NEXT_STORAGE_ID: AtomicU64 = AtomicU64::new(1);

/// Shared byte storage behind allocations and tensor handles
#[derive(Debug)]
struct Storage {
    id: u64,
    memory: MemoryInfo,
    bytes: RwLock<Vec<u8>>,
}

impl Storage {
    fn new(memory: MemoryInfo, size: usize) -> Arc<Self> {
        Arc::new(Storage {
            id: NEXT_STORAGE_ID.fetch_add(1, Ordering::Relaxed),
            memory,
            bytes: RwLock::new(vec![0u8; size]),
        })
    }
}

/// A scoped arena allocation on one device
///
/// Handles are cheap to clone and share the underlying region. `addr()` is a
/// stable identity for the region, usable to observe buffer reuse.
#[derive(Debug, Clone)]
pub struct DeviceAllocation {
    storage: Arc<Storage>,
    size: usize,
}

impl DeviceAllocation {
    /// Allocate a zero-initialised region of `size` bytes
    #[must_use]
    pub fn new(memory: MemoryInfo, size: usize) -> Self {
        DeviceAllocation {
            storage: Storage::new(memory, size),
            size,
        }
    }

    /// Size of the region in bytes
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Stable identity of the backing region
    #[must_use]
    pub fn addr(&self) -> u64 {
        self.storage.id
    }

    /// Memory placement of the region
    #[must_use]
    pub fn memory(&self) -> MemoryInfo {
        self.storage.memory
    }
}

/// An owned tensor handle
///
/// Combines an element type, a concrete shape and shared storage. Clones are
/// cheap and alias the same bytes; the last clone dropped releases the
/// storage.
#[derive(Debug, Clone)]
pub struct Value {
    dtype: ElementType,
    shape: Vec<i64>,
    len_bytes: usize,
    storage: Arc<Storage>,
}

impl Value {
    /// Create a zero-filled tensor with fresh storage
    ///
    /// # Errors
    /// Fails if the shape has unresolved symbolic dimensions.
    pub fn zeros(memory: MemoryInfo, dtype: ElementType, shape: &[i64]) -> Result<Self> {
        let len_bytes = element_count(shape)? * dtype.size_bytes();
        Ok(Value {
            dtype,
            shape: shape.to_vec(),
            len_bytes,
            storage: Storage::new(memory, len_bytes),
        })
    }

    /// Create a tensor with fresh storage holding the given little-endian bytes
    ///
    /// # Errors
    /// Fails if `bytes` does not match the shape's byte length.
    pub fn from_le_bytes(
        memory: MemoryInfo,
        dtype: ElementType,
        shape: &[i64],
        bytes: &[u8],
    ) -> Result<Self> {
        let value = Value::zeros(memory, dtype, shape)?;
        value.write_bytes(bytes)?;
        Ok(value)
    }

    /// Create an `i64` tensor from host data
    ///
    /// # Errors
    /// Fails if `data` does not match the shape's element count.
    pub fn from_i64s(memory: MemoryInfo, shape: &[i64], data: &[i64]) -> Result<Self> {
        let mut bytes = Vec::with_capacity(data.len() * 8);
        for v in data {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        Value::from_le_bytes(memory, ElementType::I64, shape, &bytes)
    }

    /// Create a tensor view over an existing device allocation
    ///
    /// The view starts at the beginning of the region; the shape's byte
    /// length must fit inside it. Views over the same allocation alias.
    ///
    /// # Errors
    /// Fails on unresolved dimensions or if the shape overflows the region.
    pub fn over_allocation(
        alloc: &DeviceAllocation,
        dtype: ElementType,
        shape: &[i64],
    ) -> Result<Self> {
        let len_bytes = element_count(shape)? * dtype.size_bytes();
        if len_bytes > alloc.size() {
            return Err(PipelineError::Config {
                reason: format!(
                    "tensor of {len_bytes} bytes (shape {shape:?}, {dtype}) overflows a {} byte allocation",
                    alloc.size()
                ),
            });
        }
        Ok(Value {
            dtype,
            shape: shape.to_vec(),
            len_bytes,
            storage: alloc.storage.clone(),
        })
    }

    /// Element type
    #[must_use]
    pub fn dtype(&self) -> ElementType {
        self.dtype
    }

    /// Concrete shape
    #[must_use]
    pub fn shape(&self) -> &[i64] {
        &self.shape
    }

    /// Type-and-shape info for this tensor
    #[must_use]
    pub fn info(&self) -> TensorInfo {
        TensorInfo {
            dtype: self.dtype,
            shape: self.shape.clone(),
        }
    }

    /// Memory placement of the backing storage
    #[must_use]
    pub fn memory(&self) -> MemoryInfo {
        self.storage.memory
    }

    /// Byte length of the tensor's element region
    #[must_use]
    pub fn len_bytes(&self) -> usize {
        self.len_bytes
    }

    /// Stable identity of the backing storage region
    #[must_use]
    pub fn allocation_addr(&self) -> u64 {
        self.storage.id
    }

    /// Run `f` over the tensor's bytes without copying them out
    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let guard = self
            .storage
            .bytes
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        f(&guard[..self.len_bytes])
    }

    /// Copy the tensor's bytes out
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        self.with_bytes(<[u8]>::to_vec)
    }

    /// Overwrite the tensor's bytes
    ///
    /// # Errors
    /// Fails if `src` does not match the tensor's byte length.
    pub fn write_bytes(&self, src: &[u8]) -> Result<()> {
        if src.len() != self.len_bytes {
            return Err(PipelineError::RuntimeFailure {
                reason: format!(
                    "tensor write of {} bytes into a {} byte tensor",
                    src.len(),
                    self.len_bytes
                ),
            });
        }
        let mut guard = self
            .storage
            .bytes
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        guard[..self.len_bytes].copy_from_slice(src);
        Ok(())
    }

    /// Read the tensor as `i64` host data
    ///
    /// # Errors
    /// Fails if the element type is not `i64`.
    pub fn i64_data(&self) -> Result<Vec<i64>> {
        if self.dtype != ElementType::I64 {
            return Err(PipelineError::RuntimeFailure {
                reason: format!("expected an i64 tensor, found {}", self.dtype),
            });
        }
        Ok(self.with_bytes(|bytes| {
            bytes
                .chunks_exact(8)
                .map(|c| i64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                .collect()
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_element_sizes() {
        assert_eq!(ElementType::F16.size_bytes(), 2);
        assert_eq!(ElementType::F32.size_bytes(), 4);
        assert_eq!(ElementType::I32.size_bytes(), 4);
        assert_eq!(ElementType::I64.size_bytes(), 8);
    }

    #[test]
    fn test_memory_info_device_id() {
        assert_eq!(MemoryInfo::Cpu.device_id(), None);
        assert_eq!(MemoryInfo::Accelerator(3).device_id(), Some(3));
        assert!(MemoryInfo::Accelerator(0).is_accelerator());
        assert!(!MemoryInfo::Cpu.is_accelerator());
    }

    #[test]
    fn test_element_count_rejects_symbolic() {
        let info = TensorInfo {
            dtype: ElementType::F16,
            shape: vec![-1, 4],
        };
        assert!(info.element_count().is_err());
        let info = TensorInfo {
            dtype: ElementType::F16,
            shape: vec![2, 4],
        };
        assert_eq!(info.element_count().unwrap(), 8);
    }

    #[test]
    fn test_value_roundtrip_i64() {
        let v = Value::from_i64s(MemoryInfo::Cpu, &[2, 2], &[1, 2, 3, 4]).unwrap();
        assert_eq!(v.i64_data().unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(v.shape(), &[2, 2]);
        assert_eq!(v.len_bytes(), 32);
    }

    #[test]
    fn test_clones_share_storage() {
        let a = Value::from_i64s(MemoryInfo::Cpu, &[2], &[7, 8]).unwrap();
        let b = a.clone();
        b.write_bytes(&{
            let mut bytes = Vec::new();
            bytes.extend_from_slice(&1i64.to_le_bytes());
            bytes.extend_from_slice(&2i64.to_le_bytes());
            bytes
        })
        .unwrap();
        assert_eq!(a.i64_data().unwrap(), vec![1, 2]);
        assert_eq!(a.allocation_addr(), b.allocation_addr());
    }

    #[test]
    fn test_view_over_allocation() {
        let alloc = DeviceAllocation::new(MemoryInfo::Accelerator(0), 64);
        // a zero-length view is fine: no past state on the first step
        let empty = Value::over_allocation(&alloc, ElementType::F16, &[2, 0, 4]).unwrap();
        assert_eq!(empty.len_bytes(), 0);
        assert_eq!(empty.allocation_addr(), alloc.addr());

        let full = Value::over_allocation(&alloc, ElementType::F16, &[2, 4, 4]).unwrap();
        assert_eq!(full.len_bytes(), 64);

        let too_big = Value::over_allocation(&alloc, ElementType::F16, &[2, 5, 4]);
        assert!(too_big.is_err());
    }

    #[test]
    fn test_views_alias() {
        let alloc = DeviceAllocation::new(MemoryInfo::Accelerator(1), 16);
        let a = Value::over_allocation(&alloc, ElementType::I64, &[2]).unwrap();
        let b = Value::over_allocation(&alloc, ElementType::I64, &[1]).unwrap();
        a.write_bytes(&{
            let mut bytes = Vec::new();
            bytes.extend_from_slice(&42i64.to_le_bytes());
            bytes.extend_from_slice(&43i64.to_le_bytes());
            bytes
        })
        .unwrap();
        assert_eq!(b.i64_data().unwrap(), vec![42]);
    }

    #[test]
    fn test_write_length_mismatch() {
        let v = Value::zeros(MemoryInfo::Cpu, ElementType::F32, &[2]).unwrap();
        assert!(v.write_bytes(&[0u8; 4]).is_err());
        assert!(v.write_bytes(&[0u8; 8]).is_ok());
    }
}
