//! Consumed inference-runtime interface
//!
//! The engine never executes a model graph itself; it drives an external
//! runtime through the capability set below: load a compiled model onto a
//! device, introspect its input/output names and tensor shapes, stage named
//! tensors in an [`IoBinding`], and run synchronously. Device memory comes
//! from an arena [`DeviceAllocator`], and a thread-current-device setter is
//! required because runtimes bind device context per thread while a single
//! worker thread may service many execution frames.
//!
//! [`crate::testing`] provides an in-memory implementation used by the test
//! suite; a production backend implements these traits over its own FFI.

pub mod binding;
pub mod value;

pub use binding::{IoBinding, OutputBinding};
pub use value::{DeviceAllocation, ElementType, MemoryInfo, TensorInfo, Value};

use std::sync::Arc;

use crate::error::Result;

/// Entry point into an inference runtime
pub trait ModelRuntime: Send + Sync {
    /// Load and compile the model at `model_file_path` onto `device_id`
    ///
    /// # Errors
    /// Fails if the model cannot be loaded or compiled for the device.
    fn load_session(&self, model_file_path: &str, device_id: i32)
        -> Result<Arc<dyn ModelSession>>;

    /// Bind the calling thread's current device
    ///
    /// # Errors
    /// Fails if the device ordinal is unknown to the runtime.
    fn set_current_device(&self, device_id: i32) -> Result<()>;
}

/// One compiled model pinned to one device
pub trait ModelSession: Send + Sync {
    /// Number of model inputs
    fn input_count(&self) -> usize;

    /// Name of the input at `index`
    fn input_name(&self, index: usize) -> &str;

    /// Type-and-shape info of the input at `index`
    fn input_info(&self, index: usize) -> TensorInfo;

    /// Number of model outputs
    fn output_count(&self) -> usize;

    /// Name of the output at `index`
    fn output_name(&self, index: usize) -> &str;

    /// Type-and-shape info of the output at `index`
    fn output_info(&self, index: usize) -> TensorInfo;

    /// Memory descriptor for this session's device
    fn memory_info(&self) -> MemoryInfo;

    /// Arena allocator for this session's device
    fn allocator(&self) -> Arc<dyn DeviceAllocator>;

    /// Synchronously execute the graph against the bound inputs and outputs
    ///
    /// Returns one `(name, value)` pair per bound output: for tensor-bound
    /// outputs the bound handle (now filled), for device-bound outputs a
    /// freshly allocated tensor.
    ///
    /// # Errors
    /// Fails if execution fails inside the runtime.
    fn run(&self, binding: &mut IoBinding) -> Result<Vec<(String, Value)>>;
}

/// Device arena allocator
pub trait DeviceAllocator: Send + Sync {
    /// Allocate `size_bytes` of device memory
    ///
    /// # Errors
    /// Fails when the arena is exhausted.
    fn get_allocation(&self, size_bytes: usize) -> Result<DeviceAllocation>;
}
