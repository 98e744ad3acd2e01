//! I/O binding: named tensors staged for one model run

use super::value::{MemoryInfo, Value};

/// Where a bound output's tensor comes from
#[derive(Debug, Clone)]
pub enum OutputBinding {
    /// Write into this preallocated tensor
    Tensor(Value),
    /// Let the runtime allocate the output on this device
    Device(MemoryInfo),
}

/// Named input and output tensors staged for one synchronous run
///
/// One binding lives per stage per execution frame and is cleared and
/// re-populated every step, so no binding allocation happens on the hot path.
#[derive(Debug, Default)]
pub struct IoBinding {
    inputs: Vec<(String, Value)>,
    outputs: Vec<(String, OutputBinding)>,
}

impl IoBinding {
    /// Create an empty binding
    #[must_use]
    pub fn new() -> Self {
        IoBinding::default()
    }

    /// Bind an input tensor by name
    pub fn bind_input(&mut self, name: &str, value: Value) {
        self.inputs.push((name.to_string(), value));
    }

    /// Bind an output by name to a preallocated tensor
    pub fn bind_output(&mut self, name: &str, value: Value) {
        self.outputs.push((name.to_string(), OutputBinding::Tensor(value)));
    }

    /// Bind an output by name to a device; the runtime allocates the tensor
    pub fn bind_output_to_device(&mut self, name: &str, memory: MemoryInfo) {
        self.outputs.push((name.to_string(), OutputBinding::Device(memory)));
    }

    /// Drop all bound inputs
    pub fn clear_inputs(&mut self) {
        self.inputs.clear();
    }

    /// Drop all bound outputs
    pub fn clear_outputs(&mut self) {
        self.outputs.clear();
    }

    /// Bound inputs, in binding order
    #[must_use]
    pub fn inputs(&self) -> &[(String, Value)] {
        &self.inputs
    }

    /// Bound outputs, in binding order
    #[must_use]
    pub fn outputs(&self) -> &[(String, OutputBinding)] {
        &self.outputs
    }

    /// Look up a bound input by name
    #[must_use]
    pub fn input(&self, name: &str) -> Option<&Value> {
        self.inputs
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }
}
