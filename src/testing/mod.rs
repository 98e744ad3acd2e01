//! In-memory mock of the consumed runtime interface
//!
//! Exercises the orchestration logic without accelerator hardware: a
//! [`MockRuntime`] hands out [`MockSession`]s registered under model file
//! paths, tracks the thread-current device, and every session keeps a
//! [`RunRecord`] log of what was bound and produced so tests can observe
//! ping-pong buffer alternation, state growth, injected position ids and
//! device affinity. Outputs are zero-filled unless a scripted behavior
//! supplies bytes; device-bound outputs must be scripted because their shape
//! only exists at run time.

use std::cell::Cell;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use half::f16;

use crate::config::{ModelConfig, PipelineConfig};
use crate::error::{PipelineError, Result};
use crate::runtime::{
    DeviceAllocation, DeviceAllocator, ElementType, IoBinding, MemoryInfo, ModelRuntime,
    ModelSession, OutputBinding, TensorInfo, Value,
};

thread_local! {
    static CURRENT_DEVICE: Cell<i32> = const { Cell::new(-1) };
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Build an f16 tensor from f32 values
///
/// # Panics
/// Panics if `vals` does not match the shape's element count.
#[must_use]
pub fn f16_value(memory: MemoryInfo, shape: &[i64], vals: &[f32]) -> Value {
    let out = StageOutput::f16_from_f32(shape, vals);
    Value::from_le_bytes(memory, out.dtype, &out.shape, &out.bytes)
        .expect("f16 value shape/data mismatch")
}

/// One output a scripted behavior produces for a run
#[derive(Debug, Clone)]
pub struct StageOutput {
    /// Element type of the produced tensor
    pub dtype: ElementType,
    /// Concrete shape of the produced tensor
    pub shape: Vec<i64>,
    /// Little-endian element bytes
    pub bytes: Vec<u8>,
}

impl StageOutput {
    /// An f16 tensor from f32 values
    #[must_use]
    pub fn f16_from_f32(shape: &[i64], vals: &[f32]) -> Self {
        let bytes = vals
            .iter()
            .flat_map(|v| f16::from_f32(*v).to_bits().to_le_bytes())
            .collect();
        StageOutput {
            dtype: ElementType::F16,
            shape: shape.to_vec(),
            bytes,
        }
    }

    /// A zero-filled tensor
    #[must_use]
    pub fn zeros(dtype: ElementType, shape: &[i64]) -> Self {
        let count: i64 = shape.iter().product();
        StageOutput {
            dtype,
            shape: shape.to_vec(),
            bytes: vec![0u8; count as usize * dtype.size_bytes()],
        }
    }
}

/// Read-only view of a run's bound inputs and outputs, for behaviors
pub struct RunView<'a> {
    binding: &'a IoBinding,
}

impl RunView<'_> {
    /// Look up a bound input by name
    #[must_use]
    pub fn input(&self, name: &str) -> Option<&Value> {
        self.binding.input(name)
    }

    /// Shape of a tensor-bound output, if `name` is bound to a tensor
    #[must_use]
    pub fn output_shape(&self, name: &str) -> Option<Vec<i64>> {
        self.binding.outputs().iter().find_map(|(n, ob)| match ob {
            OutputBinding::Tensor(v) if n == name => Some(v.shape().to_vec()),
            _ => None,
        })
    }
}

type BehaviorFn = dyn Fn(&RunView<'_>) -> Result<HashMap<String, StageOutput>> + Send + Sync;

/// Snapshot of one tensor bound or produced during a run
#[derive(Debug, Clone)]
pub struct BoundTensor {
    /// Tensor name
    pub name: String,
    /// Element type
    pub dtype: ElementType,
    /// Concrete shape
    pub shape: Vec<i64>,
    /// Identity of the backing storage region
    pub allocation_addr: u64,
    /// Element bytes at the time of the run
    pub bytes: Vec<u8>,
}

impl BoundTensor {
    fn of(name: &str, value: &Value) -> Self {
        BoundTensor {
            name: name.to_string(),
            dtype: value.dtype(),
            shape: value.shape().to_vec(),
            allocation_addr: value.allocation_addr(),
            bytes: value.to_bytes(),
        }
    }

    /// Interpret the snapshot bytes as `i64` data
    ///
    /// # Panics
    /// Panics if the element type is not `i64`.
    #[must_use]
    pub fn i64_data(&self) -> Vec<i64> {
        assert_eq!(self.dtype, ElementType::I64, "not an i64 tensor");
        self.bytes
            .chunks_exact(8)
            .map(|c| i64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
            .collect()
    }
}

/// What one run saw and produced
#[derive(Debug, Clone)]
pub struct RunRecord {
    /// Thread-current device when the run executed (-1 if never set)
    pub device: i32,
    /// Bound inputs, in binding order
    pub inputs: Vec<BoundTensor>,
    /// Produced outputs, in binding order
    pub outputs: Vec<BoundTensor>,
}

impl RunRecord {
    /// Look up a bound input snapshot by name
    #[must_use]
    pub fn input(&self, name: &str) -> Option<&BoundTensor> {
        self.inputs.iter().find(|t| t.name == name)
    }

    /// Look up a produced output snapshot by name
    #[must_use]
    pub fn output(&self, name: &str) -> Option<&BoundTensor> {
        self.outputs.iter().find(|t| t.name == name)
    }
}

/// Arena allocator handing out host-simulated device regions
struct MockAllocator {
    memory: MemoryInfo,
}

impl DeviceAllocator for MockAllocator {
    fn get_allocation(&self, size_bytes: usize) -> Result<DeviceAllocation> {
        Ok(DeviceAllocation::new(self.memory, size_bytes))
    }
}

/// A scripted fake of one compiled model on one device
pub struct MockSession {
    name: String,
    device_id: i32,
    inputs: Vec<(String, TensorInfo)>,
    outputs: Vec<(String, TensorInfo)>,
    behavior: Mutex<Option<Box<BehaviorFn>>>,
    failure: Mutex<Option<String>>,
    records: Mutex<Vec<RunRecord>>,
}

impl MockSession {
    /// Create a session fake named `name` pinned to `device_id`
    #[must_use]
    pub fn new(name: &str, device_id: i32) -> Self {
        MockSession {
            name: name.to_string(),
            device_id,
            inputs: Vec::new(),
            outputs: Vec::new(),
            behavior: Mutex::new(None),
            failure: Mutex::new(None),
            records: Mutex::new(Vec::new()),
        }
    }

    /// Declare a model input (builder style)
    #[must_use]
    pub fn with_input(mut self, name: &str, dtype: ElementType, shape: &[i64]) -> Self {
        self.inputs.push((
            name.to_string(),
            TensorInfo {
                dtype,
                shape: shape.to_vec(),
            },
        ));
        self
    }

    /// Declare a model output (builder style)
    #[must_use]
    pub fn with_output(mut self, name: &str, dtype: ElementType, shape: &[i64]) -> Self {
        self.outputs.push((
            name.to_string(),
            TensorInfo {
                dtype,
                shape: shape.to_vec(),
            },
        ));
        self
    }

    /// Script what subsequent runs produce
    pub fn set_behavior(
        &self,
        behavior: impl Fn(&RunView<'_>) -> Result<HashMap<String, StageOutput>>
            + Send
            + Sync
            + 'static,
    ) {
        *lock(&self.behavior) = Some(Box::new(behavior));
    }

    /// Make every subsequent run fail with `reason`
    pub fn set_failure(&self, reason: &str) {
        *lock(&self.failure) = Some(reason.to_string());
    }

    /// Number of completed runs
    #[must_use]
    pub fn run_count(&self) -> usize {
        lock(&self.records).len()
    }

    /// Snapshots of every completed run, in execution order
    #[must_use]
    pub fn records(&self) -> Vec<RunRecord> {
        lock(&self.records).clone()
    }
}

impl ModelSession for MockSession {
    fn input_count(&self) -> usize {
        self.inputs.len()
    }

    fn input_name(&self, index: usize) -> &str {
        &self.inputs[index].0
    }

    fn input_info(&self, index: usize) -> TensorInfo {
        self.inputs[index].1.clone()
    }

    fn output_count(&self) -> usize {
        self.outputs.len()
    }

    fn output_name(&self, index: usize) -> &str {
        &self.outputs[index].0
    }

    fn output_info(&self, index: usize) -> TensorInfo {
        self.outputs[index].1.clone()
    }

    fn memory_info(&self) -> MemoryInfo {
        MemoryInfo::Accelerator(self.device_id)
    }

    fn allocator(&self) -> Arc<dyn DeviceAllocator> {
        Arc::new(MockAllocator {
            memory: self.memory_info(),
        })
    }

    fn run(&self, binding: &mut IoBinding) -> Result<Vec<(String, Value)>> {
        if let Some(reason) = lock(&self.failure).clone() {
            return Err(PipelineError::RuntimeFailure { reason });
        }

        let scripted = {
            let behavior = lock(&self.behavior);
            match behavior.as_ref() {
                Some(f) => f(&RunView { binding })?,
                None => HashMap::new(),
            }
        };

        let mut produced = Vec::with_capacity(binding.outputs().len());
        for (name, output_binding) in binding.outputs() {
            let value = match output_binding {
                OutputBinding::Tensor(v) => {
                    if let Some(out) = scripted.get(name) {
                        v.write_bytes(&out.bytes)?;
                    } else {
                        v.write_bytes(&vec![0u8; v.len_bytes()])?;
                    }
                    v.clone()
                }
                OutputBinding::Device(memory) => {
                    let out = scripted.get(name).ok_or_else(|| {
                        PipelineError::RuntimeFailure {
                            reason: format!(
                                "mock session '{}' has no scripted output for device-bound '{name}'",
                                self.name
                            ),
                        }
                    })?;
                    Value::from_le_bytes(*memory, out.dtype, &out.shape, &out.bytes)?
                }
            };
            produced.push((name.clone(), value));
        }

        let record = RunRecord {
            device: CURRENT_DEVICE.with(Cell::get),
            inputs: binding
                .inputs()
                .iter()
                .map(|(n, v)| BoundTensor::of(n, v))
                .collect(),
            outputs: produced
                .iter()
                .map(|(n, v)| BoundTensor::of(n, v))
                .collect(),
        };
        lock(&self.records).push(record);
        Ok(produced)
    }
}

/// Runtime fake: registered sessions plus device-binding bookkeeping
#[derive(Default)]
pub struct MockRuntime {
    sessions: Mutex<HashMap<String, Arc<MockSession>>>,
    device_log: Mutex<Vec<i32>>,
}

impl MockRuntime {
    /// Create an empty runtime fake
    #[must_use]
    pub fn new() -> Self {
        MockRuntime::default()
    }

    /// Register `session` under a model file path; returns a handle for
    /// inspecting its run records later
    pub fn register(&self, model_file_path: &str, session: MockSession) -> Arc<MockSession> {
        let session = Arc::new(session);
        lock(&self.sessions).insert(model_file_path.to_string(), session.clone());
        session
    }

    /// Every device id passed to `set_current_device`, in call order
    #[must_use]
    pub fn device_log(&self) -> Vec<i32> {
        lock(&self.device_log).clone()
    }
}

impl ModelRuntime for MockRuntime {
    fn load_session(
        &self,
        model_file_path: &str,
        _device_id: i32,
    ) -> Result<Arc<dyn ModelSession>> {
        lock(&self.sessions)
            .get(model_file_path)
            .cloned()
            .map(|s| s as Arc<dyn ModelSession>)
            .ok_or_else(|| PipelineError::RuntimeFailure {
                reason: format!("no model registered at '{model_file_path}'"),
            })
    }

    fn set_current_device(&self, device_id: i32) -> Result<()> {
        CURRENT_DEVICE.with(|d| d.set(device_id));
        lock(&self.device_log).push(device_id);
        Ok(())
    }
}

// ============================================================================
// Shared fixtures: a two-stage GPT-style split and a single-stage ensemble
// ============================================================================

fn stage_config(name: &str, path: &str, device_id: i32) -> ModelConfig {
    ModelConfig {
        model_name: name.to_string(),
        model_file_path: path.to_string(),
        input_to_use_for_seq_len: String::new(),
        seq_len_dim_index_in_input: 1,
        batch_dim_index_in_input: 0,
        batch_dim_index_in_state: 0,
        seq_len_dim_index_in_state: 1,
        seq_len_dim_in_inter_stage_output: 1,
        batch_dim_in_inter_stage_output: 0,
        device_id,
        inter_stage_output_input_map: Vec::new(),
        past_input_names: Vec::new(),
        present_output_names: Vec::new(),
        num_workers: 1,
        input_names: Vec::new(),
        output_names: Vec::new(),
    }
}

/// Config for the two-stage fixture: encoder (device 0) feeding hidden
/// states to a decoder (device 1) that produces vocab-16 logits
#[must_use]
pub fn two_stage_config() -> PipelineConfig {
    let mut encoder = stage_config("encoder", "encoder.onnx", 0);
    encoder.input_to_use_for_seq_len = "input_ids".to_string();
    encoder.inter_stage_output_input_map =
        vec![("hidden_states".to_string(), "input_hidden_states".to_string())];
    encoder.past_input_names = vec!["past_0".to_string()];
    encoder.present_output_names = vec!["present_0".to_string()];

    let mut decoder = stage_config("decoder", "decoder.onnx", 1);
    decoder.input_to_use_for_seq_len = "input_hidden_states".to_string();
    decoder.inter_stage_output_input_map = vec![("logits".to_string(), "logits".to_string())];
    decoder.past_input_names = vec!["past_1".to_string()];
    decoder.present_output_names = vec!["present_1".to_string()];

    PipelineConfig {
        eos_token: 9,
        input_ids_name: "input_ids".to_string(),
        position_ids_name: "position_ids".to_string(),
        logits_name: "logits".to_string(),
        max_seq_len: 16,
        response_timeout_ms: 10_000,
        model_config_vec: vec![encoder, decoder],
    }
}

/// Runtime for [`two_stage_config`]: `(runtime, encoder session, decoder session)`
#[must_use]
pub fn two_stage_runtime() -> (Arc<MockRuntime>, Arc<MockSession>, Arc<MockSession>) {
    let runtime = Arc::new(MockRuntime::new());
    let encoder = runtime.register(
        "encoder.onnx",
        MockSession::new("encoder", 0)
            .with_input("input_ids", ElementType::I64, &[-1, -1])
            .with_input("position_ids", ElementType::I64, &[-1, -1])
            .with_input("past_0", ElementType::F16, &[-1, -1, 4])
            .with_output("hidden_states", ElementType::F16, &[-1, -1, 8])
            .with_output("present_0", ElementType::F16, &[-1, -1, 4]),
    );
    let decoder = runtime.register(
        "decoder.onnx",
        MockSession::new("decoder", 1)
            .with_input("input_hidden_states", ElementType::F16, &[-1, -1, 8])
            .with_input("past_1", ElementType::F16, &[-1, -1, 4])
            .with_output("logits", ElementType::F16, &[-1, -1, 16])
            .with_output("present_1", ElementType::F16, &[-1, -1, 4]),
    );
    (runtime, encoder, decoder)
}

/// Config for the degenerate single-stage fixture
#[must_use]
pub fn solo_config() -> PipelineConfig {
    let mut solo = stage_config("solo", "solo.onnx", 0);
    solo.input_to_use_for_seq_len = "input_ids".to_string();
    solo.inter_stage_output_input_map = vec![("logits".to_string(), "logits".to_string())];
    solo.past_input_names = vec!["past_0".to_string()];
    solo.present_output_names = vec!["present_0".to_string()];

    PipelineConfig {
        eos_token: 9,
        input_ids_name: "input_ids".to_string(),
        position_ids_name: "position_ids".to_string(),
        logits_name: "logits".to_string(),
        max_seq_len: 16,
        response_timeout_ms: 10_000,
        model_config_vec: vec![solo],
    }
}

/// Runtime for [`solo_config`]: `(runtime, session)`
#[must_use]
pub fn solo_runtime() -> (Arc<MockRuntime>, Arc<MockSession>) {
    let runtime = Arc::new(MockRuntime::new());
    let solo = runtime.register(
        "solo.onnx",
        MockSession::new("solo", 0)
            .with_input("input_ids", ElementType::I64, &[-1, -1])
            .with_input("position_ids", ElementType::I64, &[-1, -1])
            .with_input("past_0", ElementType::F16, &[-1, -1, 4])
            .with_output("logits", ElementType::F16, &[-1, -1, 16])
            .with_output("present_0", ElementType::F16, &[-1, -1, 4]),
    );
    (runtime, solo)
}
