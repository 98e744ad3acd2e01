//! Per-request durable state
//!
//! A [`RequestExecutionFrame`] outlives the tokens that shuttle a request
//! between stages: it owns, per stage, the I/O binding, the ping-pong pair of
//! preallocated recurrent-state buffers, the map of last-produced state
//! tensors, and the preallocated inter-stage activation buffers. All device
//! memory a request will ever need is allocated once here, so no allocation
//! happens on the per-step hot path.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::runtime::value::{element_count, set_dim};
use crate::runtime::{
    DeviceAllocation, DeviceAllocator, IoBinding, MemoryInfo, Value,
};
use crate::session::SessionState;

/// Unique id of one in-flight request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ReqId(u64);

impl ReqId {
    /// Wrap a raw id
    #[must_use]
    pub fn from_raw(id: u64) -> Self {
        ReqId(id)
    }

    /// Raw id value
    #[must_use]
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ReqId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Work item passed between the orchestrator and stage workers
///
/// Carries the named input tensors for the next stage to run, or, on the way
/// back, the tensors that stage produced for its successor. Tokens move by
/// value through the stage queues and the response queue; a worker that fails
/// sends the token back with `error` set instead of unwinding.
#[derive(Debug, Default)]
pub struct Token {
    /// Request this token belongs to
    pub req_id: ReqId,
    /// Decoding step this token is executing
    pub step_id: usize,
    /// Input names supplied to the next stage, parallel to `values`
    pub value_names: Vec<String>,
    /// Tensor handles, parallel to `value_names`
    pub values: Vec<Value>,
    /// Set when a stage worker failed; checked on every pop
    pub error: Option<PipelineError>,
}

impl Token {
    /// Create a token carrying the given payload
    #[must_use]
    pub fn new(req_id: ReqId, step_id: usize, value_names: Vec<String>, values: Vec<Value>) -> Self {
        Token {
            req_id,
            step_id,
            value_names,
            values,
            error: None,
        }
    }

    /// Create a failed token for error marshalling
    #[must_use]
    pub fn failed(req_id: ReqId, step_id: usize, error: PipelineError) -> Self {
        Token {
            req_id,
            step_id,
            value_names: Vec::new(),
            values: Vec::new(),
            error: Some(error),
        }
    }

    /// Index of `name` in the carried payload
    #[must_use]
    pub fn find(&self, name: &str) -> Option<usize> {
        self.value_names.iter().position(|n| n == name)
    }
}

/// Host-side scratch for a regenerated next-step input
#[derive(Debug, Clone, Default)]
pub struct HostBuffer {
    /// Flat element data
    pub data: Vec<i64>,
    /// Tensor shape
    pub shape: Vec<i64>,
}

/// Caller-requested output targets, extracted from the response slot at setup
///
/// Workers bind final outputs from this; the produced tensors are transferred
/// into the caller's actual response slot at finalisation.
#[derive(Debug, Clone)]
pub struct ResponseTarget {
    /// Requested output names
    pub output_names: Vec<String>,
    /// Per-output device to allocate the output on, if the caller gave one
    pub output_meminfo: Vec<Option<MemoryInfo>>,
    /// Per-output caller-preallocated tensor, bound directly when no device
    /// descriptor was given
    pub preallocated: Vec<Option<Value>>,
}

impl ResponseTarget {
    /// Index of `name` among the requested outputs
    #[must_use]
    pub fn position_of(&self, name: &str) -> Option<usize> {
        self.output_names.iter().position(|n| n == name)
    }
}

/// Per-stage mutable run state owned by a frame
pub struct RunState {
    /// Reusable I/O binding for this stage's session
    pub io_binding: IoBinding,
    /// Arena allocator for this stage's device
    pub allocator: Arc<dyn DeviceAllocator>,
    /// First half of the ping-pong pair, one allocation per state slot
    pub state_buffer_1: Vec<DeviceAllocation>,
    /// Second half of the ping-pong pair, parallel to `state_buffer_1`
    pub state_buffer_2: Vec<DeviceAllocation>,
    /// Present-output name to the tensor produced at the previous step
    pub output_val_map: HashMap<String, Value>,
    /// Inter-stage output name to its preallocated buffer (non-terminal stages)
    pub inter_stage_buffers: HashMap<String, DeviceAllocation>,
}

impl RunState {
    /// Buffer the present state of `slot` is written into at `step_id`
    ///
    /// Even steps write buffer 2 and read buffer 1; odd steps the reverse.
    /// The state read and the state written within one step therefore never
    /// alias.
    #[must_use]
    pub fn write_buffer_for_step(&self, step_id: usize, slot: usize) -> &DeviceAllocation {
        if step_id % 2 == 0 {
            &self.state_buffer_2[slot]
        } else {
            &self.state_buffer_1[slot]
        }
    }
}

/// Durable per-request state across steps and stages
pub struct RequestExecutionFrame {
    /// Slot of this request in the caller's request/response lists
    pub req_index: usize,
    /// Request id
    pub req_id: ReqId,
    /// Batch size, from the step-0 input shape
    pub batch_size: i64,
    /// Sequence length of the original prompt
    pub orig_input_seq_len: i64,
    /// Stage the request runs next (advanced by the orchestrator)
    pub stage_id: usize,
    /// Caller-requested output targets
    pub response: ResponseTarget,
    /// One run state per stage
    pub run_states: Vec<RunState>,
    /// Host scratch for regenerated inputs, keyed by input name
    pub next_step_input_buffers: HashMap<String, HostBuffer>,
}

impl RequestExecutionFrame {
    /// Build a frame, preallocating every buffer the request will need
    ///
    /// For each stage: the recurrent-state shape is introspected from the
    /// first past input, its batch and sequence-length dims overridden with
    /// `batch_size` and `max_seq_len`, and two device buffers allocated per
    /// state slot. `output_val_map` is seeded with zero-length state views
    /// over buffer 1 (no past on the first step). Non-terminal stages also
    /// get one buffer per inter-stage output.
    ///
    /// # Errors
    /// Fails on unresolved symbolic dims outside the declared batch/seq
    /// roles, out-of-range dimension indices, or allocator exhaustion.
    pub fn new(
        pcfg: &PipelineConfig,
        session_states: &[Arc<SessionState>],
        req_index: usize,
        req_id: ReqId,
        batch_size: i64,
        orig_input_seq_len: i64,
        response: ResponseTarget,
    ) -> Result<Self> {
        let num_stages = pcfg.num_stages();
        let mut run_states = Vec::with_capacity(num_stages);

        for (stage_idx, mcfg) in pcfg.model_config_vec.iter().enumerate() {
            let state = &session_states[stage_idx];
            let allocator = state.session.allocator();

            // all past/present states share one shape and dim roles, so the
            // first past input sizes every slot
            let first_past = &mcfg.past_input_names[0];
            let input_idx = state.input_index(first_past)?;
            let info = state.session.input_info(input_idx);
            let mut state_shape = info.shape;
            set_dim(&mut state_shape, mcfg.batch_dim_index_in_state, batch_size)?;
            set_dim(&mut state_shape, mcfg.seq_len_dim_index_in_state, pcfg.max_seq_len)?;
            let size_to_allocate = element_count(&state_shape)? * info.dtype.size_bytes();

            let num_slots = mcfg.past_input_names.len();
            let mut state_buffer_1 = Vec::with_capacity(num_slots);
            let mut state_buffer_2 = Vec::with_capacity(num_slots);
            for _ in 0..num_slots {
                state_buffer_1.push(allocator.get_allocation(size_to_allocate)?);
                state_buffer_2.push(allocator.get_allocation(size_to_allocate)?);
            }

            // zero-length seed: the first run has no past state to feed
            set_dim(&mut state_shape, mcfg.seq_len_dim_index_in_state, 0)?;
            let mut output_val_map = HashMap::with_capacity(num_slots);
            for (slot, oname) in mcfg.present_output_names.iter().enumerate() {
                let out_idx = state.output_index(oname)?;
                let dtype = state.session.output_info(out_idx).dtype;
                let seed = Value::over_allocation(&state_buffer_1[slot], dtype, &state_shape)?;
                output_val_map.insert(oname.clone(), seed);
            }

            let mut inter_stage_buffers = HashMap::new();
            if stage_idx + 1 < num_stages {
                for (oname, _) in &mcfg.inter_stage_output_input_map {
                    let out_idx = state.output_index(oname)?;
                    let out_info = state.session.output_info(out_idx);
                    let mut shape = out_info.shape;
                    set_dim(&mut shape, mcfg.batch_dim_in_inter_stage_output, batch_size)?;
                    set_dim(&mut shape, mcfg.seq_len_dim_in_inter_stage_output, pcfg.max_seq_len)?;
                    let size = element_count(&shape)? * out_info.dtype.size_bytes();
                    inter_stage_buffers.insert(oname.clone(), allocator.get_allocation(size)?);
                }
            }

            run_states.push(RunState {
                io_binding: IoBinding::new(),
                allocator,
                state_buffer_1,
                state_buffer_2,
                output_val_map,
                inter_stage_buffers,
            });
        }

        Ok(RequestExecutionFrame {
            req_index,
            req_id,
            batch_size,
            orig_input_seq_len,
            stage_id: 0,
            response,
            run_states,
            next_step_input_buffers: HashMap::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::ElementType;
    use crate::testing::{two_stage_config, two_stage_runtime};

    fn build_frame(batch_size: i64) -> (RequestExecutionFrame, Vec<Arc<SessionState>>) {
        let (runtime, _, _) = two_stage_runtime();
        let mut config = two_stage_config();
        let session_states =
            crate::session::load_session_states(&mut config, runtime.as_ref()).unwrap();
        let target = ResponseTarget {
            output_names: vec!["logits".to_string()],
            output_meminfo: vec![Some(MemoryInfo::Accelerator(1))],
            preallocated: vec![None],
        };
        let frame = RequestExecutionFrame::new(
            &config,
            &session_states,
            0,
            ReqId::from_raw(1),
            batch_size,
            5,
            target,
        )
        .unwrap();
        (frame, session_states)
    }

    #[test]
    fn test_two_buffers_per_state_slot() {
        let (frame, _) = build_frame(2);
        for run_state in &frame.run_states {
            assert_eq!(run_state.state_buffer_1.len(), 1);
            assert_eq!(run_state.state_buffer_2.len(), 1);
            assert_ne!(
                run_state.state_buffer_1[0].addr(),
                run_state.state_buffer_2[0].addr()
            );
        }
    }

    #[test]
    fn test_buffer_sized_for_max_seq_len() {
        let (frame, _) = build_frame(2);
        // state shape [batch, seq, 4] f16 with batch=2, max_seq_len=16
        let expected = 2 * 16 * 4 * ElementType::F16.size_bytes();
        assert_eq!(frame.run_states[0].state_buffer_1[0].size(), expected);
    }

    #[test]
    fn test_initial_state_views_are_empty_and_in_buffer_1() {
        let (frame, _) = build_frame(2);
        let run_state = &frame.run_states[0];
        let seed = &run_state.output_val_map["present_0"];
        assert_eq!(seed.shape(), &[2, 0, 4]);
        assert_eq!(seed.allocation_addr(), run_state.state_buffer_1[0].addr());
    }

    #[test]
    fn test_inter_stage_buffers_only_on_non_terminal_stages() {
        let (frame, _) = build_frame(2);
        assert!(frame.run_states[0].inter_stage_buffers.contains_key("hidden_states"));
        // the terminal stage forwards logits through the token, not a buffer
        assert!(frame.run_states[1].inter_stage_buffers.is_empty());
    }

    #[test]
    fn test_ping_pong_selection_alternates() {
        let (frame, _) = build_frame(1);
        let run_state = &frame.run_states[0];
        let even = run_state.write_buffer_for_step(0, 0).addr();
        let odd = run_state.write_buffer_for_step(1, 0).addr();
        assert_eq!(even, run_state.state_buffer_2[0].addr());
        assert_eq!(odd, run_state.state_buffer_1[0].addr());
        assert_eq!(run_state.write_buffer_for_step(2, 0).addr(), even);
    }
}
