//! Worker-side execution of one stage for one token
//!
//! This is the hot path: bind the carried inputs and the looped-back past
//! states, size the outputs, run the session, and harvest the results into
//! the frame's state map and the outgoing token. Nothing here allocates
//! device memory; every buffer was preallocated when the frame was built.

use tracing::debug;

use crate::config::ModelConfig;
use crate::error::{PipelineError, Result};
use crate::frame::{RequestExecutionFrame, Token};
use crate::runtime::value::{dim_at, set_dim};
use crate::runtime::{ModelRuntime, Value};
use crate::session::SessionState;

/// Execute the frame's current stage against the token's payload
///
/// On success the returned token carries the inter-stage payload for the
/// next stage (or, from the terminal stage, the caller-visible outputs it
/// forwards). The frame's `output_val_map` is updated with this step's
/// present states.
pub(crate) fn execute_stage(
    runtime: &dyn ModelRuntime,
    mcfg: &ModelConfig,
    session_state: &SessionState,
    frame: &mut RequestExecutionFrame,
    mut token: Token,
) -> Result<Token> {
    runtime.set_current_device(mcfg.device_id)?;

    let stage_id = frame.stage_id;
    let batch_size = frame.batch_size;
    debug!(
        req = %token.req_id,
        step = token.step_id,
        stage = stage_id,
        device = mcfg.device_id,
        "executing stage"
    );

    let RequestExecutionFrame {
        run_states,
        response,
        ..
    } = frame;
    let run_state = &mut run_states[stage_id];

    // the token is reused as the output token: move its payload out
    let in_names = std::mem::take(&mut token.value_names);
    let in_values = std::mem::take(&mut token.values);

    run_state.io_binding.clear_inputs();
    run_state.io_binding.clear_outputs();

    // bind every model input either from the carried payload or from the
    // state produced at the previous step (the past/present loopback);
    // anything else must already have been carried, or the runtime rejects
    // the run as a configuration error
    for iname in &session_state.input_names {
        if let Some(pos) = in_names.iter().position(|n| n == iname) {
            run_state.io_binding.bind_input(iname, in_values[pos].clone());
        } else if let Some(slot) = mcfg.past_slot_of_input(iname) {
            let present_name = &mcfg.present_output_names[slot];
            let state = run_state.output_val_map.get(present_name).ok_or_else(|| {
                PipelineError::RuntimeFailure {
                    reason: format!("state '{present_name}' has no value from the previous step"),
                }
            })?;
            run_state.io_binding.bind_input(iname, state.clone());
        }
    }

    // output seq len = this step's input seq len + accumulated past seq len
    let seq_input_pos = in_names
        .iter()
        .position(|n| *n == mcfg.input_to_use_for_seq_len)
        .ok_or_else(|| PipelineError::Config {
            reason: format!(
                "input '{}' was not carried to stage '{}'",
                mcfg.input_to_use_for_seq_len, mcfg.model_name
            ),
        })?;
    let input_seq_len = dim_at(
        in_values[seq_input_pos].shape(),
        mcfg.seq_len_dim_index_in_input,
    )?;
    let first_present = &mcfg.present_output_names[0];
    let prior_state = run_state.output_val_map.get(first_present).ok_or_else(|| {
        PipelineError::RuntimeFailure {
            reason: format!("state '{first_present}' has no value from the previous step"),
        }
    })?;
    let past_seq_len = dim_at(prior_state.shape(), mcfg.seq_len_dim_index_in_state)?;
    let new_seq_len = input_seq_len + past_seq_len;

    // one shape serves every state output; all states share dims and roles
    let first_present_idx = session_state.output_index(first_present)?;
    let state_info = session_state.session.output_info(first_present_idx);
    let mut state_shape = state_info.shape;
    set_dim(&mut state_shape, mcfg.batch_dim_index_in_state, batch_size)?;
    set_dim(&mut state_shape, mcfg.seq_len_dim_index_in_state, new_seq_len)?;

    for (out_idx, oname) in session_state.output_names.iter().enumerate() {
        if let Some(slot) = mcfg.present_slot_of_output(oname) {
            // write into the half of the ping-pong pair not feeding this step
            let value = {
                let alloc = run_state.write_buffer_for_step(token.step_id, slot);
                Value::over_allocation(alloc, state_info.dtype, &state_shape)?
            };
            run_state.io_binding.bind_output(oname, value);
        } else if let Some(pos) = response.position_of(oname) {
            // caller decides where a requested final output lands
            if let Some(meminfo) = response.output_meminfo[pos] {
                run_state.io_binding.bind_output_to_device(oname, meminfo);
            } else if let Some(preallocated) = &response.preallocated[pos] {
                run_state.io_binding.bind_output(oname, preallocated.clone());
            } else {
                return Err(PipelineError::InvalidArgument {
                    reason: format!(
                        "requested output '{oname}' has neither a preallocated tensor nor a target device"
                    ),
                });
            }
        } else {
            let out_info = session_state.session.output_info(out_idx);
            let mut shape = out_info.shape;
            set_dim(&mut shape, mcfg.batch_dim_in_inter_stage_output, batch_size)?;
            set_dim(&mut shape, mcfg.seq_len_dim_in_inter_stage_output, input_seq_len)?;
            let alloc = run_state.inter_stage_buffers.get(oname).ok_or_else(|| {
                PipelineError::Config {
                    reason: format!(
                        "stage '{}' has no preallocated buffer for inter-stage output '{oname}'",
                        mcfg.model_name
                    ),
                }
            })?;
            let value = Value::over_allocation(alloc, out_info.dtype, &shape)?;
            run_state.io_binding.bind_output(oname, value);
        }
    }

    let outputs = session_state.session.run(&mut run_state.io_binding)?;

    // harvest: present states replace their map entry, inter-stage outputs
    // travel in the token under the mapped next-stage input name, anything
    // else was already bound into the caller's response slot
    for (oname, value) in outputs {
        if mcfg.present_slot_of_output(&oname).is_some() {
            debug_assert!(
                mcfg.inter_stage_input_for(&oname).is_none(),
                "'{oname}' is both a present state and an inter-stage output"
            );
            run_state.output_val_map.insert(oname, value);
        } else if let Some(mapped) = mcfg.inter_stage_input_for(&oname) {
            token.value_names.push(mapped.to_string());
            token.values.push(value);
        }
    }

    Ok(token)
}
