//! Pipeline session orchestration
//!
//! [`PipelineSession`] owns one [`SessionState`] and one worker pool per
//! stage. [`PipelineSession::run`] seeds every request into stage 0, then
//! demultiplexes completions off the response queue: a token returning from a
//! non-terminal stage advances to the next stage; a token returning from the
//! terminal stage either finishes the request (step budget exhausted, or
//! every batch lane predicted the end-of-sequence token) or has its logits
//! turned into the next step's input ids and position ids and wraps back to
//! stage 0.
//!
//! The orchestrator thread never executes model work and blocks only on the
//! timed queue pop. Worker failures come back as tokens with the error slot
//! set; any failure aborts the whole batch after draining every stage.

mod exec;

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::decode::{greedy_next_input_ids, next_position_ids};
use crate::error::{PipelineError, Result};
use crate::frame::{
    HostBuffer, ReqId, RequestExecutionFrame, ResponseTarget, Token,
};
use crate::queue::{ResponseQueue, ResponseSender};
use crate::runtime::value::dim_at;
use crate::runtime::{MemoryInfo, ModelRuntime, ModelSession, Value};
use crate::stage::PipelineStage;

/// One compiled model session plus cached introspection
pub struct SessionState {
    /// The runtime session handle
    pub session: Arc<dyn ModelSession>,
    /// Memory descriptor for the session's device
    pub memory_info: MemoryInfo,
    /// Input names, in model order
    pub input_names: Vec<String>,
    /// Output names, in model order
    pub output_names: Vec<String>,
}

impl SessionState {
    /// Index of `name` among the model's inputs
    ///
    /// # Errors
    /// Fails if the model declares no such input.
    pub fn input_index(&self, name: &str) -> Result<usize> {
        self.input_names
            .iter()
            .position(|n| n == name)
            .ok_or_else(|| PipelineError::Config {
                reason: format!("'{name}' is not an input of the model"),
            })
    }

    /// Index of `name` among the model's outputs
    ///
    /// # Errors
    /// Fails if the model declares no such output.
    pub fn output_index(&self, name: &str) -> Result<usize> {
        self.output_names
            .iter()
            .position(|n| n == name)
            .ok_or_else(|| PipelineError::Config {
                reason: format!("'{name}' is not an output of the model"),
            })
    }
}

/// A batch request: named input tensors for step 0 of every stage-0 run
///
/// The values are borrowed in the handle sense: the engine clones the
/// handles and never consumes the caller's.
#[derive(Debug, Clone)]
pub struct PipelineRequest {
    /// Input names, parallel to `input_values`
    pub input_names: Vec<String>,
    /// Input tensors, parallel to `input_names`
    pub input_values: Vec<Value>,
}

/// Output slots for one request
///
/// For each requested name, either `output_meminfo[k]` names the device the
/// engine should allocate the output on, or `output_values[k]` carries a
/// caller-preallocated tensor to write into. On success `output_values[k]`
/// holds the produced tensor, caller-owned.
#[derive(Debug, Clone)]
pub struct PipelineResponse {
    /// Requested output names
    pub output_names: Vec<String>,
    /// Produced outputs (or caller-preallocated tensors on entry)
    pub output_values: Vec<Option<Value>>,
    /// Optional per-output target device
    pub output_meminfo: Vec<Option<MemoryInfo>>,
}

impl PipelineResponse {
    /// Request `names`, each allocated by the engine on `memory`
    #[must_use]
    pub fn on_device(names: Vec<String>, memory: MemoryInfo) -> Self {
        let n = names.len();
        PipelineResponse {
            output_names: names,
            output_values: vec![None; n],
            output_meminfo: vec![Some(memory); n],
        }
    }

    /// Request `names`, each written into the parallel preallocated tensor
    #[must_use]
    pub fn with_preallocated(names: Vec<String>, values: Vec<Value>) -> Self {
        let n = names.len();
        PipelineResponse {
            output_names: names,
            output_values: values.into_iter().map(Some).collect(),
            output_meminfo: vec![None; n],
        }
    }
}

/// Load one session per stage and cache its introspected names
///
/// Also fills each [`crate::config::ModelConfig`]'s `input_names` /
/// `output_names`, which is why the config is taken mutably.
pub(crate) fn load_session_states(
    pcfg: &mut PipelineConfig,
    runtime: &dyn ModelRuntime,
) -> Result<Vec<Arc<SessionState>>> {
    let mut session_states = Vec::with_capacity(pcfg.num_stages());
    for mcfg in &mut pcfg.model_config_vec {
        let session = runtime.load_session(&mcfg.model_file_path, mcfg.device_id)?;
        let input_names: Vec<String> = (0..session.input_count())
            .map(|i| session.input_name(i).to_string())
            .collect();
        let output_names: Vec<String> = (0..session.output_count())
            .map(|i| session.output_name(i).to_string())
            .collect();
        info!(
            model = %mcfg.model_name,
            device = mcfg.device_id,
            inputs = input_names.len(),
            outputs = output_names.len(),
            "loaded stage session"
        );
        mcfg.input_names = input_names.clone();
        mcfg.output_names = output_names.clone();
        let memory_info = session.memory_info();
        session_states.push(Arc::new(SessionState {
            session,
            memory_info,
            input_names,
            output_names,
        }));
    }
    Ok(session_states)
}

type FrameMap = HashMap<ReqId, Arc<Mutex<RequestExecutionFrame>>>;

/// The orchestrator: per-stage sessions, worker pools, and the run loop
pub struct PipelineSession {
    pcfg: Arc<PipelineConfig>,
    runtime: Arc<dyn ModelRuntime>,
    session_states: Vec<Arc<SessionState>>,
    pipeline_stages: Vec<PipelineStage>,
    next_req_id: AtomicU64,
}

impl std::fmt::Debug for PipelineSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineSession").finish_non_exhaustive()
    }
}

impl PipelineSession {
    /// Build a session from an already-parsed config
    ///
    /// Loads one runtime session per stage, introspects its names, validates
    /// every configured name against them, and spawns the per-stage worker
    /// pools.
    ///
    /// # Errors
    /// Fails on config validation or session load failure.
    pub fn new(mut pcfg: PipelineConfig, runtime: Arc<dyn ModelRuntime>) -> Result<Self> {
        pcfg.validate()?;
        let session_states = load_session_states(&mut pcfg, runtime.as_ref())?;
        pcfg.validate_resolved()?;

        let mut pipeline_stages = Vec::with_capacity(pcfg.num_stages());
        for mcfg in &pcfg.model_config_vec {
            pipeline_stages.push(PipelineStage::new(
                runtime.clone(),
                mcfg.device_id,
                mcfg.num_workers,
            )?);
        }

        Ok(PipelineSession {
            pcfg: Arc::new(pcfg),
            runtime,
            session_states,
            pipeline_stages,
            next_req_id: AtomicU64::new(0),
        })
    }

    /// Build a session from an ensemble config file
    ///
    /// # Errors
    /// Fails if the file cannot be parsed or [`Self::new`] fails.
    pub fn from_config_file(
        path: impl AsRef<Path>,
        runtime: Arc<dyn ModelRuntime>,
    ) -> Result<Self> {
        let pcfg = PipelineConfig::from_file(path)?;
        PipelineSession::new(pcfg, runtime)
    }

    /// The ensemble configuration, with introspected names filled in
    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.pcfg
    }

    /// Drive every request through every stage for `num_steps` decoding steps
    ///
    /// Blocks until every request completed (or terminated early with every
    /// batch lane at the end-of-sequence token), filling each response slot's
    /// `output_values`. The batch fails as a whole: on any error all stages
    /// are drained and the first failure is returned.
    ///
    /// # Errors
    /// See [`PipelineError`] for the failure taxonomy.
    pub fn run(
        &self,
        req_list: &[PipelineRequest],
        resp_list: &mut [PipelineResponse],
        num_steps: usize,
    ) -> Result<()> {
        validate_lists(req_list, resp_list, num_steps)?;

        let resp_queue = ResponseQueue::new();
        let mut req_frame_map: FrameMap = HashMap::new();

        if let Err(e) =
            self.setup_and_schedule_all(req_list, resp_list, num_steps, &mut req_frame_map, &resp_queue)
        {
            return Err(self.abort(e));
        }
        self.process_responses(req_list.len(), num_steps, &mut req_frame_map, &resp_queue, resp_list)
    }

    /// Seed every request into stage 0 (step 0 is the prompt prefill)
    fn setup_and_schedule_all(
        &self,
        req_list: &[PipelineRequest],
        resp_list: &[PipelineResponse],
        num_steps: usize,
        req_frame_map: &mut FrameMap,
        resp_queue: &ResponseQueue,
    ) -> Result<()> {
        let mcfg0 = &self.pcfg.model_config_vec[0];
        for (req_index, (req, resp)) in req_list.iter().zip(resp_list.iter()).enumerate() {
            let req_id = ReqId::from_raw(self.next_req_id.fetch_add(1, Ordering::Relaxed) + 1);

            // batch size and prompt length come from the shape of the input
            // that defines sequence length for stage 0
            let seq_input_pos = req
                .input_names
                .iter()
                .position(|n| *n == mcfg0.input_to_use_for_seq_len)
                .ok_or_else(|| PipelineError::InvalidArgument {
                    reason: format!(
                        "request {req_index} does not carry input '{}'",
                        mcfg0.input_to_use_for_seq_len
                    ),
                })?;
            let shape = req.input_values[seq_input_pos].shape();
            let orig_input_seq_len = dim_at(shape, mcfg0.seq_len_dim_index_in_input)?;
            let batch_size = dim_at(shape, mcfg0.batch_dim_index_in_input)?;
            if batch_size < 1 {
                return Err(PipelineError::InvalidArgument {
                    reason: format!("request {req_index} has batch size {batch_size}"),
                });
            }
            if orig_input_seq_len + num_steps as i64 - 1 > self.pcfg.max_seq_len {
                return Err(PipelineError::Config {
                    reason: format!(
                        "state buffers sized for max_seq_len {} cannot hold a {orig_input_seq_len} token prompt decoded for {num_steps} steps",
                        self.pcfg.max_seq_len
                    ),
                });
            }

            let target = ResponseTarget {
                output_names: resp.output_names.clone(),
                output_meminfo: resp.output_meminfo.clone(),
                preallocated: resp.output_values.clone(),
            };
            let frame = RequestExecutionFrame::new(
                &self.pcfg,
                &self.session_states,
                req_index,
                req_id,
                batch_size,
                orig_input_seq_len,
                target,
            )?;
            let frame = Arc::new(Mutex::new(frame));
            req_frame_map.insert(req_id, frame.clone());

            debug!(req = %req_id, batch = batch_size, prompt_len = orig_input_seq_len, "seeding request");
            let token = Token::new(req_id, 0, req.input_names.clone(), req.input_values.clone());
            self.schedule(0, token, frame, resp_queue.sender());
        }
        Ok(())
    }

    /// Enqueue one stage execution for a token onto the stage's worker pool
    fn schedule(
        &self,
        stage_id: usize,
        token: Token,
        frame: Arc<Mutex<RequestExecutionFrame>>,
        sender: ResponseSender,
    ) {
        let pcfg = self.pcfg.clone();
        let runtime = self.runtime.clone();
        let session_state = self.session_states[stage_id].clone();
        self.pipeline_stages[stage_id].schedule_task(Box::new(move || {
            let req_id = token.req_id;
            let step_id = token.step_id;
            let mut frame = lock_frame(&frame);
            let mcfg = &pcfg.model_config_vec[frame.stage_id];
            let out_token =
                match exec::execute_stage(runtime.as_ref(), mcfg, &session_state, &mut frame, token)
                {
                    Ok(token) => token,
                    Err(e) => {
                        warn!(req = %req_id, step = step_id, error = %e, "stage execution failed");
                        Token::failed(req_id, step_id, e)
                    }
                };
            drop(frame);
            sender.push(out_token);
        }));
    }

    /// Consume completions until every request terminated
    fn process_responses(
        &self,
        num_reqs: usize,
        num_steps: usize,
        req_frame_map: &mut FrameMap,
        resp_queue: &ResponseQueue,
        resp_list: &mut [PipelineResponse],
    ) -> Result<()> {
        let timeout = Duration::from_millis(self.pcfg.response_timeout_ms);
        let num_stages = self.pcfg.num_stages();
        let mut req_processed = 0usize;

        while req_processed < num_reqs {
            let mut token = match resp_queue.wait_and_pop(timeout) {
                Ok(token) => token,
                Err(e) => return Err(self.abort(e)),
            };
            // one failed request fails the whole batch
            if let Some(error) = token.error.take() {
                return Err(self.abort(error));
            }

            let Some(frame_arc) = req_frame_map.get(&token.req_id).cloned() else {
                return Err(self.abort(PipelineError::RuntimeFailure {
                    reason: format!("response for unknown request {}", token.req_id),
                }));
            };
            let mut frame = lock_frame(&frame_arc);
            frame.stage_id = (frame.stage_id + 1) % num_stages;

            if frame.stage_id == 0 {
                // wrapped around: one full decoding step finished
                token.step_id += 1;
                if token.step_id == num_steps {
                    let req_index = frame.req_index;
                    drop(frame);
                    if let Err(e) = copy_final_output(&token, &mut resp_list[req_index]) {
                        return Err(self.abort(e));
                    }
                    req_frame_map.remove(&token.req_id);
                    req_processed += 1;
                    continue;
                }

                match self.prepare_next_step(&mut frame, &mut token) {
                    Ok(StepOutcome::Continue) => {}
                    Ok(StepOutcome::AllLanesEos) => {
                        info!(req = %token.req_id, step = token.step_id,
                              "every batch lane predicted the eos token; finishing early");
                        let req_index = frame.req_index;
                        drop(frame);
                        if let Err(e) = copy_final_output(&token, &mut resp_list[req_index]) {
                            return Err(self.abort(e));
                        }
                        req_frame_map.remove(&token.req_id);
                        req_processed += 1;
                        continue;
                    }
                    Err(e) => {
                        drop(frame);
                        return Err(self.abort(e));
                    }
                }
            }
            // a token from a non-terminal stage already carries the payload
            // for its successor

            let next_stage = frame.stage_id;
            drop(frame);
            self.schedule(next_stage, token, frame_arc, resp_queue.sender());
        }
        Ok(())
    }

    /// Turn the terminal stage's logits into the next step's inputs
    fn prepare_next_step(
        &self,
        frame: &mut MutexGuard<'_, RequestExecutionFrame>,
        token: &mut Token,
    ) -> Result<StepOutcome> {
        let pcfg = &self.pcfg;
        let logits_pos = token.find(&pcfg.logits_name).ok_or_else(|| {
            PipelineError::MissingOutput {
                name: pcfg.logits_name.clone(),
            }
        })?;
        let logits = &token.values[logits_pos];
        let batch_size = frame.batch_size;
        let (input_ids, all_eos) =
            greedy_next_input_ids(batch_size as usize, pcfg.eos_token, logits)?;
        if all_eos {
            return Ok(StepOutcome::AllLanesEos);
        }

        let shape = vec![batch_size, 1];
        let ids_buffer = frame
            .next_step_input_buffers
            .entry(pcfg.input_ids_name.clone())
            .or_insert_with(HostBuffer::default);
        ids_buffer.data = input_ids;
        ids_buffer.shape = shape.clone();
        let ids_value = Value::from_i64s(MemoryInfo::Cpu, &ids_buffer.shape, &ids_buffer.data)?;

        let posn_ids =
            next_position_ids(batch_size as usize, frame.orig_input_seq_len, token.step_id);
        let posn_buffer = frame
            .next_step_input_buffers
            .entry(pcfg.position_ids_name.clone())
            .or_insert_with(HostBuffer::default);
        posn_buffer.data = posn_ids;
        posn_buffer.shape = shape;
        let posn_value = Value::from_i64s(MemoryInfo::Cpu, &posn_buffer.shape, &posn_buffer.data)?;

        debug!(req = %token.req_id, step = token.step_id, posn = posn_buffer.data[0],
               "regenerated next-step inputs");
        token.value_names = vec![pcfg.input_ids_name.clone(), pcfg.position_ids_name.clone()];
        token.values = vec![ids_value, posn_value];
        Ok(StepOutcome::Continue)
    }

    /// Drain every stage and hand the failure back
    fn abort(&self, error: PipelineError) -> PipelineError {
        warn!(error = %error, "aborting batch; draining all stages");
        for stage in &self.pipeline_stages {
            stage.drain_all_inflight_requests();
        }
        error
    }
}

enum StepOutcome {
    Continue,
    AllLanesEos,
}

/// Transfer the requested outputs from the final token into the response slot
fn copy_final_output(token: &Token, resp: &mut PipelineResponse) -> Result<()> {
    for (resp_index, oname) in resp.output_names.iter().enumerate() {
        match token.find(oname) {
            Some(pos) => resp.output_values[resp_index] = Some(token.values[pos].clone()),
            None => {
                return Err(PipelineError::MissingOutput {
                    name: oname.clone(),
                })
            }
        }
    }
    Ok(())
}

fn validate_lists(
    req_list: &[PipelineRequest],
    resp_list: &[PipelineResponse],
    num_steps: usize,
) -> Result<()> {
    if num_steps == 0 {
        return Err(PipelineError::InvalidArgument {
            reason: "num_steps must be at least 1".to_string(),
        });
    }
    if req_list.len() != resp_list.len() {
        return Err(PipelineError::InvalidArgument {
            reason: format!(
                "request and response lists differ in length ({} vs {})",
                req_list.len(),
                resp_list.len()
            ),
        });
    }
    for (idx, req) in req_list.iter().enumerate() {
        if req.input_names.len() != req.input_values.len() {
            return Err(PipelineError::InvalidArgument {
                reason: format!("request {idx} has mismatched input name and value lists"),
            });
        }
    }
    for (idx, resp) in resp_list.iter().enumerate() {
        if resp.output_names.len() != resp.output_values.len()
            || resp.output_names.len() != resp.output_meminfo.len()
        {
            return Err(PipelineError::InvalidArgument {
                reason: format!("response {idx} has mismatched output name and value lists"),
            });
        }
    }
    Ok(())
}

fn lock_frame(
    frame: &Arc<Mutex<RequestExecutionFrame>>,
) -> MutexGuard<'_, RequestExecutionFrame> {
    frame.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(names: &[&str]) -> PipelineRequest {
        PipelineRequest {
            input_names: names.iter().map(|s| (*s).to_string()).collect(),
            input_values: names
                .iter()
                .map(|_| Value::from_i64s(MemoryInfo::Cpu, &[1, 1], &[0]).unwrap())
                .collect(),
        }
    }

    #[test]
    fn test_validate_rejects_zero_steps() {
        let err = validate_lists(&[], &[], 0).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidArgument { .. }));
    }

    #[test]
    fn test_validate_rejects_length_mismatch() {
        let reqs = vec![request(&["input_ids"]); 3];
        let mut resps = vec![
            PipelineResponse::on_device(vec!["logits".to_string()], MemoryInfo::Accelerator(0));
            2
        ];
        let err = validate_lists(&reqs, &resps, 1).unwrap_err();
        assert!(err.to_string().contains("differ in length"));
        let extra = resps[0].clone();
        resps.push(extra);
        validate_lists(&reqs, &resps, 1).unwrap();
    }

    #[test]
    fn test_validate_rejects_slot_mismatch() {
        let mut req = request(&["input_ids"]);
        req.input_values.pop();
        let resps = vec![PipelineResponse::on_device(
            vec!["logits".to_string()],
            MemoryInfo::Accelerator(0),
        )];
        let err = validate_lists(&[req], &resps, 1).unwrap_err();
        assert!(err.to_string().contains("mismatched input"));
    }

    #[test]
    fn test_copy_final_output_reports_missing_name() {
        let token = Token::new(ReqId::from_raw(1), 1, vec!["logits".to_string()], vec![
            Value::from_i64s(MemoryInfo::Cpu, &[1], &[0]).unwrap(),
        ]);
        let mut resp = PipelineResponse::on_device(
            vec!["logits".to_string(), "scores".to_string()],
            MemoryInfo::Accelerator(0),
        );
        let err = copy_final_output(&token, &mut resp).unwrap_err();
        assert_eq!(
            err,
            PipelineError::MissingOutput {
                name: "scores".to_string()
            }
        );
        // the name that was present got transferred before the failure
        assert!(resp.output_values[0].is_some());
    }
}
