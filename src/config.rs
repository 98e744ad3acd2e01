//! Ensemble configuration
//!
//! A [`PipelineConfig`] describes a model ensemble split into pipeline
//! stages: one [`ModelConfig`] per stage, in pipeline order, plus the
//! canonical tensor names the orchestrator injects and reads between
//! decoding steps. Configs load from JSON:
//!
//! ```json
//! {
//!   "eos_token": 50256,
//!   "input_ids_name": "input_ids",
//!   "position_ids_name": "position_ids",
//!   "logits_name": "logits",
//!   "max_seq_len": 128,
//!   "ensemble": [ { "model_name": "...", ... }, ... ]
//! }
//! ```
//!
//! Validation happens in two phases: [`PipelineConfig::validate`] checks the
//! parsed structure, and a second pass after session load checks every
//! referenced tensor name against the models' introspected names.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

fn default_response_timeout_ms() -> u64 {
    10_000
}

fn default_num_workers() -> usize {
    1
}

/// Per-stage model description
///
/// `past_input_names[i]` and `present_output_names[i]` name the same
/// recurrent-state slot: the tensor produced under the present name at step
/// *t* feeds the past input at step *t+1*.
///
/// `inter_stage_output_input_map` routes this stage's outputs to the next
/// stage's inputs within a step. Any input of the next stage that is neither
/// a past-state input nor a value carried by the step-0 request must appear
/// among this map's targets; the terminal stage maps its caller-visible
/// outputs (typically the logits) to themselves so they reach the
/// orchestrator between steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Stage name, for logs and diagnostics
    pub model_name: String,
    /// Path of the compiled model file handed to the runtime
    pub model_file_path: String,
    /// The input whose sequence-length dimension defines this step's input length
    pub input_to_use_for_seq_len: String,
    /// Sequence-length dimension index on that input
    pub seq_len_dim_index_in_input: usize,
    /// Batch dimension index on that input
    pub batch_dim_index_in_input: usize,
    /// Batch dimension index inside every past/present state tensor
    pub batch_dim_index_in_state: usize,
    /// Sequence-length dimension index inside every past/present state tensor
    pub seq_len_dim_index_in_state: usize,
    /// Sequence-length dimension index inside inter-stage output tensors
    pub seq_len_dim_in_inter_stage_output: usize,
    /// Batch dimension index inside inter-stage output tensors
    pub batch_dim_in_inter_stage_output: usize,
    /// Device ordinal this stage is pinned to
    pub device_id: i32,
    /// Pairs of (output of this stage, input of the next stage)
    #[serde(default)]
    pub inter_stage_output_input_map: Vec<(String, String)>,
    /// Recurrent-state input names; parallel to `present_output_names`
    #[serde(default)]
    pub past_input_names: Vec<String>,
    /// Recurrent-state output names; parallel to `past_input_names`
    #[serde(default)]
    pub present_output_names: Vec<String>,
    /// Worker-pool size for this stage's device queue
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,
    /// Input names introspected from the compiled model after load
    #[serde(skip)]
    pub input_names: Vec<String>,
    /// Output names introspected from the compiled model after load
    #[serde(skip)]
    pub output_names: Vec<String>,
}

impl ModelConfig {
    /// Slot index of `name` among the past-state inputs
    #[must_use]
    pub fn past_slot_of_input(&self, name: &str) -> Option<usize> {
        self.past_input_names.iter().position(|n| n == name)
    }

    /// Slot index of `name` among the present-state outputs
    #[must_use]
    pub fn present_slot_of_output(&self, name: &str) -> Option<usize> {
        self.present_output_names.iter().position(|n| n == name)
    }

    /// Next-stage input name that `output_name` is routed to
    #[must_use]
    pub fn inter_stage_input_for(&self, output_name: &str) -> Option<&str> {
        self.inter_stage_output_input_map
            .iter()
            .find(|(out, _)| out == output_name)
            .map(|(_, input)| input.as_str())
    }
}

/// Ensemble description, immutable after load
///
/// The order of `model_config_vec` defines the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Token id that terminates a request early once every batch lane predicts it
    pub eos_token: i64,
    /// Name under which regenerated input ids are injected at step > 0
    pub input_ids_name: String,
    /// Name under which regenerated position ids are injected at step > 0
    pub position_ids_name: String,
    /// Output name the orchestrator reads next-token logits from
    pub logits_name: String,
    /// Upper bound used to size preallocated recurrent-state buffers
    pub max_seq_len: i64,
    /// How long the response loop waits for any stage to complete
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
    /// Per-stage model configs, in pipeline order
    #[serde(rename = "ensemble")]
    pub model_config_vec: Vec<ModelConfig>,
}

impl PipelineConfig {
    /// Parse a config from JSON text and validate its structure
    ///
    /// # Errors
    /// Fails on malformed JSON, missing fields, or structural inconsistency.
    pub fn from_json(text: &str) -> Result<Self> {
        let config: PipelineConfig =
            serde_json::from_str(text).map_err(|e| PipelineError::Config {
                reason: format!("failed to parse ensemble config: {e}"),
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Load a config from a JSON file
    ///
    /// # Errors
    /// Fails if the file cannot be read or [`Self::from_json`] fails.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| PipelineError::Config {
            reason: format!("failed to read {}: {e}", path.display()),
        })?;
        Self::from_json(&text)
    }

    /// Number of pipeline stages
    #[must_use]
    pub fn num_stages(&self) -> usize {
        self.model_config_vec.len()
    }

    /// Validate the parsed structure, before any model is loaded
    ///
    /// # Errors
    /// Fails on an empty ensemble, a non-positive `max_seq_len`, unpaired
    /// state name lists, a stateless stage, an idle worker pool, or a name
    /// declared both as a present state and as an inter-stage output.
    pub fn validate(&self) -> Result<()> {
        if self.model_config_vec.is_empty() {
            return Err(PipelineError::Config {
                reason: "ensemble is empty".to_string(),
            });
        }
        if self.max_seq_len < 1 {
            return Err(PipelineError::Config {
                reason: format!("max_seq_len must be positive, got {}", self.max_seq_len),
            });
        }
        for mcfg in &self.model_config_vec {
            if mcfg.past_input_names.len() != mcfg.present_output_names.len() {
                return Err(PipelineError::Config {
                    reason: format!(
                        "stage '{}' declares {} past inputs but {} present outputs",
                        mcfg.model_name,
                        mcfg.past_input_names.len(),
                        mcfg.present_output_names.len()
                    ),
                });
            }
            if mcfg.past_input_names.is_empty() {
                return Err(PipelineError::Config {
                    reason: format!(
                        "stage '{}' declares no recurrent-state slots",
                        mcfg.model_name
                    ),
                });
            }
            if mcfg.num_workers == 0 {
                return Err(PipelineError::Config {
                    reason: format!("stage '{}' declares zero workers", mcfg.model_name),
                });
            }
            for (out, _) in &mcfg.inter_stage_output_input_map {
                if mcfg.present_slot_of_output(out).is_some() {
                    return Err(PipelineError::Config {
                        reason: format!(
                            "stage '{}': '{out}' is both a present state and an inter-stage output",
                            mcfg.model_name
                        ),
                    });
                }
            }
        }
        Ok(())
    }

    /// Validate every referenced name against the introspected name lists
    ///
    /// Call after `input_names`/`output_names` are filled from the loaded
    /// sessions.
    pub(crate) fn validate_resolved(&self) -> Result<()> {
        for (idx, mcfg) in self.model_config_vec.iter().enumerate() {
            let stage = &mcfg.model_name;
            if !mcfg.input_names.contains(&mcfg.input_to_use_for_seq_len) {
                return Err(PipelineError::Config {
                    reason: format!(
                        "stage '{stage}': sequence-length input '{}' is not a model input",
                        mcfg.input_to_use_for_seq_len
                    ),
                });
            }
            for name in &mcfg.past_input_names {
                if !mcfg.input_names.contains(name) {
                    return Err(PipelineError::Config {
                        reason: format!(
                            "stage '{stage}': past input '{name}' is not a model input"
                        ),
                    });
                }
            }
            for name in &mcfg.present_output_names {
                if !mcfg.output_names.contains(name) {
                    return Err(PipelineError::Config {
                        reason: format!(
                            "stage '{stage}': present output '{name}' is not a model output"
                        ),
                    });
                }
            }
            for (out, input) in &mcfg.inter_stage_output_input_map {
                if !mcfg.output_names.contains(out) {
                    return Err(PipelineError::Config {
                        reason: format!(
                            "stage '{stage}': inter-stage output '{out}' is not a model output"
                        ),
                    });
                }
                // the terminal stage's targets wrap to the orchestrator, not
                // to a model, so only non-terminal targets resolve to inputs
                if idx + 1 < self.model_config_vec.len() {
                    let next = &self.model_config_vec[idx + 1];
                    if !next.input_names.contains(input) {
                        return Err(PipelineError::Config {
                            reason: format!(
                                "stage '{stage}': inter-stage target '{input}' is not an input of stage '{}'",
                                next.model_name
                            ),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const TWO_STAGE_JSON: &str = r#"{
        "eos_token": 50256,
        "input_ids_name": "input_ids",
        "position_ids_name": "position_ids",
        "logits_name": "logits",
        "max_seq_len": 32,
        "ensemble": [
            {
                "model_name": "encoder",
                "model_file_path": "encoder.onnx",
                "input_to_use_for_seq_len": "input_ids",
                "seq_len_dim_index_in_input": 1,
                "batch_dim_index_in_input": 0,
                "batch_dim_index_in_state": 0,
                "seq_len_dim_index_in_state": 1,
                "seq_len_dim_in_inter_stage_output": 1,
                "batch_dim_in_inter_stage_output": 0,
                "device_id": 0,
                "inter_stage_output_input_map": [["hidden_states", "input_hidden_states"]],
                "past_input_names": ["past_0"],
                "present_output_names": ["present_0"]
            },
            {
                "model_name": "decoder",
                "model_file_path": "decoder.onnx",
                "input_to_use_for_seq_len": "input_hidden_states",
                "seq_len_dim_index_in_input": 1,
                "batch_dim_index_in_input": 0,
                "batch_dim_index_in_state": 0,
                "seq_len_dim_index_in_state": 1,
                "seq_len_dim_in_inter_stage_output": 1,
                "batch_dim_in_inter_stage_output": 0,
                "device_id": 1,
                "inter_stage_output_input_map": [["logits", "logits"]],
                "past_input_names": ["past_1"],
                "present_output_names": ["present_1"]
            }
        ]
    }"#;

    #[test]
    fn test_parse_two_stage_config() {
        let config = PipelineConfig::from_json(TWO_STAGE_JSON).unwrap();
        assert_eq!(config.num_stages(), 2);
        assert_eq!(config.eos_token, 50256);
        assert_eq!(config.max_seq_len, 32);
        assert_eq!(config.model_config_vec[0].model_name, "encoder");
        assert_eq!(config.model_config_vec[1].device_id, 1);
        assert_eq!(
            config.model_config_vec[0].inter_stage_input_for("hidden_states"),
            Some("input_hidden_states")
        );
        assert_eq!(config.model_config_vec[0].inter_stage_input_for("nope"), None);
    }

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::from_json(TWO_STAGE_JSON).unwrap();
        assert_eq!(config.response_timeout_ms, 10_000);
        assert_eq!(config.model_config_vec[0].num_workers, 1);
    }

    #[test]
    fn test_missing_field_is_config_error() {
        let err = PipelineConfig::from_json(r#"{"eos_token": 1}"#).unwrap_err();
        assert!(matches!(err, PipelineError::Config { .. }));
    }

    #[test]
    fn test_unpaired_state_names_rejected() {
        let mut config = PipelineConfig::from_json(TWO_STAGE_JSON).unwrap();
        config.model_config_vec[0]
            .past_input_names
            .push("past_extra".to_string());
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("past inputs"));
    }

    #[test]
    fn test_stateless_stage_rejected() {
        let mut config = PipelineConfig::from_json(TWO_STAGE_JSON).unwrap();
        config.model_config_vec[0].past_input_names.clear();
        config.model_config_vec[0].present_output_names.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_state_and_inter_stage_overlap_rejected() {
        let mut config = PipelineConfig::from_json(TWO_STAGE_JSON).unwrap();
        config.model_config_vec[0]
            .inter_stage_output_input_map
            .push(("present_0".to_string(), "past_1".to_string()));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_ensemble_rejected() {
        let err = PipelineConfig::from_json(
            r#"{"eos_token": 1, "input_ids_name": "i", "position_ids_name": "p",
                "logits_name": "l", "max_seq_len": 8, "ensemble": []}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("empty"));
    }

    #[test]
    fn test_serialised_config_reparses_equal() {
        let config = PipelineConfig::from_json(TWO_STAGE_JSON).unwrap();
        let text = serde_json::to_string(&config).unwrap();
        let reparsed = PipelineConfig::from_json(&text).unwrap();
        assert_eq!(config, reparsed);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(TWO_STAGE_JSON.as_bytes()).unwrap();
        let config = PipelineConfig::from_file(file.path()).unwrap();
        assert_eq!(config.num_stages(), 2);
    }

    #[test]
    fn test_from_missing_file() {
        let err = PipelineConfig::from_file("/nonexistent/ensemble.json").unwrap_err();
        assert!(matches!(err, PipelineError::Config { .. }));
    }

    #[test]
    fn test_validate_resolved_checks_names() {
        let mut config = PipelineConfig::from_json(TWO_STAGE_JSON).unwrap();
        for mcfg in &mut config.model_config_vec {
            mcfg.input_names = vec![
                "input_ids".to_string(),
                "position_ids".to_string(),
                "input_hidden_states".to_string(),
                "past_0".to_string(),
                "past_1".to_string(),
            ];
            mcfg.output_names = vec![
                "hidden_states".to_string(),
                "logits".to_string(),
                "present_0".to_string(),
                "present_1".to_string(),
            ];
        }
        config.validate_resolved().unwrap();

        config.model_config_vec[1].present_output_names = vec!["present_missing".to_string()];
        let err = config.validate_resolved().unwrap_err();
        assert!(err.to_string().contains("present_missing"));
    }

    #[test]
    fn test_validate_resolved_checks_next_stage_inputs() {
        let mut config = PipelineConfig::from_json(TWO_STAGE_JSON).unwrap();
        for mcfg in &mut config.model_config_vec {
            mcfg.input_names = vec![
                "input_ids".to_string(),
                "position_ids".to_string(),
                "past_0".to_string(),
                "past_1".to_string(),
            ];
            mcfg.output_names = vec![
                "hidden_states".to_string(),
                "logits".to_string(),
                "present_0".to_string(),
                "present_1".to_string(),
            ];
        }
        // "input_hidden_states" is no longer an input of the decoder
        let err = config.validate_resolved().unwrap_err();
        assert!(err.to_string().contains("input_hidden_states"));
    }
}
