//! Property tests: config serialisation round-trip and greedy argmax

use proptest::prelude::*;

use cadena::decode::greedy_next_input_ids;
use cadena::runtime::MemoryInfo;
use cadena::testing::f16_value;
use cadena::{ModelConfig, PipelineConfig};

fn name() -> impl Strategy<Value = String> {
    "[a-z_]{1,12}"
}

prop_compose! {
    fn arb_model_config()(
        model_name in name(),
        model_file_path in "[a-z]{1,8}\\.onnx",
        input_to_use_for_seq_len in name(),
        seq_len_dim_index_in_input in 0usize..4,
        batch_dim_index_in_input in 0usize..4,
        batch_dim_index_in_state in 0usize..4,
        seq_len_dim_index_in_state in 0usize..4,
        seq_len_dim_in_inter_stage_output in 0usize..4,
        batch_dim_in_inter_stage_output in 0usize..4,
        device_id in 0i32..8,
        state_names in prop::collection::vec(name(), 1..4),
        inter_stage_output_input_map in prop::collection::vec((name(), name()), 0..3),
        num_workers in 1usize..4,
    ) -> ModelConfig {
        ModelConfig {
            model_name,
            model_file_path,
            input_to_use_for_seq_len,
            seq_len_dim_index_in_input,
            batch_dim_index_in_input,
            batch_dim_index_in_state,
            seq_len_dim_index_in_state,
            seq_len_dim_in_inter_stage_output,
            batch_dim_in_inter_stage_output,
            device_id,
            inter_stage_output_input_map,
            past_input_names: state_names.iter().map(|n| format!("past_{n}")).collect(),
            present_output_names: state_names.iter().map(|n| format!("present_{n}")).collect(),
            num_workers,
            input_names: Vec::new(),
            output_names: Vec::new(),
        }
    }
}

prop_compose! {
    fn arb_pipeline_config()(
        eos_token in 0i64..100_000,
        max_seq_len in 1i64..4096,
        response_timeout_ms in 1u64..60_000,
        model_config_vec in prop::collection::vec(arb_model_config(), 1..4),
    ) -> PipelineConfig {
        PipelineConfig {
            eos_token,
            input_ids_name: "input_ids".to_string(),
            position_ids_name: "position_ids".to_string(),
            logits_name: "logits".to_string(),
            max_seq_len,
            response_timeout_ms,
            model_config_vec,
        }
    }
}

proptest! {
    #[test]
    fn config_roundtrips_through_json(config in arb_pipeline_config()) {
        let text = serde_json::to_string(&config).unwrap();
        let reparsed: PipelineConfig = serde_json::from_str(&text).unwrap();
        prop_assert_eq!(config, reparsed);
    }

    #[test]
    fn greedy_argmax_matches_a_first_wins_reference(
        // small integers are exactly representable in f16, so the reference
        // can run on the unquantised values
        vals in prop::collection::vec(-100i32..100, 1..64),
    ) {
        let floats: Vec<f32> = vals.iter().map(|v| *v as f32).collect();
        let vocab = floats.len() as i64;
        let logits = f16_value(MemoryInfo::Cpu, &[1, 1, vocab], &floats);

        let mut expected = 0usize;
        for (idx, v) in floats.iter().enumerate() {
            if *v > floats[expected] {
                expected = idx;
            }
        }

        let (ids, _) = greedy_next_input_ids(1, -1, &logits).unwrap();
        prop_assert_eq!(ids, vec![expected as i64]);
    }
}
