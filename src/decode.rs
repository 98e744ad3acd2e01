//! Greedy next-token and position-id derivation between decoding steps
//!
//! After the final stage of each step, the orchestrator turns the logits
//! tensor into the next step's `input_ids` and `position_ids`. Sampling is
//! greedy argmax only; comparison happens in f32 after widening from the
//! tensor's native element type, and ties resolve to the lowest index.

use half::f16;

use crate::error::{PipelineError, Result};
use crate::runtime::{ElementType, Value};

/// Derive next-step input ids from last-stage logits
///
/// For each batch lane, takes the argmax over the vocabulary slice of the
/// last time step (`[lane, seq_len - 1, ..]`). Returns the ids plus a flag
/// set when every lane predicted `eos_token`.
///
/// # Errors
/// Fails if the logits are not rank 3, their batch dim disagrees with
/// `batch_size`, or the element type has no argmax support.
pub fn greedy_next_input_ids(
    batch_size: usize,
    eos_token: i64,
    logits: &Value,
) -> Result<(Vec<i64>, bool)> {
    let shape = logits.shape();
    if shape.len() != 3 {
        return Err(PipelineError::RuntimeFailure {
            reason: format!("expected rank-3 logits [batch, seq, vocab], got {shape:?}"),
        });
    }
    let (batch, seq_len, vocab) = (shape[0] as usize, shape[1] as usize, shape[2] as usize);
    if batch != batch_size {
        return Err(PipelineError::RuntimeFailure {
            reason: format!("logits batch dim {batch} does not match request batch {batch_size}"),
        });
    }
    if seq_len == 0 || vocab == 0 {
        return Err(PipelineError::RuntimeFailure {
            reason: format!("degenerate logits shape {shape:?}"),
        });
    }

    let dtype = logits.dtype();
    let ids = logits.with_bytes(|bytes| -> Result<Vec<i64>> {
        let mut ids = Vec::with_capacity(batch);
        for lane in 0..batch {
            let base = (lane * seq_len + (seq_len - 1)) * vocab;
            ids.push(argmax_at(bytes, dtype, base, vocab)?);
        }
        Ok(ids)
    })?;

    let num_eos = ids.iter().filter(|&&id| id == eos_token).count();
    let all_eos = num_eos == batch_size;
    Ok((ids, all_eos))
}

/// Argmax over `vocab` elements starting at element offset `base`
fn argmax_at(bytes: &[u8], dtype: ElementType, base: usize, vocab: usize) -> Result<i64> {
    let read = |idx: usize| -> Result<f32> {
        match dtype {
            ElementType::F16 => {
                let at = idx * 2;
                Ok(f16::from_bits(u16::from_le_bytes([bytes[at], bytes[at + 1]])).to_f32())
            }
            ElementType::F32 => {
                let at = idx * 4;
                Ok(f32::from_le_bytes([
                    bytes[at],
                    bytes[at + 1],
                    bytes[at + 2],
                    bytes[at + 3],
                ]))
            }
            other => Err(PipelineError::RuntimeFailure {
                reason: format!("argmax is not supported over {other} logits"),
            }),
        }
    };

    let mut best_idx = 0i64;
    let mut best = f32::NEG_INFINITY;
    for j in 0..vocab {
        let val = read(base + j)?;
        // strict compare keeps the lowest index on ties
        if val > best {
            best = val;
            best_idx = j as i64;
        }
    }
    Ok(best_idx)
}

/// Position ids for the step's single new token
///
/// Every lane is at the same temporal position by design:
/// `orig_input_seq_len + step_id - 1`.
#[must_use]
pub fn next_position_ids(batch_size: usize, orig_input_seq_len: i64, step_id: usize) -> Vec<i64> {
    let posn = orig_input_seq_len + step_id as i64 - 1;
    vec![posn; batch_size]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::MemoryInfo;
    use crate::testing::f16_value;

    fn logits(batch: i64, seq: i64, vals: &[f32]) -> Value {
        let vocab = vals.len() as i64 / (batch * seq);
        f16_value(MemoryInfo::Cpu, &[batch, seq, vocab], vals)
    }

    // ========================================================================
    // Argmax over the last time step
    // ========================================================================

    #[test]
    fn test_argmax_basic() {
        let v = logits(1, 1, &[1.0, 2.0, 3.0, 4.0, 5.0]);
        let (ids, all_eos) = greedy_next_input_ids(1, 99, &v).unwrap();
        assert_eq!(ids, vec![4]);
        assert!(!all_eos);
    }

    #[test]
    fn test_argmax_first_element() {
        let v = logits(1, 1, &[10.0, 1.0, 2.0, 3.0]);
        assert_eq!(greedy_next_input_ids(1, 99, &v).unwrap().0, vec![0]);
    }

    #[test]
    fn test_argmax_negatives() {
        let v = logits(1, 1, &[-5.0, -2.0, -1.0, -10.0]);
        assert_eq!(greedy_next_input_ids(1, 99, &v).unwrap().0, vec![2]);
    }

    #[test]
    fn test_argmax_tie_takes_lowest_index() {
        let v = logits(1, 1, &[0.0, 5.0, 5.0, 5.0]);
        assert_eq!(greedy_next_input_ids(1, 99, &v).unwrap().0, vec![1]);
    }

    #[test]
    fn test_argmax_uses_last_time_step_only() {
        // seq len 2: first position peaks at 0, last position at 3
        let v = logits(1, 2, &[9.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 9.0]);
        assert_eq!(greedy_next_input_ids(1, 99, &v).unwrap().0, vec![3]);
    }

    #[test]
    fn test_argmax_per_batch_lane() {
        let v = logits(2, 1, &[0.0, 1.0, 0.0, /* lane 1 */ 1.0, 0.0, 0.0]);
        assert_eq!(greedy_next_input_ids(2, 99, &v).unwrap().0, vec![1, 0]);
    }

    #[test]
    fn test_f32_logits_supported() {
        let data: Vec<u8> = [0.0f32, 7.0, 1.0]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        let v = Value::from_le_bytes(MemoryInfo::Cpu, ElementType::F32, &[1, 1, 3], &data).unwrap();
        assert_eq!(greedy_next_input_ids(1, 99, &v).unwrap().0, vec![1]);
    }

    #[test]
    fn test_integer_logits_rejected() {
        let v = Value::from_i64s(MemoryInfo::Cpu, &[1, 1, 2], &[1, 2]).unwrap();
        assert!(greedy_next_input_ids(1, 99, &v).is_err());
    }

    // ========================================================================
    // EOS detection
    // ========================================================================

    #[test]
    fn test_all_lanes_eos() {
        let v = logits(2, 1, &[0.0, 0.0, 1.0, 0.0, 0.0, 1.0]);
        let (ids, all_eos) = greedy_next_input_ids(2, 2, &v).unwrap();
        assert_eq!(ids, vec![2, 2]);
        assert!(all_eos);
    }

    #[test]
    fn test_partial_eos_does_not_terminate() {
        let v = logits(2, 1, &[0.0, 0.0, 1.0, 1.0, 0.0, 0.0]);
        let (ids, all_eos) = greedy_next_input_ids(2, 2, &v).unwrap();
        assert_eq!(ids, vec![2, 0]);
        assert!(!all_eos);
    }

    // ========================================================================
    // Shape handling
    // ========================================================================

    #[test]
    fn test_rank_mismatch_rejected() {
        let v = f16_value(MemoryInfo::Cpu, &[2, 3], &[0.0; 6]);
        assert!(greedy_next_input_ids(2, 99, &v).is_err());
    }

    #[test]
    fn test_batch_mismatch_rejected() {
        let v = logits(2, 1, &[0.0, 1.0, 0.0, 1.0]);
        assert!(greedy_next_input_ids(3, 99, &v).is_err());
    }

    // ========================================================================
    // Position ids
    // ========================================================================

    #[test]
    fn test_position_ids_advance_by_one_per_step() {
        assert_eq!(next_position_ids(2, 5, 1), vec![5, 5]);
        assert_eq!(next_position_ids(2, 5, 2), vec![6, 6]);
        assert_eq!(next_position_ids(1, 3, 4), vec![6]);
    }
}
