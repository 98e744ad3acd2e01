//! # Cadena
//!
//! Pipeline-parallel autoregressive decoding across a multi-device model
//! ensemble.
//!
//! An ensemble is a chain of compiled models (stages), each pinned to its own
//! accelerator. Cadena drives a batch of requests through every stage once
//! per decoding step, reusing device-resident key/value state buffers across
//! steps and overlapping different requests across stages.
//!
//! ## Architecture
//!
//! - [`config::PipelineConfig`] — the ensemble description: stage order,
//!   device placement, recurrent-state name pairs, inter-stage tensor
//!   routing, and the canonical names injected between steps.
//! - [`runtime`] — the capability set Cadena consumes from an external
//!   inference runtime: session loading, shape/type introspection, I/O
//!   binding, synchronous `run`, arena allocation, and a thread-current
//!   device setter.
//! - [`frame::RequestExecutionFrame`] — per-request durable state: one I/O
//!   binding, a ping-pong pair of preallocated state buffers per recurrent
//!   slot, and preallocated inter-stage activation buffers, per stage.
//! - [`stage::PipelineStage`] — a FIFO worker pool pinned to one device.
//! - [`session::PipelineSession`] — the orchestrator: seeds requests into
//!   stage 0, demultiplexes completions, advances each request to its next
//!   stage or next step, derives next-step inputs by greedy argmax, and
//!   finishes requests at the step budget or when every batch lane predicts
//!   the end-of-sequence token.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use cadena::{PipelineSession, PipelineRequest, PipelineResponse};
//! use cadena::runtime::MemoryInfo;
//!
//! let session = PipelineSession::from_config_file("ensemble.json", runtime)?;
//! let request = PipelineRequest { input_names, input_values };
//! let mut responses = vec![PipelineResponse::on_device(
//!     vec!["logits".to_string()],
//!     MemoryInfo::Accelerator(1),
//! )];
//! session.run(&[request], &mut responses, 64)?;
//! ```
//!
//! The engine performs no sampling beyond greedy argmax and no graph
//! execution of its own; see [`testing`] for the in-memory runtime the test
//! suite drives everything with.

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
// shapes and dim indices cross the runtime boundary as i64
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_possible_wrap)]

pub mod config;
pub mod decode;
pub mod error;
pub mod frame;
pub mod queue;
pub mod runtime;
pub mod session;
pub mod stage;
pub mod testing;

// Re-exports for convenience
pub use config::{ModelConfig, PipelineConfig};
pub use error::{PipelineError, Result};
pub use session::{PipelineRequest, PipelineResponse, PipelineSession};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
