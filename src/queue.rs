//! Response queue between stage workers and the orchestrator
//!
//! A blocking MPSC queue of [`Token`]s with a timed pop. Workers push
//! completions through cloned [`ResponseSender`]s; the orchestrator is the
//! sole consumer. A push after the orchestrator aborted the batch is
//! silently dropped.

use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

use crate::error::{PipelineError, Result};
use crate::frame::Token;

/// Sending half handed to stage workers
#[derive(Debug, Clone)]
pub struct ResponseSender {
    tx: Sender<Token>,
}

impl ResponseSender {
    /// Push a completed (or failed) token back to the orchestrator
    pub fn push(&self, token: Token) {
        // receiver gone means the batch already aborted; nothing to do
        let _ = self.tx.send(token);
    }
}

/// Blocking MPSC queue of tokens, consumed by the orchestrator
#[derive(Debug)]
pub struct ResponseQueue {
    tx: Sender<Token>,
    rx: Receiver<Token>,
}

impl ResponseQueue {
    /// Create an empty queue
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = channel();
        ResponseQueue { tx, rx }
    }

    /// Clone a sender for a worker
    #[must_use]
    pub fn sender(&self) -> ResponseSender {
        ResponseSender {
            tx: self.tx.clone(),
        }
    }

    /// Block until a token arrives or the timeout expires
    ///
    /// # Errors
    /// Returns [`PipelineError::Timeout`] when the timeout expires.
    pub fn wait_and_pop(&self, timeout: Duration) -> Result<Token> {
        match self.rx.recv_timeout(timeout) {
            Ok(token) => Ok(token),
            Err(RecvTimeoutError::Timeout) => Err(PipelineError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            }),
            // unreachable while `self.tx` is alive; kept for completeness
            Err(RecvTimeoutError::Disconnected) => Err(PipelineError::RuntimeFailure {
                reason: "response channel closed".to_string(),
            }),
        }
    }
}

impl Default for ResponseQueue {
    fn default() -> Self {
        ResponseQueue::new()
    }
}
