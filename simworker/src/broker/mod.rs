//! Task broker seam.
//!
//! Submodules:
//! - `sfn`: AWS Step Functions activity client
//! - `memory`: scripted in-process broker
//!
//! A broker hands out tasks, each identified by an [`ActivityToken`] that
//! stays valid only while it is heartbeated. The broker alone guarantees that
//! one token is never held by two workers at once.

use std::fmt;

use async_trait::async_trait;
use common::TaskOutput;
use thiserror::Error;

pub mod memory;
pub mod sfn;

/// Opaque credential of one dequeued task.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ActivityToken(String);

impl ActivityToken {
    pub fn new(token: impl Into<String>) -> Self {
        ActivityToken(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// Tokens are long; logs only need enough to correlate.
impl fmt::Display for ActivityToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.char_indices().nth(16) {
            Some((idx, _)) => write!(f, "{}...", &self.0[..idx]),
            None => f.write_str(&self.0),
        }
    }
}

impl fmt::Debug for ActivityToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ActivityToken({self})")
    }
}

/// One broker-issued unit of work. `input` is the raw JSON document.
#[derive(Debug, Clone)]
pub struct Task {
    pub token: ActivityToken,
    pub input: String,
}

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("{operation} failed: {message}")]
    Transport {
        operation: &'static str,
        message: String,
    },

    #[error("failed to encode task output: {0}")]
    Encode(#[from] serde_json::Error),
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Ask for the next task. `Ok(None)` means nothing was available.
    async fn get_next_task(&self) -> Result<Option<Task>, BrokerError>;

    async fn heartbeat(&self, token: &ActivityToken) -> Result<(), BrokerError>;

    /// Complete the task; the token is invalid afterwards.
    async fn report_success(
        &self,
        token: &ActivityToken,
        output: &TaskOutput,
    ) -> Result<(), BrokerError>;

    /// Fail the task; the token is invalid afterwards.
    async fn report_failure(
        &self,
        token: &ActivityToken,
        error: &str,
        cause: &str,
    ) -> Result<(), BrokerError>;
}
