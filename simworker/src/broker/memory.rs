//! In-process broker driven by a script of poll responses. It records every
//! call so tests and dry runs can inspect what a worker did.

use std::{
    collections::VecDeque,
    sync::{
        Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use common::TaskOutput;

use super::{ActivityToken, Broker, BrokerError, Task};

/// What the next `get_next_task` call returns.
#[derive(Debug, Clone)]
pub enum PollResponse {
    Empty,
    Task(Task),
    TransportError,
}

#[derive(Default)]
pub struct MemoryBroker {
    script: Mutex<VecDeque<PollResponse>>,
    polls: AtomicUsize,
    fail_heartbeats: AtomicBool,
    heartbeats: Mutex<Vec<ActivityToken>>,
    successes: Mutex<Vec<(ActivityToken, TaskOutput)>>,
    failures: Mutex<Vec<(ActivityToken, String, String)>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue responses; once the script runs out every poll is empty.
    pub fn with_script(responses: impl IntoIterator<Item = PollResponse>) -> Self {
        let broker = Self::default();
        broker.push(responses);
        broker
    }

    pub fn push(&self, responses: impl IntoIterator<Item = PollResponse>) {
        lock(&self.script).extend(responses);
    }

    /// Make every heartbeat call fail (it is still recorded).
    pub fn set_fail_heartbeats(&self, fail: bool) {
        self.fail_heartbeats.store(fail, Ordering::SeqCst);
    }

    pub fn poll_count(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }

    pub fn heartbeat_count(&self) -> usize {
        lock(&self.heartbeats).len()
    }

    pub fn successes(&self) -> Vec<(ActivityToken, TaskOutput)> {
        lock(&self.successes).clone()
    }

    pub fn failures(&self) -> Vec<(ActivityToken, String, String)> {
        lock(&self.failures).clone()
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn get_next_task(&self) -> Result<Option<Task>, BrokerError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        let next = lock(&self.script).pop_front().unwrap_or(PollResponse::Empty);
        match next {
            PollResponse::Empty => Ok(None),
            PollResponse::Task(task) => Ok(Some(task)),
            PollResponse::TransportError => Err(BrokerError::Transport {
                operation: "get_next_task",
                message: "connection refused".to_string(),
            }),
        }
    }

    async fn heartbeat(&self, token: &ActivityToken) -> Result<(), BrokerError> {
        lock(&self.heartbeats).push(token.clone());
        if self.fail_heartbeats.load(Ordering::SeqCst) {
            return Err(BrokerError::Transport {
                operation: "heartbeat",
                message: "connection reset".to_string(),
            });
        }
        Ok(())
    }

    async fn report_success(
        &self,
        token: &ActivityToken,
        output: &TaskOutput,
    ) -> Result<(), BrokerError> {
        lock(&self.successes).push((token.clone(), output.clone()));
        Ok(())
    }

    async fn report_failure(
        &self,
        token: &ActivityToken,
        error: &str,
        cause: &str,
    ) -> Result<(), BrokerError> {
        lock(&self.failures).push((token.clone(), error.to_string(), cause.to_string()));
        Ok(())
    }
}
