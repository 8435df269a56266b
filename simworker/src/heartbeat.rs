//! Background liveness pings for a held activity token.

use std::{sync::Arc, time::Duration};

use tokio::{
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::broker::{ActivityToken, Broker};

/// Starts heartbeat tasks against one broker at a fixed cadence.
///
/// The cadence must stay below the broker's task timeout, otherwise the
/// broker expires the token while the task is still running.
#[derive(Clone)]
pub struct HeartbeatMonitor {
    broker: Arc<dyn Broker>,
    interval: Duration,
}

impl HeartbeatMonitor {
    pub fn new(broker: Arc<dyn Broker>, interval: Duration) -> Self {
        Self { broker, interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Spawn the heartbeat loop for `token`. The first ping goes out one
    /// interval after this call.
    pub fn start(&self, token: ActivityToken) -> HeartbeatHandle {
        let cancel = CancellationToken::new();
        let child = cancel.clone();
        let broker = self.broker.clone();
        let interval = self.interval;

        let join = tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = child.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                // An in-flight call is dropped on cancellation, so nothing
                // reaches the broker once `stop` has returned.
                tokio::select! {
                    biased;
                    _ = child.cancelled() => break,
                    res = broker.heartbeat(&token) => match res {
                        Ok(()) => debug!(token = %token, "heartbeat sent"),
                        Err(e) => warn!(token = %token, "heartbeat failed, retrying next tick: {e}"),
                    },
                }
            }
            debug!(token = %token, "heartbeat stopped");
        });

        HeartbeatHandle {
            cancel,
            join: Some(join),
        }
    }
}

/// Handle of a running heartbeat loop.
///
/// Call [`stop`](Self::stop) on every exit path. Dropping the handle without
/// stopping cancels the loop but cannot wait for it.
pub struct HeartbeatHandle {
    cancel: CancellationToken,
    join: Option<JoinHandle<()>>,
}

impl HeartbeatHandle {
    /// Stop heartbeating and wait for the loop to exit. Safe to call repeatedly.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(join) = self.join.take()
            && let Err(e) = join.await
            && e.is_panic()
        {
            warn!("heartbeat task panicked: {e}");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.join.is_none()
    }
}

impl Drop for HeartbeatHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(join) = self.join.take() {
            join.abort();
        }
    }
}
