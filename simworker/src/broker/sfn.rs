//! Step Functions activity broker: long-polls `GetActivityTask` and reports
//! back through `SendTaskHeartbeat` / `SendTaskSuccess` / `SendTaskFailure`.

use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_sfn::{Client, config::Region, error::DisplayErrorContext};
use common::TaskOutput;

use super::{ActivityToken, Broker, BrokerError, Task};

#[derive(Debug, Clone)]
pub struct SfnConfig {
    pub activity_arn: String,
    pub region: String,
    /// Name recorded by the service for tasks handed to this worker.
    pub worker_name: String,
    /// Must outlast the service's own long-poll window (60s).
    pub read_timeout: Duration,
    pub connect_timeout: Duration,
}

pub struct SfnBroker {
    client: Client,
    activity_arn: String,
    worker_name: String,
}

impl SfnBroker {
    pub async fn new(config: SfnConfig) -> Self {
        let timeouts = aws_config::timeout::TimeoutConfig::builder()
            .connect_timeout(config.connect_timeout)
            .read_timeout(config.read_timeout)
            .build();
        let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(Region::new(config.region))
            .timeout_config(timeouts)
            .load()
            .await;
        Self {
            client: Client::new(&sdk_config),
            activity_arn: config.activity_arn,
            worker_name: config.worker_name,
        }
    }
}

fn transport<E: std::error::Error>(operation: &'static str, err: E) -> BrokerError {
    BrokerError::Transport {
        operation,
        message: DisplayErrorContext(err).to_string(),
    }
}

#[async_trait]
impl Broker for SfnBroker {
    async fn get_next_task(&self) -> Result<Option<Task>, BrokerError> {
        let resp = self
            .client
            .get_activity_task()
            .activity_arn(&self.activity_arn)
            .worker_name(&self.worker_name)
            .send()
            .await
            .map_err(|e| transport("get_activity_task", e))?;

        // An empty poll comes back as a response without a token.
        match resp.task_token() {
            Some(token) if !token.is_empty() => Ok(Some(Task {
                token: ActivityToken::new(token),
                input: resp.input().unwrap_or("{}").to_string(),
            })),
            _ => Ok(None),
        }
    }

    async fn heartbeat(&self, token: &ActivityToken) -> Result<(), BrokerError> {
        self.client
            .send_task_heartbeat()
            .task_token(token.as_str())
            .send()
            .await
            .map_err(|e| transport("send_task_heartbeat", e))?;
        Ok(())
    }

    async fn report_success(
        &self,
        token: &ActivityToken,
        output: &TaskOutput,
    ) -> Result<(), BrokerError> {
        self.client
            .send_task_success()
            .task_token(token.as_str())
            .output(output.to_json()?)
            .send()
            .await
            .map_err(|e| transport("send_task_success", e))?;
        Ok(())
    }

    async fn report_failure(
        &self,
        token: &ActivityToken,
        error: &str,
        cause: &str,
    ) -> Result<(), BrokerError> {
        self.client
            .send_task_failure()
            .task_token(token.as_str())
            .error(error)
            .cause(cause)
            .send()
            .await
            .map_err(|e| transport("send_task_failure", e))?;
        Ok(())
    }
}
