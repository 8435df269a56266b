//! Task protocol definitions shared between simfleet workers and tooling.
//!
//! These are the JSON documents exchanged with the activity broker: the input
//! handed to a worker with each activity token, and the output reported back
//! when the task completes.

use serde::{Deserialize, Serialize};

/// Simulations of one project that a task asks a worker to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationSpec {
    pub project_code: String,
    pub simulation_ids: Vec<i64>,
}

/// Input payload attached to an activity token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInput {
    /// Execution-specific key prefix; every blob the task reads or writes
    /// lives under it.
    pub upload_s3_key: String,
    pub simulations: Vec<SimulationSpec>,
}

impl TaskInput {
    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }

    /// Number of (project, simulation) pairs in this task.
    pub fn simulation_count(&self) -> usize {
        self.simulations
            .iter()
            .map(|s| s.simulation_ids.len())
            .sum()
    }
}

/// Body of a task outcome: echo of the simulations plus an optional error trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
    pub simulations: Vec<SimulationSpec>,
    pub errors: Option<String>,
}

/// Document reported with `report_success`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOutput {
    pub output: TaskResult,
}

impl TaskOutput {
    pub fn new(simulations: Vec<SimulationSpec>, errors: Option<String>) -> Self {
        Self {
            output: TaskResult {
                simulations,
                errors,
            },
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    #[test]
    fn test_parse_task_input() {
        let raw = r#"{
            "upload_s3_key": "exec-42",
            "simulations": [
                {"project_code": "AB", "simulation_ids": [1, 2]},
                {"project_code": "BCB", "simulation_ids": [21]}
            ]
        }"#;
        let input = TaskInput::from_json(raw).unwrap();
        assert_eq!(input.upload_s3_key, "exec-42");
        assert_eq!(input.simulations.len(), 2);
        assert_eq!(input.simulations[0].simulation_ids, vec![1, 2]);
        assert_eq!(input.simulation_count(), 3);
    }

    #[test]
    fn test_task_input_missing_field() {
        let raw = r#"{"simulations": []}"#;
        assert!(TaskInput::from_json(raw).is_err());
    }

    #[test]
    fn test_output_shape() {
        let spec = SimulationSpec {
            project_code: "AB".to_string(),
            simulation_ids: vec![1],
        };
        let ok = TaskOutput::new(vec![spec.clone()], None);
        let value: Value = serde_json::from_str(&ok.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"output": {"simulations": [{"project_code": "AB", "simulation_ids": [1]}], "errors": null}})
        );

        let failed = TaskOutput::new(vec![spec], Some("boom".to_string()));
        let value: Value = serde_json::from_str(&failed.to_json().unwrap()).unwrap();
        assert_eq!(value["output"]["errors"], json!("boom"));
    }
}
