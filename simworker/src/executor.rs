//! Turns a task's simulation list into work items and drives the engine.
//!
//! Local layout of one task's work root:
//!
//!	<work>
//!	├── resources
//!	│   ├── toolbox_env/
//!	│   ├── archive_index.mdb
//!	│   ├── cbm_executables/
//!	│   └── stand_recovery_rules/
//!	├── projects
//!	│   └── <project_code>.mdb
//!	└── results
//!	    └── <project_code>
//!	        └── <simulation_id>
//!	            ├── <simulation_id>.mdb
//!	            ├── stdout_<simulation_id>.txt
//!	            └── temp_files_<simulation_id>/
//!
//! Every simulation writes only below its own `results/<project>/<sim>`
//! directory, so runs never collide.

use std::{
    any::Any,
    collections::BTreeSet,
    io,
    panic::AssertUnwindSafe,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result, anyhow};
use common::SimulationSpec;
use futures::FutureExt;
use libtransfer::{ExecutionStore, TransferKind};
use thiserror::Error;
use tokio::fs;

use crate::engine::{RunArgs, RunOutcome, SimulationEngine};

pub const TOOLBOX_ENV: &str = "toolbox_env";
pub const ARCHIVE_INDEX_DATABASE: &str = "archive_index_database";
pub const CBM_EXECUTABLES: &str = "cbm_executables";
pub const STAND_RECOVERY_RULES: &str = "stand_recovery_rules";
const DISTURBANCE_RULES_FILE: &str = "99a_disturbance_rules.csv";
const DISTURBANCE_CLASSES_FILE: &str = "99b_disturbance_classes.csv";

#[derive(Error, Debug)]
pub enum SimulationBatchError {
    #[error("failed to create output directory {}: {source}", path.display())]
    OutputDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("engine returned {actual} outcomes for {expected} simulations")]
    OutcomeCount { expected: usize, actual: usize },

    #[error("simulation engine failed: {0:#}")]
    Engine(anyhow::Error),
}

/// Path layout below one task's work root.
#[derive(Debug, Clone)]
pub struct WorkLayout {
    root: PathBuf,
}

impl WorkLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn resources_dir(&self) -> PathBuf {
        self.root.join("resources")
    }

    pub fn project_path(&self, project_code: &str) -> PathBuf {
        self.root.join("projects").join(format!("{project_code}.mdb"))
    }

    /// Directory owned by one simulation.
    pub fn simulation_dir(&self, project_code: &str, simulation_id: i64) -> PathBuf {
        self.root
            .join("results")
            .join(project_code)
            .join(simulation_id.to_string())
    }
}

/// One (project, simulation) pair with its resolved local paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub project_code: String,
    pub simulation_id: i64,
    pub project_path: PathBuf,
    pub results_database_path: PathBuf,
    pub tempfiles_output_dir: PathBuf,
    pub stdout_path: PathBuf,
}

impl WorkItem {
    /// Directory holding everything this simulation produced.
    pub fn simulation_dir(&self) -> &Path {
        self.tempfiles_output_dir
            .parent()
            .unwrap_or(&self.tempfiles_output_dir)
    }
}

/// Local paths of the resources shared by every simulation of a task.
#[derive(Debug, Clone)]
pub struct SharedResources {
    pub toolbox_env: PathBuf,
    pub archive_index_path: PathBuf,
    pub cbm_executables_dir: PathBuf,
    pub dist_rules_path: PathBuf,
    pub dist_classes_path: PathBuf,
}

impl SharedResources {
    pub fn under(layout: &WorkLayout) -> Self {
        let resources = layout.resources_dir();
        let rules_dir = resources.join(STAND_RECOVERY_RULES);
        Self {
            toolbox_env: resources.join(TOOLBOX_ENV),
            archive_index_path: resources.join("archive_index.mdb"),
            cbm_executables_dir: resources.join(CBM_EXECUTABLES),
            dist_rules_path: rules_dir.join(DISTURBANCE_RULES_FILE),
            dist_classes_path: rules_dir.join(DISTURBANCE_CLASSES_FILE),
        }
    }
}

/// One work item per simulation id, in input order.
pub fn decompose(simulations: &[SimulationSpec], layout: &WorkLayout) -> Vec<WorkItem> {
    simulations
        .iter()
        .flat_map(|spec| {
            spec.simulation_ids.iter().map(move |&simulation_id| {
                let dir = layout.simulation_dir(&spec.project_code, simulation_id);
                WorkItem {
                    project_code: spec.project_code.clone(),
                    simulation_id,
                    project_path: layout.project_path(&spec.project_code),
                    results_database_path: dir.join(format!("{simulation_id}.mdb")),
                    tempfiles_output_dir: dir.join(format!("temp_files_{simulation_id}")),
                    stdout_path: dir.join(format!("stdout_{simulation_id}.txt")),
                }
            })
        })
        .collect()
}

pub struct TaskExecutor {
    engine: Arc<dyn SimulationEngine>,
    max_concurrency: usize,
}

impl TaskExecutor {
    pub fn new(engine: Arc<dyn SimulationEngine>, max_concurrency: usize) -> Self {
        Self {
            engine,
            max_concurrency,
        }
    }

    /// Fetch shared resources and every distinct project database.
    /// Nothing is cached between tasks.
    pub async fn prepare(
        &self,
        store: &ExecutionStore,
        simulations: &[SimulationSpec],
        layout: &WorkLayout,
    ) -> Result<SharedResources> {
        let shared = SharedResources::under(layout);
        let resources_dir = layout.resources_dir();
        let downloads = [
            (TOOLBOX_ENV, shared.toolbox_env.clone()),
            (ARCHIVE_INDEX_DATABASE, shared.archive_index_path.clone()),
            (CBM_EXECUTABLES, shared.cbm_executables_dir.clone()),
            (STAND_RECOVERY_RULES, resources_dir.join(STAND_RECOVERY_RULES)),
        ];
        for (name, path) in downloads {
            store
                .download(&TransferKind::resource(name), &path)
                .await
                .with_context(|| format!("Failed to download resource {name}"))?;
        }

        let projects: BTreeSet<&str> = simulations
            .iter()
            .map(|s| s.project_code.as_str())
            .collect();
        for project_code in projects {
            store
                .download(
                    &TransferKind::project(project_code),
                    &layout.project_path(project_code),
                )
                .await
                .with_context(|| format!("Failed to download project {project_code}"))?;
        }
        Ok(shared)
    }

    /// Run every work item through the engine.
    pub async fn execute(
        &self,
        items: &[WorkItem],
        shared: &SharedResources,
    ) -> std::result::Result<Vec<RunOutcome>, SimulationBatchError> {
        // The engine must find its output directory in place.
        for item in items {
            fs::create_dir_all(&item.tempfiles_output_dir)
                .await
                .map_err(|source| SimulationBatchError::OutputDir {
                    path: item.tempfiles_output_dir.clone(),
                    source,
                })?;
        }

        let runs = items.iter().map(|item| run_args(item, shared)).collect();
        // A panicking engine fails the batch like any other engine error.
        let outcomes = AssertUnwindSafe(self.engine.run_concurrent(
            runs,
            &shared.toolbox_env,
            self.max_concurrency,
        ))
        .catch_unwind()
        .await
        .map_err(|payload| {
            SimulationBatchError::Engine(anyhow!("engine panicked: {}", panic_message(&*payload)))
        })?
        .map_err(SimulationBatchError::Engine)?;

        if outcomes.len() != items.len() {
            return Err(SimulationBatchError::OutcomeCount {
                expected: items.len(),
                actual: outcomes.len(),
            });
        }
        Ok(outcomes)
    }
}

/// Text of a panic payload, when it carries one.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg
    } else {
        "non-string panic payload"
    }
}

fn run_args(item: &WorkItem, shared: &SharedResources) -> RunArgs {
    RunArgs {
        project_path: item.project_path.clone(),
        project_simulation_id: item.simulation_id,
        aidb_path: shared.archive_index_path.clone(),
        cbm_exe_path: shared.cbm_executables_dir.clone(),
        results_database_path: item.results_database_path.clone(),
        tempfiles_output_dir: item.tempfiles_output_dir.clone(),
        stdout_path: item.stdout_path.clone(),
        copy_makelist_results: true,
        dist_classes_path: shared.dist_classes_path.clone(),
        dist_rules_path: shared.dist_rules_path.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::RunStatus;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::tempdir;

    fn spec(code: &str, ids: &[i64]) -> SimulationSpec {
        SimulationSpec {
            project_code: code.to_string(),
            simulation_ids: ids.to_vec(),
        }
    }

    #[test]
    fn test_decompose_paths_are_per_simulation() {
        let layout = WorkLayout::new("/work");
        let items = decompose(&[spec("AB", &[1, 2])], &layout);
        assert_eq!(items.len(), 2);
        assert_eq!(
            items[0].results_database_path,
            PathBuf::from("/work/results/AB/1/1.mdb")
        );
        assert_eq!(
            items[1].results_database_path,
            PathBuf::from("/work/results/AB/2/2.mdb")
        );
        assert_eq!(
            items[1].tempfiles_output_dir,
            PathBuf::from("/work/results/AB/2/temp_files_2")
        );
        assert_eq!(items[0].stdout_path, PathBuf::from("/work/results/AB/1/stdout_1.txt"));
        assert_eq!(items[0].project_path, PathBuf::from("/work/projects/AB.mdb"));
        assert_eq!(items[0].simulation_dir(), Path::new("/work/results/AB/1"));
    }

    #[test]
    fn test_decompose_multiple_projects() {
        let layout = WorkLayout::new("/work");
        let items = decompose(&[spec("AB", &[1, 2]), spec("BCB", &[21, 22])], &layout);
        let keys: Vec<_> = items
            .iter()
            .map(|i| (i.project_code.as_str(), i.simulation_id))
            .collect();
        assert_eq!(keys, vec![("AB", 1), ("AB", 2), ("BCB", 21), ("BCB", 22)]);
        let dirs: BTreeSet<_> = items.iter().map(|i| i.simulation_dir().to_path_buf()).collect();
        assert_eq!(dirs.len(), 4);
    }

    struct RecordingEngine {
        seen: Mutex<Vec<(usize, bool)>>,
    }

    #[async_trait]
    impl SimulationEngine for RecordingEngine {
        async fn run_concurrent(
            &self,
            runs: Vec<RunArgs>,
            _toolbox_env: &Path,
            max_concurrency: usize,
        ) -> Result<Vec<RunOutcome>> {
            let dirs_exist = runs.iter().all(|r| r.tempfiles_output_dir.is_dir());
            self.seen.lock().unwrap().push((max_concurrency, dirs_exist));
            Ok(runs
                .iter()
                .map(|r| RunOutcome {
                    simulation_id: r.project_simulation_id,
                    status: RunStatus::Succeeded,
                })
                .collect())
        }
    }

    struct PanickingEngine;

    #[async_trait]
    impl SimulationEngine for PanickingEngine {
        async fn run_concurrent(
            &self,
            _runs: Vec<RunArgs>,
            _toolbox_env: &Path,
            _max_concurrency: usize,
        ) -> Result<Vec<RunOutcome>> {
            panic!("toolbox segfault")
        }
    }

    #[tokio::test]
    async fn test_execute_turns_engine_panic_into_batch_error() {
        let tmp_dir = tempdir().unwrap();
        let layout = WorkLayout::new(tmp_dir.path());
        let items = decompose(&[spec("AB", &[1])], &layout);
        let executor = TaskExecutor::new(Arc::new(PanickingEngine), 1);

        let err = executor
            .execute(&items, &SharedResources::under(&layout))
            .await
            .unwrap_err();
        assert!(matches!(err, SimulationBatchError::Engine(_)));
        assert!(err.to_string().contains("toolbox segfault"), "{err}");
    }

    #[tokio::test]
    async fn test_execute_precreates_dirs_and_passes_concurrency() {
        let tmp_dir = tempdir().unwrap();
        let layout = WorkLayout::new(tmp_dir.path());
        let items = decompose(&[spec("AB", &[1, 2])], &layout);
        let engine = Arc::new(RecordingEngine {
            seen: Mutex::new(Vec::new()),
        });
        let executor = TaskExecutor::new(engine.clone(), 1);

        let outcomes = executor
            .execute(&items, &SharedResources::under(&layout))
            .await
            .unwrap();
        assert_eq!(outcomes.len(), 2);
        assert_eq!(*engine.seen.lock().unwrap(), vec![(1, true)]);
    }
}
