// Keys map "transfer kinds" and their ids onto blob store object names.
//
// The key layout in the blob store is as follows:
//
//	<namespace>
//	└── <execution_id>
//	    ├── resource
//	    │   └── <name>.tar.gz
//	    ├── project
//	    │   └── <project_code>.tar.gz
//	    ├── results
//	    │   └── <project_code>_<simulation_id>.tar.gz
//	    └── tempfiles
//	        └── <project_code>_<simulation_id>.tar.gz
//
// Whether a blob holds a single file or a directory tree is recorded inside
// the archive, never in the key.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Extension appended to every document name on upload and download.
pub const ARCHIVE_EXTENSION: &str = "tar.gz";

/// The four kinds of documents moved between workers and the blob store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransferKind {
    /// Shared simulation input (engine executables, reference databases, rule files).
    Resource { name: String },
    /// A project database, shared by all simulations of that project.
    Project { project_code: String },
    /// Results database of one simulation.
    Results {
        project_code: String,
        simulation_id: i64,
    },
    /// Everything else one simulation left in its result directory.
    Tempfiles {
        project_code: String,
        simulation_id: i64,
    },
}

impl TransferKind {
    pub fn resource(name: impl Into<String>) -> Self {
        TransferKind::Resource { name: name.into() }
    }

    pub fn project(project_code: impl Into<String>) -> Self {
        TransferKind::Project {
            project_code: project_code.into(),
        }
    }

    pub fn results(project_code: impl Into<String>, simulation_id: i64) -> Self {
        TransferKind::Results {
            project_code: project_code.into(),
            simulation_id,
        }
    }

    pub fn tempfiles(project_code: impl Into<String>, simulation_id: i64) -> Self {
        TransferKind::Tempfiles {
            project_code: project_code.into(),
            simulation_id,
        }
    }

    /// Key segment between the execution id and the document name.
    pub fn segment(&self) -> &'static str {
        match self {
            TransferKind::Resource { .. } => "resource",
            TransferKind::Project { .. } => "project",
            TransferKind::Results { .. } => "results",
            TransferKind::Tempfiles { .. } => "tempfiles",
        }
    }

    /// Document name without the archive extension.
    pub fn document_name(&self) -> String {
        match self {
            TransferKind::Resource { name } => name.clone(),
            TransferKind::Project { project_code } => project_code.clone(),
            TransferKind::Results {
                project_code,
                simulation_id,
            }
            | TransferKind::Tempfiles {
                project_code,
                simulation_id,
            } => format!("{project_code}_{simulation_id}"),
        }
    }

    /// Returns the prefix of this kind within an execution,
    /// (e.g. `<namespace>/<execution_id>/results`).
    pub fn prefix(&self, namespace: &str, execution_id: &str) -> String {
        join_key(&[namespace, execution_id, self.segment()])
    }
}

impl fmt::Display for TransferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.segment(), self.document_name())
    }
}

/// Full object key of one archive blob.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArchiveKey(String);

impl ArchiveKey {
    /// Returns `<namespace>/<document_name>.tar.gz`. Separators inside
    /// `document_name` are kept so nested keys stay addressable.
    pub fn new(namespace: &str, document_name: &str) -> Self {
        let document = format!("{document_name}.{ARCHIVE_EXTENSION}");
        ArchiveKey(join_key(&[namespace, &document]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ArchiveKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// File name used for the local copy of a blob: separators in the document
/// name are flattened so it is a single path component.
pub fn local_archive_name(document_name: &str) -> String {
    format!(
        "{}.{ARCHIVE_EXTENSION}",
        document_name.replace(['/', '\\'], "_")
    )
}

fn join_key(parts: &[&str]) -> String {
    parts
        .iter()
        .map(|p| p.trim_matches('/'))
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}
