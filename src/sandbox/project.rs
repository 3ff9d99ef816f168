use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use super::SandboxError;

/// File marking the root of a workflow project.
pub const PROJECT_FILE: &str = "nodeflow.yaml";

/// A workflow project: a directory holding `nodeflow.yaml`.
#[derive(Debug, Clone, Deserialize)]
pub struct Project {
    #[serde(skip)]
    pub path: PathBuf,
    pub version: String,
    /// Entries of the form `name = version`.
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl Project {
    pub fn open(dir: &Path) -> Result<Self, SandboxError> {
        let file = dir.join(PROJECT_FILE);
        let text = std::fs::read_to_string(&file).map_err(|source| SandboxError::Io {
            path: file.clone(),
            source,
        })?;
        let mut project: Project =
            serde_yaml::from_str(&text).map_err(|source| SandboxError::Parse {
                path: file,
                source,
            })?;
        project.path = dir.to_path_buf();
        Ok(project)
    }

    /// Dependencies as `name -> version`. Malformed entries are skipped.
    pub fn dependency_map(&self) -> BTreeMap<String, String> {
        self.dependencies
            .iter()
            .filter_map(|dep| {
                let (name, version) = dep.split_once('=')?;
                Some((name.trim().to_string(), version.trim().to_string()))
            })
            .collect()
    }
}

/// Walk up from `start` to the nearest directory containing the project
/// file.
pub fn find_project_root(start: &Path) -> Option<PathBuf> {
    let start = if start.is_file() { start.parent()? } else { start };
    start
        .ancestors()
        .find(|dir| dir.join(PROJECT_FILE).is_file())
        .map(Path::to_path_buf)
}
