//! TaskflowRepository (C9): durable `taskId -> state` persistence as a
//! small JSON document (§4.9).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub state: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TaskDocument {
    version: u32,
    tasks: Vec<TaskRecord>,
    /// Reserved for future use; the core always writes an empty array.
    history: Vec<serde_json::Value>,
}

impl Default for TaskDocument {
    fn default() -> Self {
        Self {
            version: 1,
            tasks: vec![],
            history: vec![],
        }
    }
}

pub struct TaskflowRepository {
    path: PathBuf,
}

impl TaskflowRepository {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Returns an empty map when the file is absent (§4.9 `Load`).
    pub fn load(&self) -> Result<BTreeMap<String, String>> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(e.into()),
        };
        let doc: TaskDocument = serde_json::from_str(&text)
            .map_err(|e| crate::error::Error::Internal(format!("corrupt taskflow document: {e}")))?;
        Ok(doc.tasks.into_iter().map(|t| (t.id, t.state)).collect())
    }

    /// Creates parent directories, writes `0644` (file) / `0755` (parent
    /// dir) permissions on unix, with a reserved empty `history` (§4.9
    /// `Save`).
    pub fn save(&self, tasks: &BTreeMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
            set_dir_permissions(parent)?;
        }

        let doc = TaskDocument {
            version: 1,
            tasks: tasks.iter().map(|(id, state)| TaskRecord { id: id.clone(), state: state.clone() }).collect(),
            history: vec![],
        };
        let text = serde_json::to_string_pretty(&doc)
            .map_err(|e| crate::error::Error::Internal(format!("failed to serialize taskflow document: {e}")))?;
        std::fs::write(&self.path, text)?;
        set_file_permissions(&self.path)?;
        Ok(())
    }
}

#[cfg(unix)]
fn set_file_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o644))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_file_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
fn set_dir_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_dir_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_file_yields_empty_map() {
        let dir = tempfile::tempdir().unwrap();
        let repo = TaskflowRepository::new(dir.path().join("tasks.json"));
        let loaded = repo.load().unwrap();
        assert!(loaded.is_empty());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let repo = TaskflowRepository::new(dir.path().join("nested/tasks.json"));
        let mut tasks = BTreeMap::new();
        tasks.insert("t1".to_string(), "running".to_string());
        tasks.insert("t2".to_string(), "done".to_string());
        repo.save(&tasks).unwrap();

        let loaded = repo.load().unwrap();
        assert_eq!(loaded, tasks);
    }

    #[cfg(unix)]
    #[test]
    fn save_sets_expected_permission_bits() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let repo = TaskflowRepository::new(dir.path().join("tasks.json"));
        repo.save(&BTreeMap::new()).unwrap();
        let meta = std::fs::metadata(dir.path().join("tasks.json")).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o644);
    }
}
