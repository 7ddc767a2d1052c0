//! Per-task artifact emission.
//!
//! Every executed task leaves two files under `<root>/<flow_id>/<task_id>/`:
//! `task_log.json` with the completion snapshot and `environment_variables.json`
//! with the variable store as it looked at task start. Secrets are masked
//! before the data reaches this module.

use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::runstate::TaskSnapshot;

pub const TASK_LOG_FILE: &str = "task_log.json";
pub const ENVIRONMENT_FILE: &str = "environment_variables.json";

/// Writes task artifacts under a log root directory.
#[derive(Debug, Clone)]
pub struct ArtifactWriter {
    root: PathBuf,
}

impl ArtifactWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn task_dir(&self, flow_id: &str, task_id: &str) -> PathBuf {
        self.root.join(flow_id).join(task_id)
    }

    /// Snapshot at completion, placeholders expanded and secrets masked.
    pub async fn write_task_log(
        &self,
        flow_id: &str,
        snapshot: &TaskSnapshot,
    ) -> std::io::Result<()> {
        let dir = self.task_dir(flow_id, &snapshot.id);
        fs::create_dir_all(&dir).await?;
        let content = serde_json::to_string_pretty(snapshot)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        fs::write(dir.join(TASK_LOG_FILE), content).await
    }

    /// Variable store snapshot at task start, secrets rendered as `<secret>`
    /// and proxies expanded into environment assignments.
    pub async fn write_environment(
        &self,
        flow_id: &str,
        task_id: &str,
        environment: &Map<String, Value>,
    ) -> std::io::Result<()> {
        let dir = self.task_dir(flow_id, task_id);
        fs::create_dir_all(&dir).await?;
        let content = serde_json::to_string_pretty(environment)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        fs::write(dir.join(ENVIRONMENT_FILE), content).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runstate::ResultType;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_task_log_written_under_flow_and_task() {
        let dir = TempDir::new().unwrap();
        let writer = ArtifactWriter::new(dir.path());

        let mut snapshot = TaskSnapshot::pending("t1");
        snapshot.mark_running();
        snapshot.mark_completed(json!("done"), ResultType::String);

        writer.write_task_log("flow-1", &snapshot).await.unwrap();

        let path = dir.path().join("flow-1").join("t1").join(TASK_LOG_FILE);
        let content = std::fs::read_to_string(path).unwrap();
        let parsed: Value = serde_json::from_str(&content).unwrap();
        assert_eq!(parsed["status"], "completed");
        assert_eq!(parsed["result"], "done");
    }

    #[tokio::test]
    async fn test_environment_snapshot_written() {
        let dir = TempDir::new().unwrap();
        let writer = ArtifactWriter::new(dir.path());

        let mut env = Map::new();
        env.insert("token".to_string(), json!("<secret>"));
        writer
            .write_environment("flow-1", "t1", &env)
            .await
            .unwrap();

        let path = dir.path().join("flow-1").join("t1").join(ENVIRONMENT_FILE);
        let content = std::fs::read_to_string(path).unwrap();
        assert!(content.contains("<secret>"));
    }
}
