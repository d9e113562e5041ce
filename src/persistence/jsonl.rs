//! JSON-lines persistence
//!
//! Appends one JSON object per line to `tasks.jsonl` and `learning.jsonl` in a
//! directory. Loading replays the log and keeps the latest line per key.
//! Unparseable lines are skipped with a warning.
//!
//! Opening the store compacts both logs down to the lines a restart still
//! needs, so they stay bounded across runs.

use super::{latest_learning, latest_unfinished, Persistence, PersistenceError, TaskRecord};
use crate::learning::LearningRecord;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const TASKS_FILE: &str = "tasks.jsonl";
const LEARNING_FILE: &str = "learning.jsonl";

/// Lines dropped by one compaction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Compaction {
    pub task_lines_dropped: usize,
    pub learning_lines_dropped: usize,
}

pub struct JsonlPersistence {
    directory: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlPersistence {
    /// Create the directory if needed and compact existing logs
    pub async fn open(directory: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        let directory = directory.as_ref().to_path_buf();
        fs::create_dir_all(&directory).await?;
        let store = Self {
            directory,
            write_lock: Mutex::new(()),
        };

        let compaction = store.compact().await?;
        debug!(
            directory = %store.directory.display(),
            task_lines_dropped = compaction.task_lines_dropped,
            learning_lines_dropped = compaction.learning_lines_dropped,
            "Opened JSON-lines persistence"
        );
        Ok(store)
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Rewrite both logs keeping the latest unfinished record per task and the
    /// latest record per learning bucket
    pub async fn compact(&self) -> Result<Compaction, PersistenceError> {
        let _guard = self.write_lock.lock().await;

        let tasks: Vec<TaskRecord> = self.read_lines(TASKS_FILE).await?;
        let before = tasks.len();
        let kept = latest_unfinished(tasks);
        let task_lines_dropped = before - kept.len();
        if task_lines_dropped > 0 {
            self.rewrite(TASKS_FILE, &kept).await?;
        }

        let learning: Vec<LearningRecord> = self.read_lines(LEARNING_FILE).await?;
        let before = learning.len();
        let kept = latest_learning(learning);
        let learning_lines_dropped = before - kept.len();
        if learning_lines_dropped > 0 {
            self.rewrite(LEARNING_FILE, &kept).await?;
        }

        let compaction = Compaction {
            task_lines_dropped,
            learning_lines_dropped,
        };
        if compaction != Compaction::default() {
            info!(
                task_lines_dropped,
                learning_lines_dropped, "Compacted persistence logs"
            );
        }
        Ok(compaction)
    }

    async fn append<T: Serialize>(&self, file: &str, value: &T) -> Result<(), PersistenceError> {
        let mut line = serde_json::to_vec(value)?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().await;
        let mut handle = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.directory.join(file))
            .await?;
        handle.write_all(&line).await?;
        handle.flush().await?;
        Ok(())
    }

    /// Replace `file` through a temporary sibling so a crash leaves either log intact.
    /// Caller holds the write lock.
    async fn rewrite<T: Serialize>(&self, file: &str, values: &[T]) -> Result<(), PersistenceError> {
        let mut content = Vec::new();
        for value in values {
            serde_json::to_writer(&mut content, value)?;
            content.push(b'\n');
        }

        let path = self.directory.join(file);
        let staging = self.directory.join(format!("{file}.tmp"));
        fs::write(&staging, &content).await?;
        fs::rename(&staging, &path).await?;
        Ok(())
    }

    async fn read_lines<T: DeserializeOwned>(&self, file: &str) -> Result<Vec<T>, PersistenceError> {
        let path = self.directory.join(file);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut values = Vec::new();
        for (index, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(value) => values.push(value),
                Err(e) => warn!(
                    file = %path.display(),
                    line = index + 1,
                    error = %e,
                    "Skipping unreadable persistence line"
                ),
            }
        }
        Ok(values)
    }
}

#[async_trait]
impl Persistence for JsonlPersistence {
    async fn save_task_record(&self, record: &TaskRecord) -> Result<(), PersistenceError> {
        self.append(TASKS_FILE, record).await
    }

    async fn save_learning_record(&self, record: &LearningRecord) -> Result<(), PersistenceError> {
        self.append(LEARNING_FILE, record).await
    }

    async fn load_pending_tasks(&self) -> Result<Vec<TaskRecord>, PersistenceError> {
        let records: Vec<TaskRecord> = self.read_lines(TASKS_FILE).await?;
        Ok(latest_unfinished(records))
    }

    async fn load_learning_records(&self) -> Result<Vec<LearningRecord>, PersistenceError> {
        let records: Vec<LearningRecord> = self.read_lines(LEARNING_FILE).await?;
        Ok(latest_learning(records))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::learning::LearningStore;
    use crate::protocol::{Complexity, TaskRequest, TaskState};
    use serde_json::json;
    use tempfile::TempDir;

    fn with_state(record: &TaskRecord, state: TaskState) -> TaskRecord {
        let mut next = record.clone();
        next.state = state;
        next
    }

    async fn line_count(store: &JsonlPersistence, file: &str) -> usize {
        fs::read_to_string(store.directory().join(file))
            .await
            .map(|content| content.lines().count())
            .unwrap_or(0)
    }

    #[tokio::test]
    async fn test_reopen_compacts_task_log() {
        let dir = TempDir::new().unwrap();
        let store = JsonlPersistence::open(dir.path()).await.unwrap();

        let done = TaskRecord::pending(TaskRequest::new("summarize", json!({})));
        let open = TaskRecord::pending(TaskRequest::new("translate", json!({})));
        for record in [
            done.clone(),
            with_state(&done, TaskState::Running),
            with_state(&done, TaskState::Succeeded),
            open.clone(),
            with_state(&open, TaskState::Running),
        ] {
            store.save_task_record(&record).await.unwrap();
        }
        assert_eq!(line_count(&store, TASKS_FILE).await, 5);

        let reopened = JsonlPersistence::open(dir.path()).await.unwrap();
        assert_eq!(line_count(&reopened, TASKS_FILE).await, 1);

        let pending = reopened.load_pending_tasks().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].task_id, open.task_id);
        assert_eq!(pending[0].state, TaskState::Running);
        assert!(!dir.path().join("tasks.jsonl.tmp").exists());
    }

    #[tokio::test]
    async fn test_compaction_keeps_latest_learning_record() {
        let dir = TempDir::new().unwrap();
        let store = JsonlPersistence::open(dir.path()).await.unwrap();

        let learning = LearningStore::new(100);
        for _ in 0..3 {
            let record =
                learning.record_outcome("summarize", Complexity::Simple, "w1", true, 0.1, 20.0);
            store.save_learning_record(&record).await.unwrap();
        }

        let compaction = store.compact().await.unwrap();
        assert_eq!(compaction.learning_lines_dropped, 2);
        assert_eq!(compaction.task_lines_dropped, 0);
        assert_eq!(line_count(&store, LEARNING_FILE).await, 1);

        let restored = store.load_learning_records().await.unwrap();
        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].sample_size, 3);

        // Already compact
        assert_eq!(store.compact().await.unwrap(), Compaction::default());
    }

    #[tokio::test]
    async fn test_unreadable_lines_are_skipped() {
        let dir = TempDir::new().unwrap();
        let record = TaskRecord::pending(TaskRequest::new("summarize", json!({})));
        let content = format!("not json\n{}\n", serde_json::to_string(&record).unwrap());
        fs::write(dir.path().join(TASKS_FILE), content).await.unwrap();

        let store = JsonlPersistence::open(dir.path()).await.unwrap();
        let pending = store.load_pending_tasks().await.unwrap();
        assert_eq!(pending, vec![record]);
    }
}
