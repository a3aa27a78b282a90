use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use buddy_types::{ApprovalId, ApprovalRequest, Task, TaskId, TransitionRecord};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{context}: {source}")]
    Serde {
        context: String,
        #[source]
        source: serde_json::Error,
    },
}

fn io_err(context: impl Into<String>) -> impl FnOnce(std::io::Error) -> StoreError {
    let context = context.into();
    move |source| StoreError::Io { context, source }
}

fn serde_err(context: impl Into<String>) -> impl FnOnce(serde_json::Error) -> StoreError {
    let context = context.into();
    move |source| StoreError::Serde { context, source }
}

/// File-backed task snapshots, transition logs and approval records.
///
/// Layout under the state dir:
/// `tasks/<id>/task.json`, `tasks/<id>/events.jsonl`, `approvals/<id>.json`.
pub struct OrchestratorStore {
    base_dir: PathBuf,
}

impl OrchestratorStore {
    pub fn new(state_dir: &Path) -> Result<Self, StoreError> {
        let base_dir = state_dir.to_path_buf();
        fs::create_dir_all(base_dir.join("tasks"))
            .map_err(io_err("failed to create task directory"))?;
        fs::create_dir_all(base_dir.join("approvals"))
            .map_err(io_err("failed to create approval directory"))?;
        Ok(Self { base_dir })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn task_dir(&self, task_id: &TaskId) -> PathBuf {
        self.base_dir.join("tasks").join(task_id.as_str())
    }

    /// Whether a snapshot exists for `task_id`. Ids that are not a single path
    /// segment are never stored.
    pub fn contains_task(&self, task_id: &TaskId) -> bool {
        is_plain_segment(task_id.as_str()) && self.task_dir(task_id).join("task.json").exists()
    }

    pub fn save_task(&self, task: &Task) -> Result<(), StoreError> {
        let dir = self.task_dir(&task.id);
        fs::create_dir_all(&dir).map_err(io_err("failed to create task directory"))?;
        let content =
            serde_json::to_string_pretty(task).map_err(serde_err("failed to serialize task"))?;
        atomic_write(&dir.join("task.json"), &content)
    }

    pub fn load_task(&self, task_id: &TaskId) -> Result<Task, StoreError> {
        let path = self.task_dir(task_id).join("task.json");
        let content = fs::read_to_string(&path)
            .map_err(io_err(format!("failed to read {}", path.display())))?;
        serde_json::from_str(&content).map_err(serde_err(format!("failed to parse {}", path.display())))
    }

    pub fn append_transition(&self, record: &TransitionRecord) -> Result<(), StoreError> {
        let dir = self.task_dir(&record.task_id);
        // transitions can be logged before the first snapshot lands
        fs::create_dir_all(&dir).map_err(io_err("failed to create task directory"))?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join("events.jsonl"))
            .map_err(io_err("failed to open transition log"))?;
        let line =
            serde_json::to_string(record).map_err(serde_err("failed to serialize transition"))?;
        writeln!(file, "{line}").map_err(io_err("failed to append transition"))
    }

    /// Reads the transition log, skipping torn or unparseable lines.
    pub fn load_transitions(&self, task_id: &TaskId) -> Result<Vec<TransitionRecord>, StoreError> {
        let path = self.task_dir(task_id).join("events.jsonl");
        if !path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&path).map_err(io_err("failed to open transition log"))?;
        let mut records = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.map_err(io_err("failed to read transition log"))?;
            if let Ok(record) = serde_json::from_str(&line) {
                records.push(record);
            }
        }
        Ok(records)
    }

    pub fn list_task_ids(&self) -> Result<Vec<TaskId>, StoreError> {
        let root = self.base_dir.join("tasks");
        if !root.exists() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in fs::read_dir(&root).map_err(io_err("failed to list tasks"))? {
            let entry = entry.map_err(io_err("failed to read task entry"))?;
            if entry.path().join("task.json").exists() {
                if let Some(name) = entry.file_name().to_str() {
                    ids.push(TaskId::new(name));
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    pub fn save_approval(&self, request: &ApprovalRequest) -> Result<(), StoreError> {
        let path = self
            .base_dir
            .join("approvals")
            .join(format!("{}.json", request.id));
        let content = serde_json::to_string_pretty(request)
            .map_err(serde_err("failed to serialize approval"))?;
        atomic_write(&path, &content)
    }

    pub fn load_approval(&self, id: &ApprovalId) -> Result<Option<ApprovalRequest>, StoreError> {
        if !is_plain_segment(id.as_str()) {
            return Ok(None);
        }
        let path = self.base_dir.join("approvals").join(format!("{id}.json"));
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)
            .map_err(io_err(format!("failed to read {}", path.display())))?;
        let request = serde_json::from_str(&content)
            .map_err(serde_err(format!("failed to parse {}", path.display())))?;
        Ok(Some(request))
    }

    pub fn load_approvals(&self) -> Result<Vec<ApprovalRequest>, StoreError> {
        let root = self.base_dir.join("approvals");
        if !root.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in fs::read_dir(&root).map_err(io_err("failed to list approvals"))? {
            let path = entry.map_err(io_err("failed to read approval entry"))?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let content = fs::read_to_string(&path)
                .map_err(io_err(format!("failed to read {}", path.display())))?;
            if let Ok(request) = serde_json::from_str(&content) {
                out.push(request);
            }
        }
        Ok(out)
    }
}

fn is_plain_segment(id: &str) -> bool {
    !id.is_empty() && id != "." && id != ".." && !id.contains(['/', '\\'])
}

fn atomic_write(path: &Path, content: &str) -> Result<(), StoreError> {
    let temp_path = path.with_extension("tmp");
    fs::write(&temp_path, content).map_err(io_err("failed to write temp file"))?;
    fs::rename(&temp_path, path).map_err(io_err("failed to rename temp file"))
}
