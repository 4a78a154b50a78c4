//! File-backed checkpoint store.
//!
//! Each job owns two files in the storage directory:
//! - `<job>.jsonl`: append-only event log, the source of truth
//! - `<job>.meta.json`: snapshot of the job record for inspection
//!
//! The log is replayed the first time a job is touched, so a new process
//! picks up exactly where a crashed one stopped. Jobs are discovered by
//! their snapshot files.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokengov_core::{CheckpointConfig, Chunk, ChunkId};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::record::{CheckpointEvent, JobRecord};
use super::{ChunkMeta, ChunkState, CheckpointError, CheckpointStore, JobProgress, JobStatus};

struct JobFile {
    record: JobRecord,
    done_since_snapshot: u32,
}

/// Checkpoint store backed by JSONL event logs.
pub struct JsonlCheckpointStore {
    dir: PathBuf,
    interval_chunks: u32,
    jobs: Mutex<HashMap<String, JobFile>>,
}

impl JsonlCheckpointStore {
    /// Open a store rooted at `dir`, creating the directory if needed.
    pub async fn open(dir: impl Into<PathBuf>, interval_chunks: u32) -> Result<Self, CheckpointError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            interval_chunks: interval_chunks.max(1),
            jobs: Mutex::new(HashMap::new()),
        })
    }

    /// Open a store from the `checkpoint` config section.
    pub async fn from_config(config: &CheckpointConfig) -> Result<Self, CheckpointError> {
        Self::open(config.storage_path.clone(), config.interval_chunks).await
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn log_path(&self, job_id: &str) -> PathBuf {
        self.dir.join(format!("{}.jsonl", job_id))
    }

    pub fn meta_path(&self, job_id: &str) -> PathBuf {
        self.dir.join(format!("{}.meta.json", job_id))
    }

    /// Replay a job's log. Returns `None` when the job has no log.
    async fn load(&self, job_id: &str) -> Result<Option<JobRecord>, CheckpointError> {
        let path = self.log_path(job_id);
        let contents = match fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let lines: Vec<&str> = contents.split_inclusive('\n').collect();
        let mut record: Option<JobRecord> = None;
        let mut good_len = 0usize;
        let mut torn = false;

        for (index, raw) in lines.iter().enumerate() {
            let line = raw.trim();
            if line.is_empty() {
                good_len += raw.len();
                continue;
            }
            let event: CheckpointEvent = match serde_json::from_str(line) {
                Ok(event) => event,
                // A crash mid-write leaves at most one torn line at the end
                Err(e) if index + 1 == lines.len() => {
                    tracing::warn!(path = %path.display(), error = %e, "Dropping torn final log line");
                    torn = true;
                    break;
                }
                Err(e) => {
                    return Err(CheckpointError::Corrupt {
                        path: path.clone(),
                        line: index + 1,
                        message: e.to_string(),
                    })
                }
            };

            let record = record.get_or_insert_with(|| {
                let at = match &event {
                    CheckpointEvent::Registered { at, .. } => *at,
                    _ => Utc::now(),
                };
                JobRecord::new(job_id, at)
            });
            record.apply(&event).map_err(|e| CheckpointError::Corrupt {
                path: path.clone(),
                line: index + 1,
                message: e.to_string(),
            })?;
            good_len += raw.len();
        }

        if torn {
            let file = fs::OpenOptions::new().write(true).open(&path).await?;
            file.set_len(good_len as u64).await?;
        } else if !contents.is_empty() && !contents.ends_with('\n') {
            let mut file = fs::OpenOptions::new().append(true).open(&path).await?;
            file.write_all(b"\n").await?;
        }

        if let Some(record) = &record {
            tracing::info!(
                job_id = %job_id,
                done = record.progress().done,
                pending = record.pending().len(),
                "Replayed checkpoint log"
            );
        }

        Ok(record)
    }

    async fn append(&self, job_id: &str, event: &CheckpointEvent) -> Result<(), CheckpointError> {
        let mut line = serde_json::to_string(event)?;
        line.push('\n');

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path(job_id))
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn write_snapshot(&self, record: &JobRecord) -> Result<(), CheckpointError> {
        let json = serde_json::to_vec_pretty(record)?;
        let path = self.meta_path(&record.job_id);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    /// Append an event to an already-registered job and apply it.
    async fn record_event(&self, job_id: &str, event: CheckpointEvent) -> Result<(), CheckpointError> {
        validate_job_id(job_id)?;
        let mut jobs = self.jobs.lock().await;
        if !jobs.contains_key(job_id) {
            let record = self
                .load(job_id)
                .await?
                .ok_or_else(|| CheckpointError::UnknownJob(job_id.to_string()))?;
            jobs.insert(
                job_id.to_string(),
                JobFile {
                    record,
                    done_since_snapshot: 0,
                },
            );
        }
        let Some(job) = jobs.get_mut(job_id) else {
            return Err(CheckpointError::UnknownJob(job_id.to_string()));
        };

        // Validate against a copy first so the log never holds an event the
        // record rejects
        let mut next = job.record.clone();
        next.apply(&event)?;
        self.append(job_id, &event).await?;
        job.record = next;

        let snapshot = match &event {
            CheckpointEvent::Started { .. } => false,
            CheckpointEvent::Done { .. } => {
                job.done_since_snapshot += 1;
                job.done_since_snapshot >= self.interval_chunks
            }
            _ => true,
        };
        if snapshot {
            job.done_since_snapshot = 0;
            self.write_snapshot(&job.record).await?;
        }

        Ok(())
    }

    async fn with_record<R>(
        &self,
        job_id: &str,
        f: impl FnOnce(&JobRecord) -> R,
    ) -> Result<Option<R>, CheckpointError> {
        validate_job_id(job_id)?;
        let mut jobs = self.jobs.lock().await;
        if let Some(job) = jobs.get(job_id) {
            return Ok(Some(f(&job.record)));
        }
        match self.load(job_id).await? {
            Some(record) => {
                let result = f(&record);
                jobs.insert(
                    job_id.to_string(),
                    JobFile {
                        record,
                        done_since_snapshot: 0,
                    },
                );
                Ok(Some(result))
            }
            None => Ok(None),
        }
    }
}

impl JsonlCheckpointStore {
    /// Progress of every job with a snapshot in the directory, sorted by id.
    pub async fn list_jobs(&self) -> Result<Vec<JobProgress>, CheckpointError> {
        let mut job_ids = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(job_id) = name.to_str().and_then(|n| n.strip_suffix(".meta.json")) else {
                continue;
            };
            if validate_job_id(job_id).is_ok() {
                job_ids.push(job_id.to_string());
            }
        }
        job_ids.sort();

        let mut jobs = Vec::with_capacity(job_ids.len());
        for job_id in job_ids {
            match self.status(&job_id).await? {
                Some(progress) => jobs.push(progress),
                // Snapshot without a log: report what the snapshot says
                None => {
                    let raw = fs::read(self.meta_path(&job_id)).await?;
                    let record: JobRecord = serde_json::from_slice(&raw)?;
                    jobs.push(record.progress());
                }
            }
        }
        Ok(jobs)
    }

    /// Jobs that still have work left: anything not completed cleanly.
    pub async fn resumable_jobs(&self) -> Result<Vec<JobProgress>, CheckpointError> {
        Ok(self
            .list_jobs()
            .await?
            .into_iter()
            .filter(|job| job.status != JobStatus::Completed)
            .collect())
    }

    /// Delete a job's log and snapshot. Returns false if neither existed.
    pub async fn cleanup(&self, job_id: &str) -> Result<bool, CheckpointError> {
        validate_job_id(job_id)?;
        let mut jobs = self.jobs.lock().await;
        jobs.remove(job_id);

        let mut removed = false;
        for path in [self.log_path(job_id), self.meta_path(job_id)] {
            match fs::remove_file(&path).await {
                Ok(()) => removed = true,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        if removed {
            tracing::info!(job_id = %job_id, "Removed checkpoint files");
        }
        Ok(removed)
    }
}

/// Job ids become file names, so keep them to a safe alphabet.
fn validate_job_id(job_id: &str) -> Result<(), CheckpointError> {
    let valid = !job_id.is_empty()
        && !job_id.starts_with('.')
        && job_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(CheckpointError::InvalidJobId(job_id.to_string()))
    }
}

#[async_trait]
impl CheckpointStore for JsonlCheckpointStore {
    async fn register_chunks(&self, job_id: &str, chunks: &[Chunk]) -> Result<JobProgress, CheckpointError> {
        validate_job_id(job_id)?;
        let mut jobs = self.jobs.lock().await;
        if !jobs.contains_key(job_id) {
            let record = match self.load(job_id).await? {
                Some(record) => record,
                None => JobRecord::new(job_id, Utc::now()),
            };
            jobs.insert(
                job_id.to_string(),
                JobFile {
                    record,
                    done_since_snapshot: 0,
                },
            );
        }
        let Some(job) = jobs.get_mut(job_id) else {
            return Err(CheckpointError::UnknownJob(job_id.to_string()));
        };

        let event = CheckpointEvent::registered(chunks);
        let mut next = job.record.clone();
        next.apply(&event)?;
        self.append(job_id, &event).await?;
        job.record = next;
        job.done_since_snapshot = 0;
        self.write_snapshot(&job.record).await?;

        Ok(job.record.progress())
    }

    async fn pending(&self, job_id: &str) -> Result<Vec<ChunkId>, CheckpointError> {
        self.with_record(job_id, JobRecord::pending)
            .await?
            .ok_or_else(|| CheckpointError::UnknownJob(job_id.to_string()))
    }

    async fn mark_started(&self, job_id: &str, chunk_id: ChunkId, worker_id: usize) -> Result<(), CheckpointError> {
        self.record_event(job_id, CheckpointEvent::started(chunk_id, worker_id)).await
    }

    async fn mark_done(&self, job_id: &str, chunk_id: ChunkId, meta: ChunkMeta) -> Result<(), CheckpointError> {
        self.record_event(job_id, CheckpointEvent::done(chunk_id, meta)).await
    }

    async fn mark_failed(&self, job_id: &str, chunk_id: ChunkId, error: &str) -> Result<(), CheckpointError> {
        self.record_event(job_id, CheckpointEvent::failed(chunk_id, error)).await
    }

    async fn completed(&self, job_id: &str) -> Result<Vec<ChunkState>, CheckpointError> {
        self.with_record(job_id, JobRecord::completed)
            .await?
            .ok_or_else(|| CheckpointError::UnknownJob(job_id.to_string()))
    }

    async fn complete(&self, job_id: &str, status: JobStatus) -> Result<(), CheckpointError> {
        self.record_event(job_id, CheckpointEvent::completed(status)).await
    }

    async fn status(&self, job_id: &str) -> Result<Option<JobProgress>, CheckpointError> {
        self.with_record(job_id, JobRecord::progress).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn chunks(texts: &[&str]) -> Vec<Chunk> {
        texts
            .iter()
            .enumerate()
            .map(|(i, t)| Chunk::from_text(i as u64, *t))
            .collect()
    }

    fn meta(payload: serde_json::Value) -> ChunkMeta {
        ChunkMeta {
            model: "model-a".to_string(),
            worker_id: 2,
            output_tokens: 9,
            processing_time: Duration::from_millis(15),
            payload,
        }
    }

    async fn read_meta(store: &JsonlCheckpointStore, job_id: &str) -> JobRecord {
        let raw = fs::read_to_string(store.meta_path(job_id)).await.unwrap();
        serde_json::from_str(&raw).unwrap()
    }

    #[tokio::test]
    async fn test_resume_across_instances() {
        let dir = TempDir::new().unwrap();
        let doc = chunks(&["alpha", "beta", "gamma"]);

        {
            let store = JsonlCheckpointStore::open(dir.path(), 10).await.unwrap();
            store.register_chunks("job-1", &doc).await.unwrap();
            store.mark_started("job-1", 0, 2).await.unwrap();
            store.mark_done("job-1", 0, meta(serde_json::json!({"summary": "a"}))).await.unwrap();
            store.mark_failed("job-1", 1, "HTTP 503").await.unwrap();
            store.mark_started("job-1", 2, 2).await.unwrap();
            // Process "crashes" here with chunk 2 in progress
        }

        let store = JsonlCheckpointStore::open(dir.path(), 10).await.unwrap();
        let progress = store.status("job-1").await.unwrap().unwrap();
        assert_eq!(progress.done, 1);
        assert_eq!(progress.failed, 1);
        assert_eq!(progress.in_progress, 1);

        let progress = store.register_chunks("job-1", &doc).await.unwrap();
        assert_eq!(progress.status, JobStatus::Resumed);
        assert_eq!(store.pending("job-1").await.unwrap(), vec![1, 2]);

        let done = store.completed("job-1").await.unwrap();
        assert_eq!(done[0].payload, Some(serde_json::json!({"summary": "a"})));
        assert_eq!(done[0].worker_id, Some(2));
    }

    #[tokio::test]
    async fn test_meta_snapshot_written() {
        let dir = TempDir::new().unwrap();
        let store = JsonlCheckpointStore::open(dir.path(), 2).await.unwrap();
        store.register_chunks("job", &chunks(&["a", "b", "c"])).await.unwrap();

        assert_eq!(read_meta(&store, "job").await.progress().pending, 3);

        store.mark_done("job", 0, meta(serde_json::json!("x"))).await.unwrap();
        // Interval not reached yet
        assert_eq!(read_meta(&store, "job").await.progress().done, 0);

        store.mark_done("job", 1, meta(serde_json::json!("y"))).await.unwrap();
        assert_eq!(read_meta(&store, "job").await.progress().done, 2);

        store.complete("job", JobStatus::Completed).await.unwrap();
        assert_eq!(read_meta(&store, "job").await.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_changed_document_resets_chunk() {
        let dir = TempDir::new().unwrap();
        let store = JsonlCheckpointStore::open(dir.path(), 10).await.unwrap();
        store.register_chunks("job", &chunks(&["a", "b"])).await.unwrap();
        store.mark_done("job", 0, meta(serde_json::json!("x"))).await.unwrap();
        store.mark_done("job", 1, meta(serde_json::json!("y"))).await.unwrap();

        let reopened = JsonlCheckpointStore::open(dir.path(), 10).await.unwrap();
        reopened.register_chunks("job", &chunks(&["a", "b edited"])).await.unwrap();
        assert_eq!(reopened.pending("job").await.unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn test_torn_last_line_is_ignored() {
        let dir = TempDir::new().unwrap();
        {
            let store = JsonlCheckpointStore::open(dir.path(), 10).await.unwrap();
            store.register_chunks("job", &chunks(&["a", "b"])).await.unwrap();
            store.mark_done("job", 0, meta(serde_json::json!("x"))).await.unwrap();
        }

        let path = dir.path().join("job.jsonl");
        let mut file = fs::OpenOptions::new().append(true).open(&path).await.unwrap();
        file.write_all(b"{\"event\":\"done\",\"chunk_id\":1,\"mod").await.unwrap();
        file.flush().await.unwrap();

        let store = JsonlCheckpointStore::open(dir.path(), 10).await.unwrap();
        assert_eq!(store.pending("job").await.unwrap(), vec![1]);

        // The torn fragment is gone, so later appends stay parseable
        store.mark_done("job", 1, meta(serde_json::json!("y"))).await.unwrap();
        let reopened = JsonlCheckpointStore::open(dir.path(), 10).await.unwrap();
        assert!(reopened.pending("job").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_middle_line_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("job.jsonl");
        fs::write(&path, "not json\n{\"event\":\"completed\",\"status\":\"COMPLETED\",\"at\":\"2026-01-01T00:00:00Z\"}\n")
            .await
            .unwrap();

        let store = JsonlCheckpointStore::open(dir.path(), 10).await.unwrap();
        assert!(matches!(
            store.status("job").await,
            Err(CheckpointError::Corrupt { line: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_invalid_job_id_rejected() {
        let dir = TempDir::new().unwrap();
        let store = JsonlCheckpointStore::open(dir.path(), 10).await.unwrap();
        assert!(matches!(
            store.register_chunks("../escape", &chunks(&["a"])).await,
            Err(CheckpointError::InvalidJobId(_))
        ));
    }

    #[tokio::test]
    async fn test_list_and_resumable_jobs() {
        let dir = TempDir::new().unwrap();
        let store = JsonlCheckpointStore::open(dir.path(), 10).await.unwrap();
        store.register_chunks("beta", &chunks(&["a", "b"])).await.unwrap();
        store.mark_done("beta", 0, meta(serde_json::json!("x"))).await.unwrap();
        store.complete("beta", JobStatus::Cancelled).await.unwrap();
        store.register_chunks("alpha", &chunks(&["a"])).await.unwrap();
        store.mark_done("alpha", 0, meta(serde_json::json!("x"))).await.unwrap();
        store.complete("alpha", JobStatus::Completed).await.unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").await.unwrap();

        let reopened = JsonlCheckpointStore::open(dir.path(), 10).await.unwrap();
        let jobs = reopened.list_jobs().await.unwrap();
        let ids: Vec<&str> = jobs.iter().map(|j| j.job_id.as_str()).collect();
        assert_eq!(ids, vec!["alpha", "beta"]);
        assert_eq!(jobs[1].done, 1);

        let resumable = reopened.resumable_jobs().await.unwrap();
        assert_eq!(resumable.len(), 1);
        assert_eq!(resumable[0].job_id, "beta");
        assert_eq!(resumable[0].status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_empty_directory_lists_nothing() {
        let dir = TempDir::new().unwrap();
        let store = JsonlCheckpointStore::open(dir.path().join("fresh"), 10).await.unwrap();
        assert!(store.list_jobs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_removes_job_files() {
        let dir = TempDir::new().unwrap();
        let store = JsonlCheckpointStore::open(dir.path(), 10).await.unwrap();
        store.register_chunks("job", &chunks(&["a"])).await.unwrap();
        store.complete("job", JobStatus::Completed).await.unwrap();

        assert!(store.cleanup("job").await.unwrap());
        assert!(!store.log_path("job").exists());
        assert!(!store.meta_path("job").exists());
        assert!(store.status("job").await.unwrap().is_none());
        assert!(store.list_jobs().await.unwrap().is_empty());

        assert!(!store.cleanup("job").await.unwrap());
        assert!(matches!(
            store.cleanup("../x").await,
            Err(CheckpointError::InvalidJobId(_))
        ));
    }

    #[tokio::test]
    async fn test_unregistered_job() {
        let dir = TempDir::new().unwrap();
        let store = JsonlCheckpointStore::open(dir.path(), 10).await.unwrap();
        assert!(store.status("nothing").await.unwrap().is_none());
        assert!(matches!(
            store.mark_done("nothing", 0, meta(serde_json::json!(null))).await,
            Err(CheckpointError::UnknownJob(_))
        ));
    }
}
