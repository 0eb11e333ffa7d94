// ===============================
// src/store.rs
// ===============================
//
// Last-run timestamps per job, so schedules survive restarts.
// File layout: a single JSON object {"job_name": "2025-01-01T00:00:00Z", ...}
//
use std::path::PathBuf;
use std::sync::Mutex;

use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::fs;

pub type LastRuns = HashMap<String, DateTime<Utc>>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("last-run store io: {0}")]
    Io(#[from] std::io::Error),
    #[error("last-run store json: {0}")]
    Json(#[from] serde_json::Error),
}

#[async_trait]
pub trait LastRunStore: Send + Sync + 'static {
    async fn load_all(&self) -> Result<LastRuns, StoreError>;
    async fn save(&self, job: &str, at: DateTime<Utc>) -> Result<(), StoreError>;
}

pub struct FileLastRunStore {
    path: PathBuf,
    // read-modify-write must not interleave
    write_lock: tokio::sync::Mutex<()>,
}

impl FileLastRunStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), write_lock: tokio::sync::Mutex::new(()) }
    }

    async fn read(&self) -> Result<LastRuns, StoreError> {
        match fs::read(&self.path).await {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(LastRuns::new()),
            Ok(bytes) => {
                let map: std::collections::HashMap<String, DateTime<Utc>> = serde_json::from_slice(&bytes)?;
                Ok(map.into_iter().collect())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(LastRuns::new()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl LastRunStore for FileLastRunStore {
    async fn load_all(&self) -> Result<LastRuns, StoreError> { self.read().await }

    async fn save(&self, job: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut runs = self.read().await?;
        runs.insert(job.to_string(), at);

        let sorted: std::collections::BTreeMap<_, _> = runs.into_iter().collect();
        let body = serde_json::to_vec_pretty(&sorted)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        // tmp + rename: readers never see a half-written file
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, body).await?;
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryLastRunStore {
    runs: Mutex<LastRuns>,
}

impl MemoryLastRunStore {
    pub fn new() -> Self { Self::default() }

    pub fn with(self, job: &str, at: DateTime<Utc>) -> Self {
        if let Ok(mut runs) = self.runs.lock() {
            runs.insert(job.to_string(), at);
        }
        self
    }

    pub fn get(&self, job: &str) -> Option<DateTime<Utc>> {
        self.runs.lock().ok()?.get(job).copied()
    }
}

#[async_trait]
impl LastRunStore for MemoryLastRunStore {
    async fn load_all(&self) -> Result<LastRuns, StoreError> {
        Ok(self.runs.lock().map(|r| r.clone()).unwrap_or_default())
    }

    async fn save(&self, job: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        if let Ok(mut runs) = self.runs.lock() {
            runs.insert(job.to_string(), at);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn temp_path(tag: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("portfolio_sync_{tag}_{}_{}", std::process::id(), rand::random::<u32>()))
            .join("last_runs.json")
    }

    #[tokio::test]
    async fn missing_file_loads_empty() {
        let store = FileLastRunStore::new(temp_path("missing"));
        assert!(store.load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn file_store_persists_across_instances() {
        let path = temp_path("persist");
        let t1 = Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap();
        let t2 = Utc.with_ymd_and_hms(2025, 2, 3, 4, 5, 6).unwrap();

        let store = FileLastRunStore::new(&path);
        store.save("update_kraken", t1).await.unwrap();
        store.save("mock_sync", t2).await.unwrap();
        store.save("update_kraken", t2).await.unwrap();

        let reopened = FileLastRunStore::new(&path);
        let runs = reopened.load_all().await.unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs["update_kraken"], t2);
        assert_eq!(runs["mock_sync"], t2);

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[tokio::test]
    async fn corrupt_file_is_an_error() {
        let path = temp_path("corrupt");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"{not json").unwrap();
        let store = FileLastRunStore::new(&path);
        assert!(matches!(store.load_all().await, Err(StoreError::Json(_))));
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[tokio::test]
    async fn memory_store_roundtrip() {
        let t = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let store = MemoryLastRunStore::new().with("a", t);
        store.save("b", t).await.unwrap();
        let all = store.load_all().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(store.get("b"), Some(t));
    }
}
