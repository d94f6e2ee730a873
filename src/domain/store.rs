//! Queue persistence capability (§6, §4.5): a JSON document whose
//! top-level is a list of reservation records, replaced atomically on
//! every mutation so a crash mid-write never corrupts the previous
//! durable state.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::domain::reservation::ReservationRequest;
use crate::error::{QueueError, Result};

#[async_trait]
pub trait QueueStore: Send + Sync {
    async fn load_all(&self) -> Result<Vec<ReservationRequest>>;
    async fn save_all(&self, requests: &[ReservationRequest]) -> Result<()>;
}

/// File-backed implementation: writes to a sibling temp path then renames
/// over the original, which is atomic on the same filesystem.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        JsonFileStore { path: path.into() }
    }
}

#[async_trait]
impl QueueStore for JsonFileStore {
    async fn load_all(&self) -> Result<Vec<ReservationRequest>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let data = tokio::fs::read_to_string(&self.path).await.map_err(QueueError::Persistence)?;
        let requests: Vec<ReservationRequest> = serde_json::from_str(&data).map_err(QueueError::Serialization)?;
        Ok(requests)
    }

    async fn save_all(&self, requests: &[ReservationRequest]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(QueueError::Persistence)?;
            }
        }
        let serialized = serde_json::to_string_pretty(requests).map_err(QueueError::Serialization)?;
        let tmp_path = tmp_path_for(&self.path);
        tokio::fs::write(&tmp_path, serialized).await.map_err(QueueError::Persistence)?;
        tokio::fs::rename(&tmp_path, &self.path).await.map_err(QueueError::Persistence)?;
        Ok(())
    }
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

/// In-memory implementation for tests: holds no file handle, so tests
/// never touch the filesystem.
#[derive(Default)]
pub struct InMemoryStore {
    inner: tokio::sync::Mutex<Vec<ReservationRequest>>,
}

#[async_trait]
impl QueueStore for InMemoryStore {
    async fn load_all(&self) -> Result<Vec<ReservationRequest>> {
        Ok(self.inner.lock().await.clone())
    }

    async fn save_all(&self, requests: &[ReservationRequest]) -> Result<()> {
        *self.inner.lock().await = requests.to_vec();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::contact::ContactInfo;
    use crate::domain::tier::UserTier;
    use chrono::{NaiveDate, Utc};

    fn sample_request() -> ReservationRequest {
        ReservationRequest::new(
            "u1",
            ContactInfo {
                first_name: "Ana".to_string(),
                last_name: "Lopez".to_string(),
                phone: "555".to_string(),
                email: "a@b.test".to_string(),
            },
            NaiveDate::from_ymd_opt(2025, 8, 15).unwrap(),
            "10:00",
            vec![1],
            UserTier::Regular,
            &[1],
            Utc::now(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn save_then_load_round_trips_by_id_and_fields() {
        let dir = std::env::temp_dir().join(format!("court_reservation_bot_test_{}", uuid::Uuid::new_v4()));
        let store = JsonFileStore::new(dir.join("queue.json"));
        let requests = vec![sample_request(), sample_request()];

        store.save_all(&requests).await.unwrap();
        let loaded = store.load_all().await.unwrap();

        assert_eq!(loaded.len(), requests.len());
        for (a, b) in requests.iter().zip(loaded.iter()) {
            assert_eq!(a.id, b.id);
            assert_eq!(a.user_id, b.user_id);
            assert_eq!(a.target_date, b.target_date);
            assert_eq!(a.target_time, b.target_time);
        }

        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn load_all_on_missing_file_returns_empty() {
        let store = JsonFileStore::new("/tmp/does-not-exist-court-reservation-bot/queue.json");
        let loaded = store.load_all().await.unwrap();
        assert!(loaded.is_empty());
    }

    #[tokio::test]
    async fn in_memory_store_round_trips() {
        let store = InMemoryStore::default();
        let requests = vec![sample_request()];
        store.save_all(&requests).await.unwrap();
        let loaded = store.load_all().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, requests[0].id);
    }
}
