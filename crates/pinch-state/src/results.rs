//! Terminal pipeline results with blocking waiters.
//!
//! Each handle owns one result cell. The supervisor is the sole finisher; any
//! number of status waiters block on the cell's one-shot signal. The signal is
//! raised strictly after the result is populated, so a waiter that observes
//! `done` always reads the finished value.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::debug;

/// Content digests of the uncompressed stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checksums {
    /// 128-bit fast hash, hex (or `UNKNOWN` when the sidecar was unreadable)
    pub xxh128: String,
    /// 256-bit cryptographic hash, hex (or `UNKNOWN`)
    pub blake3: String,
}

/// Terminal outcome of one transform session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineResult {
    /// When the pipeline was launched
    pub start: DateTime<Utc>,
    /// Wall-clock runtime of the pipeline
    #[serde(with = "humantime_duration")]
    pub duration: Duration,
    /// Whether the pipeline exited zero within its deadline
    pub success: bool,
    /// Captured (capped) stderr of the pipeline
    pub stderr: String,
    /// Digests; populated only on success
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksums: Option<Checksums>,
}

mod humantime_duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&humantime::format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

/// What the garbage collector found when it fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reclaim {
    /// The cell belonged to the firing session and was removed
    Removed,
    /// The handle was re-used by a later session; nothing was touched
    Reused,
    /// No cell existed for the handle
    Missing,
}

#[derive(Debug)]
struct CellState {
    session: u64,
    result: Option<PipelineResult>,
}

#[derive(Debug)]
struct ResultCell {
    state: Mutex<CellState>,
    done: watch::Sender<bool>,
}

impl ResultCell {
    fn new(session: u64) -> Self {
        let (done, _) = watch::channel(false);
        Self {
            state: Mutex::new(CellState {
                session,
                result: None,
            }),
            done,
        }
    }
}

/// Process-wide handle → result-cell map.
#[derive(Debug, Default)]
pub struct ResultStore {
    cells: DashMap<String, Arc<ResultCell>>,
}

impl ResultStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a pending cell for the handle if none exists. Idempotent.
    pub fn prepare(&self, handle: &str, session: u64) {
        self.cells
            .entry(handle.to_string())
            .or_insert_with(|| Arc::new(ResultCell::new(session)));
    }

    /// Populate the handle's result and wake every waiter.
    ///
    /// The result is written before the signal is raised; after this call the
    /// cell is immutable until the handle is re-used by a later session.
    pub fn finish(&self, handle: &str, session: u64, result: PipelineResult) {
        let cell = self
            .cells
            .entry(handle.to_string())
            .or_insert_with(|| Arc::new(ResultCell::new(session)))
            .value()
            .clone();
        {
            let mut state = cell.state.lock();
            state.session = session;
            state.result = Some(result);
        }
        cell.done.send_replace(true);
        debug!(handle, session, "recorded terminal result");
    }

    /// Wait up to `wait_for` for the handle's terminal result.
    ///
    /// A result that is already recorded is returned even for a zero wait;
    /// otherwise a zero wait, a missing cell, or an elapsed deadline all
    /// return `None`.
    pub async fn wait(&self, handle: &str, wait_for: Duration) -> Option<PipelineResult> {
        let cell = self.cells.get(handle)?.value().clone();
        if let Some(result) = cell.state.lock().result.clone() {
            return Some(result);
        }
        if wait_for.is_zero() {
            return None;
        }

        let mut done = cell.done.subscribe();
        let outcome = tokio::time::timeout(wait_for, done.wait_for(|done| *done)).await;
        match outcome {
            Ok(Ok(_)) => cell.state.lock().result.clone(),
            _ => None,
        }
    }

    /// Remove the handle's cell iff it still belongs to `session`.
    pub fn reclaim(&self, handle: &str, session: u64) -> Reclaim {
        let Some(cell) = self.cells.get(handle).map(|c| c.value().clone()) else {
            return Reclaim::Missing;
        };
        if cell.state.lock().session != session {
            return Reclaim::Reused;
        }
        self.cells.remove(handle);
        Reclaim::Removed
    }

    /// Whether a cell (pending or done) exists for the handle.
    pub fn contains(&self, handle: &str) -> bool {
        self.cells.contains_key(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(success: bool) -> PipelineResult {
        PipelineResult {
            start: Utc::now(),
            duration: Duration::from_millis(1500),
            success,
            stderr: String::new(),
            checksums: success.then(|| Checksums {
                xxh128: "aa".into(),
                blake3: "bb".into(),
            }),
        }
    }

    #[tokio::test]
    async fn test_wait_without_cell_is_none() {
        let store = ResultStore::new();
        assert!(store.wait("nope", Duration::from_millis(10)).await.is_none());
    }

    #[tokio::test]
    async fn test_zero_wait_pending_is_none_but_done_is_some() {
        let store = ResultStore::new();
        store.prepare("h", 1);
        assert!(store.wait("h", Duration::ZERO).await.is_none());

        store.finish("h", 1, result(true));
        assert!(store.wait("h", Duration::ZERO).await.is_some());
    }

    #[tokio::test]
    async fn test_waiter_unblocks_on_finish() {
        let store = Arc::new(ResultStore::new());
        store.prepare("h", 7);

        let waiter = {
            let store = store.clone();
            tokio::spawn(async move { store.wait("h", Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        store.finish("h", 7, result(true));

        let got = waiter.await.unwrap().expect("result");
        assert!(got.success);
        assert_eq!(got.checksums.unwrap().xxh128, "aa");
    }

    #[tokio::test]
    async fn test_wait_deadline_elapses() {
        let store = ResultStore::new();
        store.prepare("h", 1);
        let got = store.wait("h", Duration::from_millis(30)).await;
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn test_result_immutable_after_finish() {
        let store = ResultStore::new();
        let first = result(true);
        store.finish("h", 1, first.clone());

        let a = store.wait("h", Duration::ZERO).await.unwrap();
        let b = store.wait("h", Duration::from_secs(1)).await.unwrap();
        assert_eq!(serde_json::to_string(&a).unwrap(), serde_json::to_string(&b).unwrap());
        assert_eq!(a, first);
    }

    #[tokio::test]
    async fn test_prepare_is_idempotent() {
        let store = ResultStore::new();
        store.prepare("h", 1);
        store.prepare("h", 1);
        assert!(store.contains("h"));
    }

    #[tokio::test]
    async fn test_reclaim_guards_reused_handle() {
        let store = ResultStore::new();
        store.finish("h", 1, result(false));

        // The same token was handed to a later session.
        store.finish("h", 2, result(true));

        assert_eq!(store.reclaim("h", 1), Reclaim::Reused);
        assert!(store.contains("h"));
        assert_eq!(store.reclaim("h", 2), Reclaim::Removed);
        assert!(!store.contains("h"));
        assert_eq!(store.reclaim("h", 2), Reclaim::Missing);
    }

    #[test]
    fn test_result_serialization_shape() {
        let json = serde_json::to_value(result(true)).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["duration"], "1s 500ms");
        assert_eq!(json["checksums"]["blake3"], "bb");

        let failed = serde_json::to_value(result(false)).unwrap();
        assert!(failed.get("checksums").is_none());
    }

    #[test]
    fn test_result_roundtrips_through_json() {
        let original = result(true);
        let json = serde_json::to_string(&original).unwrap();
        let back: PipelineResult = serde_json::from_str(&json).unwrap();
        assert_eq!(back, original);
    }
}
