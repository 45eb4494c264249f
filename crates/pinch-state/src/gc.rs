//! TTL garbage collection of per-handle state.
//!
//! One delayed task per session. The session nonce is the re-use guard: a
//! sweep that fires after its handle token was re-minted must not touch the
//! newer session's state.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::results::{Reclaim, ResultStore};
use crate::writers::WriterRegistry;

/// Digest sidecar paths for an output fifo path.
pub fn sidecar_paths(out_path: &Path) -> [PathBuf; 2] {
    [
        PathBuf::from(format!("{}.xxh128", out_path.display())),
        PathBuf::from(format!("{}.blake3", out_path.display())),
    ]
}

/// Sleep `ttl`, then reclaim the session's result cell, digest sidecars, and
/// any lingering writer. A no-op when the handle was re-used since.
pub async fn sweep_after(
    writers: Arc<WriterRegistry>,
    results: Arc<ResultStore>,
    handle: String,
    session: u64,
    ttl: Duration,
    out_path: PathBuf,
) {
    debug!(handle, session, ?ttl, "scheduled state sweep");
    tokio::time::sleep(ttl).await;

    match results.reclaim(&handle, session) {
        Reclaim::Reused => {
            info!(handle, session, "handle re-used, skipping sweep");
            return;
        }
        Reclaim::Removed => info!(handle, session, "swept result cell"),
        Reclaim::Missing => debug!(handle, session, "no result cell to sweep"),
    }

    for sidecar in sidecar_paths(&out_path) {
        if std::fs::remove_file(&sidecar).is_ok() {
            debug!(path = %sidecar.display(), "removed digest sidecar");
        }
    }
    if writers.maybe_release(&handle) {
        info!(handle, "released lingering writer during sweep");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::results::{Checksums, PipelineResult};
    use chrono::Utc;

    fn result() -> PipelineResult {
        PipelineResult {
            start: Utc::now(),
            duration: Duration::from_millis(5),
            success: true,
            stderr: String::new(),
            checksums: Some(Checksums {
                xxh128: "aa".into(),
                blake3: "bb".into(),
            }),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_removes_cell_and_sidecars() {
        let dir = tempfile::tempdir().unwrap();
        let out_path = dir.path().join("h1");
        for sidecar in sidecar_paths(&out_path) {
            std::fs::write(&sidecar, "digest -\n").unwrap();
        }

        let writers = Arc::new(WriterRegistry::new());
        let results = Arc::new(ResultStore::new());
        results.finish("h1", 42, result());

        let sweep = tokio::spawn(sweep_after(
            writers,
            results.clone(),
            "h1".into(),
            42,
            Duration::from_secs(60),
            out_path.clone(),
        ));
        tokio::time::sleep(Duration::from_secs(61)).await;
        sweep.await.unwrap();

        assert!(!results.contains("h1"));
        for sidecar in sidecar_paths(&out_path) {
            assert!(!sidecar.exists());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_skips_reused_handle() {
        let dir = tempfile::tempdir().unwrap();
        let out_path = dir.path().join("h2");
        for sidecar in sidecar_paths(&out_path) {
            std::fs::write(&sidecar, "digest -\n").unwrap();
        }

        let writers = Arc::new(WriterRegistry::new());
        let results = Arc::new(ResultStore::new());
        results.finish("h2", 1, result());
        // Token re-used by a later session before the first sweep fires.
        results.finish("h2", 2, result());

        let sweep = tokio::spawn(sweep_after(
            writers,
            results.clone(),
            "h2".into(),
            1,
            Duration::from_secs(30),
            out_path.clone(),
        ));
        tokio::time::sleep(Duration::from_secs(31)).await;
        sweep.await.unwrap();

        assert!(results.contains("h2"));
        for sidecar in sidecar_paths(&out_path) {
            assert!(sidecar.exists(), "second session's sidecars must survive");
        }
    }
}
