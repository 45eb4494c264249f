//! Transform supervision.
//!
//! One supervisor task per session: launch the shell pipeline under the
//! external `timeout` wrapper, capture stderr, harvest the digest sidecars,
//! record the terminal result, tear the fifos down, and schedule the TTL
//! sweep. Failures never propagate to an HTTP caller; they are visible only
//! through the result store.

use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::process::Command;
use tracing::{info, warn};

use pinch_fifo::FifoPair;
use pinch_state::{gc, Checksums, PipelineResult, ResultStore, WriterRegistry};

use crate::command::{kill_after, shell_pipeline, AdaptLevels, Cipher, Direction};

const STDERR_CAP: usize = 1 << 20;
const UNKNOWN_DIGEST: &str = "UNKNOWN";

/// Everything a supervisor task needs for one session.
pub struct Launch {
    /// Session handle token
    pub handle: String,
    /// Re-use guard nonce (see [`pinch_state::next_session`])
    pub session: u64,
    /// Transform direction
    pub direction: Direction,
    /// zstd adaptive bounds
    pub levels: AdaptLevels,
    /// Optional encryption stage
    pub cipher: Cipher,
    /// Hard wall-clock limit; doubles as the state TTL
    pub timeout: Duration,
    /// The provisioned fifo pair, owned by the supervisor until exit
    pub pair: FifoPair,
    /// Shared writer registry
    pub writers: Arc<WriterRegistry>,
    /// Shared result store
    pub results: Arc<ResultStore>,
}

/// Run one transform session to completion. Spawned as a background task by
/// the session controller.
pub async fn run(launch: Launch) {
    let Launch {
        handle,
        session,
        direction,
        levels,
        cipher,
        timeout,
        pair,
        writers,
        results,
    } = launch;

    results.prepare(&handle, session);
    let started = Utc::now();
    let clock = Instant::now();

    let result = match shell_pipeline(direction, &pair.in_path, &pair.out_path, levels, &cipher) {
        Ok(pipeline) => {
            info!(handle, %pipeline, timeout_secs = timeout.as_secs(), "spawning transform pipeline");
            info!(handle, produce = %pair.in_path.display(), consume = %pair.out_path.display(), "fifo endpoints ready");
            execute(&handle, &pipeline, timeout, &pair, started, clock).await
        }
        Err(err) => {
            warn!(handle, %err, "refusing to assemble pipeline");
            PipelineResult {
                start: started,
                duration: clock.elapsed(),
                success: false,
                stderr: err.to_string(),
                checksums: None,
            }
        }
    };

    results.finish(&handle, session, result);
    writers.maybe_release(&handle);

    let out_path = pair.out_path.clone();
    pair.close();

    tokio::spawn(gc::sweep_after(
        writers, results, handle, session, timeout, out_path,
    ));
}

async fn execute(
    handle: &str,
    pipeline: &str,
    limit: Duration,
    pair: &FifoPair,
    started: chrono::DateTime<Utc>,
    clock: Instant,
) -> PipelineResult {
    let (term_after, kill_at) = kill_after(limit);
    let output = Command::new("timeout")
        .arg(format!("--kill-after={kill_at}"))
        .arg(term_after)
        .arg("bash")
        .arg("-c")
        .arg(format!("set -o pipefail; {pipeline}"))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await;

    let duration = clock.elapsed();
    match output {
        Ok(output) if output.status.success() => {
            info!(handle, ?duration, "pipeline succeeded");
            PipelineResult {
                start: started,
                duration,
                success: true,
                stderr: capped_stderr(&output.stderr),
                checksums: Some(read_digests(&pair.out_path).await),
            }
        }
        Ok(output) => {
            let mut stderr = capped_stderr(&output.stderr);
            if stderr.trim().is_empty() {
                stderr = format!("pipeline exited with {}", output.status);
            }
            warn!(handle, status = %output.status, ?duration, "pipeline failed");
            PipelineResult {
                start: started,
                duration,
                success: false,
                stderr,
                checksums: None,
            }
        }
        Err(err) => {
            warn!(handle, %err, "could not launch pipeline");
            PipelineResult {
                start: started,
                duration,
                success: false,
                stderr: format!("could not launch pipeline: {err}"),
                checksums: None,
            }
        }
    }
}

fn capped_stderr(raw: &[u8]) -> String {
    let capped = &raw[..raw.len().min(STDERR_CAP)];
    let mut text = String::from_utf8_lossy(capped).into_owned();
    if raw.len() > STDERR_CAP {
        text.push_str("\n[stderr truncated]");
    }
    text
}

/// A sidecar holds the digest as its first whitespace-delimited token. An
/// absent or unreadable sidecar degrades to `UNKNOWN` rather than failing the
/// session.
async fn read_digests(out_path: &std::path::Path) -> Checksums {
    let [xxh_path, blake_path] = gc::sidecar_paths(out_path);
    Checksums {
        xxh128: first_token(&xxh_path).await,
        blake3: first_token(&blake_path).await,
    }
}

async fn first_token(path: &std::path::Path) -> String {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => contents
            .split_whitespace()
            .next()
            .map(str::to_owned)
            .unwrap_or_else(|| UNKNOWN_DIGEST.to_string()),
        Err(_) => UNKNOWN_DIGEST.to_string(),
    }
}
