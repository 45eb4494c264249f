//! I/O attachment layer: PUT and GET `/io/{handle}`.
//!
//! The write side copies a request body into the handle's input fifo; the
//! read side streams the output fifo back as a chunked response whose
//! trailers carry byte counts and, once the transform has finished, the two
//! content digests. A PUT without `writeonly` overlaps both halves on the
//! same response so one round-trip uploads and downloads.

use std::fs::OpenOptions;
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path as UrlPath, Query, Request, State};
use axum::http::header::{HeaderName, HeaderValue};
use axum::http::{header, HeaderMap, Response, StatusCode};
use bytes::Bytes;
use futures::StreamExt;
use http_body::Frame;
use http_body_util::StreamBody;
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use pinch_state::WriterSlot;

use crate::error::{PinchError, Result};
use crate::params::parse_io_flags;
use crate::service::{RawQuery, Service};

/// How long the read half waits for the terminal result before giving up on
/// digest trailers. The transform has already closed its output by then, so
/// the result is normally immediate.
const DIGEST_WAIT: Duration = Duration::from_secs(5);

/// Poll cadence while a combined-mode reader waits for the transform to open
/// its output side.
const ATTACH_POLL: Duration = Duration::from_millis(25);

const BYTES_WRITTEN: HeaderName = HeaderName::from_static("x-pinch-bytes-written");
const BYTES_READ: HeaderName = HeaderName::from_static("x-pinch-bytes-read");
const DIGEST_XXH128: HeaderName = HeaderName::from_static("x-pinch-xxh128");
const DIGEST_BLAKE3: HeaderName = HeaderName::from_static("x-pinch-blake3");

type FrameResult = std::result::Result<Frame<Bytes>, io::Error>;

/// PUT `/io/{handle}`
pub async fn io_put(
    State(service): State<Service>,
    UrlPath(handle): UrlPath<String>,
    Query(raw): Query<RawQuery>,
    request: Request,
) -> Result<Response<Body>> {
    let flags = parse_io_flags(&raw);
    let slot = service
        .writers()
        .acquire(&service.config().input_dir, &handle)
        .ok_or_else(|| PinchError::NotFound(format!("no open session for handle {handle}")))?;
    let body = request.into_body();

    if flags.writeonly {
        let written = copy_body(body, &slot).await?;
        debug!(%handle, written, "write-only body copied");
        if !flags.partial {
            service.writers().maybe_release(&handle);
        }
        return Response::builder()
            .status(StatusCode::NO_CONTENT)
            .header(BYTES_WRITTEN, HeaderValue::from(written))
            .body(Body::empty())
            .map_err(|err| PinchError::Internal(err.to_string()));
    }

    // Combined mode: feed the input fifo from a sibling task so the transform
    // has bytes to chew on while the read half attaches to its output.
    let (written_tx, written_rx) = oneshot::channel();
    {
        let service = service.clone();
        let handle = handle.clone();
        tokio::spawn(async move {
            match copy_body(body, &slot).await {
                Ok(written) => {
                    debug!(%handle, written, "combined-mode body copied");
                    if !flags.partial {
                        service.writers().maybe_release(&handle);
                    }
                    let _ = written_tx.send(Some(written));
                }
                Err(err) => {
                    // The response may already be committed; the session's
                    // hard timeout bounds the stalled transform.
                    warn!(%handle, %err, "combined-mode body copy failed");
                    let _ = written_tx.send(None);
                }
            }
        });
    }

    let reader = attach_output(&service, &handle, AttachMode::AwaitWriter).await?;
    stream_response(service, handle, reader, Some(written_rx))
}

/// GET `/io/{handle}`
pub async fn io_get(
    State(service): State<Service>,
    UrlPath(handle): UrlPath<String>,
) -> Result<Response<Body>> {
    let reader = attach_output(&service, &handle, AttachMode::Immediate).await?;
    stream_response(service, handle, reader, None)
}

/// Copy one request body into the writer, serialized with any concurrent
/// writers for the same handle.
async fn copy_body(body: Body, slot: &WriterSlot) -> Result<u64> {
    use tokio::io::AsyncWriteExt;

    let mut stream = body.into_data_stream();
    let mut file = slot.lock().await;
    let mut written = 0u64;
    while let Some(chunk) = stream.next().await {
        let chunk =
            chunk.map_err(|err| PinchError::Internal(format!("could not read body: {err}")))?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    Ok(written)
}

enum AttachMode {
    /// Pure read: an idle fifo (no writer, no data) is 404; callers retry.
    Immediate,
    /// Combined read-write: the transform will open its output once input
    /// flows, so poll for it; give up when the fifo entry disappears.
    AwaitWriter,
}

struct OutputReader {
    file: tokio::fs::File,
    lead: Option<Bytes>,
}

/// Open the handle's output fifo without ever blocking in `open(2)`.
///
/// The descriptor starts non-blocking for the probe and is switched to
/// blocking before the streaming loop takes over.
async fn attach_output(service: &Service, handle: &str, mode: AttachMode) -> Result<OutputReader> {
    let path = service.config().output_dir.join(handle);
    let mut file = OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(&path)
        .map_err(|err| match err.kind() {
            io::ErrorKind::NotFound => {
                PinchError::NotFound(format!("no open session for handle {handle}"))
            }
            _ => PinchError::Io(err),
        })?;

    let mut probe = [0u8; 4096];
    let lead = loop {
        match io::Read::read(&mut file, &mut probe) {
            Ok(0) => match mode {
                AttachMode::Immediate => {
                    return Err(PinchError::NotFound(format!(
                        "no bytes available yet for handle {handle}"
                    )))
                }
                AttachMode::AwaitWriter => {
                    if !path.exists() {
                        // Transform exited; whatever is buffered drains below.
                        break None;
                    }
                    tokio::time::sleep(ATTACH_POLL).await;
                }
            },
            Ok(n) => break Some(Bytes::copy_from_slice(&probe[..n])),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => break None,
            Err(err) => return Err(PinchError::Io(err)),
        }
    };

    pinch_fifo::clear_nonblocking(&file)?;
    Ok(OutputReader {
        file: tokio::fs::File::from_std(file),
        lead,
    })
}

/// Build the chunked 200 response and spawn the task that feeds it.
fn stream_response(
    service: Service,
    handle: String,
    reader: OutputReader,
    written_rx: Option<oneshot::Receiver<Option<u64>>>,
) -> Result<Response<Body>> {
    let trailer_names = if written_rx.is_some() {
        "X-Pinch-Bytes-Read, X-Pinch-Bytes-Written, X-Pinch-XXH128, X-Pinch-BLAKE3"
    } else {
        "X-Pinch-Bytes-Read, X-Pinch-XXH128, X-Pinch-BLAKE3"
    };

    let (frame_tx, frame_rx) = mpsc::channel::<FrameResult>(8);
    tokio::spawn(drain_output(service, handle, reader, frame_tx, written_rx));

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONNECTION, "Keep-Alive")
        .header(header::TRANSFER_ENCODING, "chunked")
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header("X-Content-Type-Options", "nosniff")
        .header(header::TRAILER, trailer_names)
        .body(Body::new(StreamBody::new(ReceiverStream::new(frame_rx))))
        .map_err(|err| PinchError::Internal(err.to_string()))
}

async fn drain_output(
    service: Service,
    handle: String,
    mut reader: OutputReader,
    frame_tx: mpsc::Sender<FrameResult>,
    written_rx: Option<oneshot::Receiver<Option<u64>>>,
) {
    let mut read_total = 0u64;

    if let Some(lead) = reader.lead.take() {
        read_total += lead.len() as u64;
        if frame_tx.send(Ok(Frame::data(lead))).await.is_err() {
            return;
        }
    }

    let mut buf = vec![0u8; service.config().pipe_buffer];
    loop {
        match reader.file.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                read_total += n as u64;
                let chunk = Bytes::copy_from_slice(&buf[..n]);
                if frame_tx.send(Ok(Frame::data(chunk))).await.is_err() {
                    // Client went away; the transform dies by EPIPE and the
                    // session surfaces it through the result store.
                    debug!(%handle, "read side abandoned mid-stream");
                    return;
                }
            }
            Err(err) => {
                warn!(%handle, %err, "output fifo read failed");
                let _ = frame_tx.send(Err(err)).await;
                return;
            }
        }
    }
    debug!(%handle, read_total, "output fifo drained");

    let _ = frame_tx
        .send(Ok(Frame::trailers(
            collect_trailers(&service, &handle, read_total, written_rx).await,
        )))
        .await;
}

async fn collect_trailers(
    service: &Service,
    handle: &str,
    read_total: u64,
    written_rx: Option<oneshot::Receiver<Option<u64>>>,
) -> HeaderMap {
    let mut trailers = HeaderMap::new();
    trailers.insert(BYTES_READ, HeaderValue::from(read_total));

    if let Some(rx) = written_rx {
        if let Ok(Some(written)) = rx.await {
            trailers.insert(BYTES_WRITTEN, HeaderValue::from(written));
        }
    }

    if let Some(result) = service.results().wait(handle, DIGEST_WAIT).await {
        if result.success {
            if let Some(checksums) = result.checksums {
                if let Ok(value) = HeaderValue::from_str(&checksums.xxh128) {
                    trailers.insert(DIGEST_XXH128, value);
                }
                if let Ok(value) = HeaderValue::from_str(&checksums.blake3) {
                    trailers.insert(DIGEST_BLAKE3, value);
                }
            }
        }
    }
    trailers
}

/// A probe helper shared with tests: true when the path exists and is a fifo.
#[cfg(test)]
pub(crate) fn is_fifo(path: &std::path::Path) -> bool {
    use std::os::unix::fs::FileTypeExt;
    std::fs::metadata(path)
        .map(|meta| meta.file_type().is_fifo())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceConfig;
    use std::io::Write;

    struct Fixture {
        _in_dir: tempfile::TempDir,
        _out_dir: tempfile::TempDir,
        service: Service,
        pair: Option<pinch_fifo::FifoPair>,
    }

    fn fixture(handle: &str) -> Fixture {
        let in_dir = tempfile::tempdir().unwrap();
        let out_dir = tempfile::tempdir().unwrap();
        let config = ServiceConfig {
            input_dir: in_dir.path().to_path_buf(),
            output_dir: out_dir.path().to_path_buf(),
            pipe_buffer: 65536,
            ..Default::default()
        };
        let pair =
            pinch_fifo::make_fifo_pair(in_dir.path(), out_dir.path(), handle, 65536).unwrap();
        Fixture {
            _in_dir: in_dir,
            _out_dir: out_dir,
            service: Service::new(config),
            pair: Some(pair),
        }
    }

    #[tokio::test]
    async fn test_attach_immediate_idle_fifo_is_not_found() {
        let fx = fixture("idle");
        assert!(is_fifo(&fx.pair.as_ref().unwrap().out_path));

        let got = attach_output(&fx.service, "idle", AttachMode::Immediate).await;
        assert!(matches!(got, Err(PinchError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_attach_missing_fifo_is_not_found() {
        let fx = fixture("gone");
        assert!(matches!(
            attach_output(&fx.service, "missing", AttachMode::Immediate).await,
            Err(PinchError::NotFound(_))
        ));
        assert!(matches!(
            attach_output(&fx.service, "missing", AttachMode::AwaitWriter).await,
            Err(PinchError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_attach_sees_buffered_data() {
        let fx = fixture("full");
        let out_path = fx.pair.as_ref().unwrap().out_path.clone();

        // A producer writes and departs; the factory's held read side keeps
        // the bytes buffered.
        let mut producer = OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&out_path)
            .unwrap();
        producer.write_all(b"payload").unwrap();
        drop(producer);

        let mut reader = attach_output(&fx.service, "full", AttachMode::Immediate)
            .await
            .expect("attach");
        assert_eq!(reader.lead.take().unwrap().as_ref(), b"payload");
    }

    #[tokio::test]
    async fn test_await_writer_finishes_when_fifo_vanishes() {
        let fx = fixture("vanish");
        let pair = fx.pair.as_ref().unwrap();
        let (in_path, out_path) = (pair.in_path.clone(), pair.out_path.clone());

        let service = fx.service.clone();
        let attach = tokio::spawn(async move {
            attach_output(&service, "vanish", AttachMode::AwaitWriter).await
        });

        tokio::time::sleep(Duration::from_millis(60)).await;
        std::fs::remove_file(&out_path).unwrap();
        std::fs::remove_file(&in_path).unwrap();

        let reader = attach.await.unwrap().expect("attach resolves");
        assert!(reader.lead.is_none());
    }

    #[tokio::test]
    async fn test_trailers_without_result_carry_counts_only() {
        let fx = fixture("plain");
        let (tx, rx) = oneshot::channel();
        tx.send(Some(11u64)).unwrap();

        let trailers = collect_trailers(&fx.service, "plain", 42, Some(rx)).await;
        assert_eq!(trailers.get(&BYTES_READ).unwrap(), "42");
        assert_eq!(trailers.get(&BYTES_WRITTEN).unwrap(), "11");
        assert!(trailers.get(&DIGEST_XXH128).is_none());
    }

    #[tokio::test]
    async fn test_trailers_include_digests_on_success() {
        use chrono::Utc;
        use pinch_state::{Checksums, PipelineResult};

        let fx = fixture("digest");
        fx.service.results().finish(
            "digest",
            1,
            PipelineResult {
                start: Utc::now(),
                duration: Duration::from_millis(3),
                success: true,
                stderr: String::new(),
                checksums: Some(Checksums {
                    xxh128: "9f86d081884c7d65".into(),
                    blake3: "af1349b9f5f9a1a6".into(),
                }),
            },
        );

        let trailers = collect_trailers(&fx.service, "digest", 7, None).await;
        assert_eq!(trailers.get(&DIGEST_XXH128).unwrap(), "9f86d081884c7d65");
        assert_eq!(trailers.get(&DIGEST_BLAKE3).unwrap(), "af1349b9f5f9a1a6");
        assert!(trailers.get(&BYTES_WRITTEN).is_none());
    }
}
