//! pinch-fifo: named-pipe provisioning
//!
//! Creates the per-handle FIFO pair a transform pipeline is wired through:
//!
//! - `mkfifo` with mode 0666 (re-chmodded, since the umask usually masks bits)
//! - read side held open non-blocking so writers can attach without a
//!   rendezvous, and so the kernel pipe buffer survives between attachments
//! - `F_SETPIPE_SZ` to the configured buffer size on Linux
//! - startup sweep of leftover entries after a crash

use std::fs::{File, OpenOptions, Permissions};
use std::io;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, warn};

/// Default kernel pipe buffer target (1 MiB).
pub const DEFAULT_PIPE_BUF: usize = 1 << 20;

/// FIFO provisioning errors
#[derive(Debug, Error)]
pub enum FifoError {
    /// mkfifo failed
    #[error("could not create fifo {path}: {source}")]
    Create {
        /// Filesystem path of the fifo
        path: PathBuf,
        /// Underlying errno
        source: nix::Error,
    },

    /// Opening the held read side failed
    #[error("could not open fifo {path}: {source}")]
    Open {
        /// Filesystem path of the fifo
        path: PathBuf,
        /// Underlying I/O error
        source: io::Error,
    },

    /// Directory sweep failed
    #[error("could not sweep {path}: {source}")]
    Sweep {
        /// Directory being swept
        path: PathBuf,
        /// Underlying I/O error
        source: io::Error,
    },
}

/// Result type for fifo operations
pub type Result<T> = std::result::Result<T, FifoError>;

/// A provisioned input/output FIFO pair for one handle.
///
/// The pair owns a non-blocking read-side descriptor on each fifo. Those
/// descriptors keep the resized kernel buffer alive and let writers open the
/// input side without blocking. Dropping the pair closes both descriptors;
/// [`FifoPair::close`] additionally removes the filesystem entries.
#[derive(Debug)]
pub struct FifoPair {
    /// Session handle the pair belongs to
    pub handle: String,
    /// Input fifo path (producers write here)
    pub in_path: PathBuf,
    /// Output fifo path (consumers read here)
    pub out_path: PathBuf,
    /// Kernel pipe buffer size requested for both fifos
    pub buf_size: usize,
    input: File,
    output: File,
}

impl FifoPair {
    /// Remove both filesystem entries and drop the held descriptors.
    pub fn close(self) {
        debug!(handle = %self.handle, "closing fifo pair");
        for path in [&self.in_path, &self.out_path] {
            if let Err(err) = std::fs::remove_file(path) {
                warn!(path = %path.display(), %err, "could not remove fifo");
            }
        }
    }
}

fn make_fifo(path: &Path) -> Result<()> {
    nix::unistd::mkfifo(path, nix::sys::stat::Mode::from_bits_truncate(0o666)).map_err(
        |source| FifoError::Create {
            path: path.to_path_buf(),
            source,
        },
    )?;
    // Named pipes come out with the umask applied; force the mode we asked for.
    if let Err(err) = std::fs::set_permissions(path, Permissions::from_mode(0o666)) {
        warn!(path = %path.display(), %err, "could not chmod fifo");
    }
    Ok(())
}

fn open_read_nonblocking(path: &Path) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)
        .map_err(|source| FifoError::Open {
            path: path.to_path_buf(),
            source,
        })
}

/// Pipe buffers only stay above the 64 KiB default while some descriptor on
/// the pipe remains open; the caller keeps the returned pair alive for the
/// lifetime of the session.
#[cfg(target_os = "linux")]
fn try_set_pipe_size(path: &Path, file: &File, buf_size: usize) {
    let actual =
        unsafe { libc::fcntl(file.as_raw_fd(), libc::F_SETPIPE_SZ, buf_size as libc::c_int) };
    if actual < 0 {
        let err = io::Error::last_os_error();
        warn!(path = %path.display(), %err, "could not resize pipe buffer");
    } else {
        debug!(path = %path.display(), requested = buf_size, actual, "resized pipe buffer");
    }
}

#[cfg(not(target_os = "linux"))]
fn try_set_pipe_size(_path: &Path, _file: &File, _buf_size: usize) {}

/// Switch a descriptor opened `O_NONBLOCK` back to blocking mode.
///
/// Fifo opens go through `O_NONBLOCK` so no caller ever parks inside
/// `open(2)`; once attached, the streaming copies want ordinary blocking
/// semantics again.
pub fn clear_nonblocking(file: &File) -> io::Result<()> {
    let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_SETFL, 0) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn provision(path: &Path, buf_size: usize) -> Result<File> {
    make_fifo(path)?;
    let file = match open_read_nonblocking(path) {
        Ok(file) => file,
        Err(err) => {
            let _ = std::fs::remove_file(path);
            return Err(err);
        }
    };
    try_set_pipe_size(path, &file, buf_size);
    Ok(file)
}

/// Create the input and output fifos for `handle` and hold their read sides.
///
/// On any failure the partially created state is rolled back and an error is
/// returned; the caller surfaces it as a per-request failure.
pub fn make_fifo_pair(
    in_dir: &Path,
    out_dir: &Path,
    handle: &str,
    buf_size: usize,
) -> Result<FifoPair> {
    let in_path = in_dir.join(handle);
    let out_path = out_dir.join(handle);

    let input = provision(&in_path, buf_size)?;
    let output = match provision(&out_path, buf_size) {
        Ok(file) => file,
        Err(err) => {
            let _ = std::fs::remove_file(&in_path);
            return Err(err);
        }
    };

    debug!(handle, in_path = %in_path.display(), out_path = %out_path.display(), "provisioned fifo pair");
    Ok(FifoPair {
        handle: handle.to_string(),
        in_path,
        out_path,
        buf_size,
        input,
        output,
    })
}

/// Remove every entry of a fifo directory. Run at startup so sessions from a
/// crashed process cannot collide with fresh handles.
pub fn sweep_dir(dir: &Path) -> Result<usize> {
    let entries = std::fs::read_dir(dir).map_err(|source| FifoError::Sweep {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        match std::fs::remove_file(&path) {
            Ok(()) => {
                info!(path = %path.display(), "swept leftover entry");
                removed += 1;
            }
            Err(err) => warn!(path = %path.display(), %err, "could not sweep entry"),
        }
    }
    Ok(removed)
}
