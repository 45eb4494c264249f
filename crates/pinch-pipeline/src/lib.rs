//! pinch-pipeline: transform pipeline assembly and supervision
//!
//! The transform itself is external: `zstd` for adaptive compression, `age`
//! for public-key encryption, `xxh128sum`/`b3sum` as digest taps, glued with
//! `tee` and process substitution under a `timeout` hard limit. This crate
//! contracts the command line ([`command`]) and owns the session lifecycle
//! around the subprocess ([`supervisor`]).

pub mod command;
pub mod supervisor;

pub use command::{shell_pipeline, AdaptLevels, Cipher, Direction};
pub use supervisor::Launch;

use thiserror::Error;

/// Pipeline assembly errors
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The cipher cannot be used in this direction (e.g. decrypting while
    /// compressing)
    #[error("cipher is not valid when {0}")]
    CipherMismatch(Direction),
}

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;
