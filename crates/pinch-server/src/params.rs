//! Query-parameter parsing and validation.
//!
//! Everything user-supplied is checked here, before any fifo or subprocess
//! exists. Age recipient keys and identity names end up interpolated into a
//! shell command line, so they are held to a strict character set.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use pinch_pipeline::{AdaptLevels, Cipher, Direction};

use crate::error::{PinchError, Result};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
const MIN_TIMEOUT: Duration = Duration::from_secs(1);
const DEFAULT_WAIT_FOR: Duration = Duration::from_secs(1);

/// Validated mint parameters for `/pinch` and `/unpinch`.
#[derive(Debug, Clone, PartialEq)]
pub struct MintParams {
    /// zstd adaptive bounds
    pub levels: AdaptLevels,
    /// Hard wall-clock limit and TTL
    pub timeout: Duration,
    /// How many independent handles to mint
    pub num_handles: usize,
    /// Optional encryption stage
    pub cipher: Cipher,
}

/// PUT `/io/{handle}` behavior flags; both are presence-based.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoFlags {
    /// Suppress the interleaved read half
    pub writeonly: bool,
    /// Leave the writer open after this request
    pub partial: bool,
}

fn parse_int(raw: &HashMap<String, String>, key: &str, default: u32) -> Result<u32> {
    match raw.get(key) {
        None => Ok(default),
        Some(value) => value
            .parse()
            .map_err(|_| PinchError::BadRequest(format!("invalid {key}: {value:?}"))),
    }
}

fn parse_duration(raw: &HashMap<String, String>, key: &str, default: Duration) -> Result<Duration> {
    match raw.get(key) {
        None => Ok(default),
        Some(value) => humantime::parse_duration(value)
            .map_err(|_| PinchError::BadRequest(format!("invalid {key}: {value:?}"))),
    }
}

/// An age recipient is bech32: `age1` followed by lowercase alphanumerics.
fn validate_recipient(key: &str) -> Result<()> {
    let rest = key
        .strip_prefix("age1")
        .ok_or_else(|| PinchError::BadRequest(format!("invalid age-public-key: {key:?}")))?;
    if rest.is_empty() || !rest.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit()) {
        return Err(PinchError::BadRequest(format!(
            "invalid age-public-key: {key:?}"
        )));
    }
    Ok(())
}

/// Identity names are bare file names under the keys directory.
fn validate_identity_name(name: &str) -> Result<()> {
    let bad = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\\')
        || name.bytes().any(|b| b.is_ascii_whitespace() || b == b';');
    if bad {
        return Err(PinchError::BadRequest(format!(
            "invalid age-key-path: {name:?}"
        )));
    }
    Ok(())
}

/// Parse and validate the mint query for the given direction.
pub fn parse_mint(
    direction: Direction,
    raw: &HashMap<String, String>,
    keys_dir: &Path,
) -> Result<MintParams> {
    let max = parse_int(raw, "max-level", 10)?;
    let min = parse_int(raw, "min-level", 0)?;
    if min > max {
        return Err(PinchError::BadRequest(format!(
            "min-level {min} exceeds max-level {max}"
        )));
    }

    let timeout = parse_duration(raw, "timeout", DEFAULT_TIMEOUT)?;
    if timeout < MIN_TIMEOUT {
        return Err(PinchError::BadRequest(format!(
            "timeout must be at least 1s, got {}",
            humantime::format_duration(timeout)
        )));
    }

    let num_handles = parse_int(raw, "num-handles", 1)? as usize;
    if num_handles == 0 {
        return Err(PinchError::BadRequest("num-handles must be positive".into()));
    }

    let cipher = match (direction, raw.get("age-public-key"), raw.get("age-key-path")) {
        (_, None, None) => Cipher::Plaintext,
        (Direction::Compress, Some(key), None) => {
            validate_recipient(key)?;
            Cipher::AgeRecipient(key.clone())
        }
        (Direction::Decompress, None, Some(name)) => {
            validate_identity_name(name)?;
            Cipher::AgeIdentity(keys_dir.join(name))
        }
        (Direction::Compress, _, Some(_)) => {
            return Err(PinchError::BadRequest(
                "age-key-path is only valid on /unpinch".into(),
            ))
        }
        (Direction::Decompress, Some(_), _) => {
            return Err(PinchError::BadRequest(
                "age-public-key is only valid on /pinch".into(),
            ))
        }
    };

    Ok(MintParams {
        levels: AdaptLevels { min, max },
        timeout,
        num_handles,
        cipher,
    })
}

/// Parse the PUT `/io/{handle}` flags; a bare `?partial` counts as set.
pub fn parse_io_flags(raw: &HashMap<String, String>) -> IoFlags {
    IoFlags {
        writeonly: raw.contains_key("writeonly"),
        partial: raw.contains_key("partial"),
    }
}

/// Parse the `/status/{handle}` wait bound.
pub fn parse_wait_for(raw: &HashMap<String, String>) -> Result<Duration> {
    parse_duration(raw, "wait-for", DEFAULT_WAIT_FOR)
}
