//! Shell pipeline assembly.
//!
//! Four variants: compress/decompress, each plaintext or age-encrypted. The
//! digest taps always hash the *uncompressed* stream, so they sit before zstd
//! when compressing and after it when decompressing. Sidecar files land next
//! to the output fifo as `<out>.xxh128` / `<out>.blake3`.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::{PipelineError, Result};

/// Wire name of the compression algorithm.
pub const COMPRESSION_ALGORITHM: &str = "zstd:adapt";
/// File suffix convention for compressed streams.
pub const COMPRESSION_EXTENSION: &str = "zst";
/// Wire name of the encryption algorithm.
pub const ENCRYPTION_ALGORITHM: &str = "age:chacha20poly1305";
/// File suffix convention for encrypted streams.
pub const ENCRYPTION_EXTENSION: &str = "age";

/// Which way a session transforms bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Raw bytes in, compressed (and optionally encrypted) bytes out
    Compress,
    /// Compressed (and optionally encrypted) bytes in, raw bytes out
    Decompress,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Compress => write!(f, "compressing"),
            Direction::Decompress => write!(f, "decompressing"),
        }
    }
}

/// zstd adaptive level bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdaptLevels {
    /// Lower bound; 0 means "let zstd pick" and is omitted from the command
    pub min: u32,
    /// Upper bound
    pub max: u32,
}

impl Default for AdaptLevels {
    fn default() -> Self {
        Self { min: 0, max: 10 }
    }
}

/// Optional encryption stage.
///
/// Recipient strings and identity names are validated at the HTTP edge before
/// they reach this module; they are interpolated into a shell line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cipher {
    /// No encryption stage
    Plaintext,
    /// Encrypt to an age recipient public key (compress direction)
    AgeRecipient(String),
    /// Decrypt with an identity file (decompress direction)
    AgeIdentity(PathBuf),
}

fn zstd_adapt(levels: AdaptLevels) -> String {
    if levels.min == 0 {
        format!("zstd -v --adapt=max={} -", levels.max)
    } else {
        format!("zstd -v --adapt=min={},max={} -", levels.min, levels.max)
    }
}

fn digest_taps(out_path: &Path) -> String {
    format!(
        ">(xxh128sum - > {out}.xxh128) >(b3sum - > {out}.blake3)",
        out = out_path.display()
    )
}

/// Compose the shell pipeline for one session.
pub fn shell_pipeline(
    direction: Direction,
    in_path: &Path,
    out_path: &Path,
    levels: AdaptLevels,
    cipher: &Cipher,
) -> Result<String> {
    let taps = digest_taps(out_path);
    let (input, output) = (in_path.display(), out_path.display());

    let pipeline = match (direction, cipher) {
        (Direction::Compress, Cipher::Plaintext) => {
            format!("tee < {input} {taps} | {} -o {output}", zstd_adapt(levels))
        }
        (Direction::Compress, Cipher::AgeRecipient(recipient)) => format!(
            "tee < {input} {taps} | {} | age -r {recipient} -o {output}",
            zstd_adapt(levels)
        ),
        (Direction::Decompress, Cipher::Plaintext) => {
            format!("zstd -v -d {input} -c | tee {taps} > {output}")
        }
        (Direction::Decompress, Cipher::AgeIdentity(identity)) => format!(
            "age -d -i {} {input} | zstd -v -d -c | tee {taps} > {output}",
            identity.display()
        ),
        (direction, _) => return Err(PipelineError::CipherMismatch(direction)),
    };
    Ok(pipeline)
}

/// `timeout(1)` arguments for a wall-clock limit: the TERM deadline and the
/// follow-up KILL deadline ten seconds later. Floors at one second.
pub fn kill_after(limit: std::time::Duration) -> (String, String) {
    let secs = limit.as_secs().max(1);
    (secs.to_string(), (secs + 10).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths() -> (PathBuf, PathBuf) {
        (PathBuf::from("/run/in/h"), PathBuf::from("/run/out/h"))
    }

    #[test]
    fn test_compress_plaintext() {
        let (inp, out) = paths();
        let cmd = shell_pipeline(
            Direction::Compress,
            &inp,
            &out,
            AdaptLevels { min: 0, max: 10 },
            &Cipher::Plaintext,
        )
        .unwrap();
        assert_eq!(
            cmd,
            "tee < /run/in/h >(xxh128sum - > /run/out/h.xxh128) >(b3sum - > /run/out/h.blake3) \
             | zstd -v --adapt=max=10 - -o /run/out/h"
        );
    }

    #[test]
    fn test_min_level_included_when_nonzero() {
        let (inp, out) = paths();
        let cmd = shell_pipeline(
            Direction::Compress,
            &inp,
            &out,
            AdaptLevels { min: 3, max: 15 },
            &Cipher::Plaintext,
        )
        .unwrap();
        assert!(cmd.contains("--adapt=min=3,max=15"));
    }

    #[test]
    fn test_compress_encrypted_appends_age_stage() {
        let (inp, out) = paths();
        let cmd = shell_pipeline(
            Direction::Compress,
            &inp,
            &out,
            AdaptLevels::default(),
            &Cipher::AgeRecipient("age1qqqq".into()),
        )
        .unwrap();
        assert!(cmd.ends_with("| zstd -v --adapt=max=10 - | age -r age1qqqq -o /run/out/h"));
        assert!(!cmd.contains("zstd -v --adapt=max=10 - -o"));
    }

    #[test]
    fn test_decompress_plaintext_taps_after_zstd() {
        let (inp, out) = paths();
        let cmd = shell_pipeline(
            Direction::Decompress,
            &inp,
            &out,
            AdaptLevels::default(),
            &Cipher::Plaintext,
        )
        .unwrap();
        assert_eq!(
            cmd,
            "zstd -v -d /run/in/h -c | tee >(xxh128sum - > /run/out/h.xxh128) \
             >(b3sum - > /run/out/h.blake3) > /run/out/h"
        );
    }

    #[test]
    fn test_decompress_encrypted_leads_with_age() {
        let (inp, out) = paths();
        let cmd = shell_pipeline(
            Direction::Decompress,
            &inp,
            &out,
            AdaptLevels::default(),
            &Cipher::AgeIdentity(PathBuf::from("/run/keys/backup")),
        )
        .unwrap();
        assert!(cmd.starts_with("age -d -i /run/keys/backup /run/in/h | zstd -v -d -c | tee"));
    }

    #[test]
    fn test_cipher_direction_mismatch() {
        let (inp, out) = paths();
        assert!(shell_pipeline(
            Direction::Compress,
            &inp,
            &out,
            AdaptLevels::default(),
            &Cipher::AgeIdentity(PathBuf::from("/k/i")),
        )
        .is_err());
        assert!(shell_pipeline(
            Direction::Decompress,
            &inp,
            &out,
            AdaptLevels::default(),
            &Cipher::AgeRecipient("age1qqqq".into()),
        )
        .is_err());
    }

    #[test]
    fn test_kill_after_floors_at_one_second() {
        let (term, kill) = kill_after(std::time::Duration::from_millis(10));
        assert_eq!(term, "1");
        assert_eq!(kill, "11");

        let (term, kill) = kill_after(std::time::Duration::from_secs(60));
        assert_eq!(term, "60");
        assert_eq!(kill, "70");
    }
}
