//! Handle session controller: the `/pinch` and `/unpinch` mints.
//!
//! A mint provisions everything a client needs before the response is sent:
//! the fifo pair exists on disk and the supervisor is launched, so the caller
//! may attach immediately.

use std::collections::BTreeMap;

use axum::extract::{Query, State};
use axum::Json;
use rand::RngCore;
use serde::Serialize;
use tracing::info;

use pinch_pipeline::command::{
    COMPRESSION_ALGORITHM, COMPRESSION_EXTENSION, ENCRYPTION_ALGORITHM, ENCRYPTION_EXTENSION,
};
use pinch_pipeline::{supervisor, Cipher, Direction, Launch};

use crate::error::{PinchError, Result};
use crate::params::{parse_mint, MintParams};
use crate::service::{RawQuery, Service};

/// Per-handle attachment endpoints.
#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct HandleInfo {
    /// HTTP I/O endpoint for remote producers/consumers
    pub io_http: String,
    /// Input fifo path for local producers
    pub in_pipe: String,
    /// Output fifo path for local consumers
    pub out_pipe: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
struct CompressionInfo {
    algorithm: &'static str,
    extension: &'static str,
    max_level: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    min_level: Option<u32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
struct EncryptionInfo {
    algorithm: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    extension: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    public_key: Option<String>,
}

/// Mint response body.
#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct MintResponse {
    handles: BTreeMap<String, HandleInfo>,
    compression: CompressionInfo,
    encryption: EncryptionInfo,
    time_to_live: String,
}

/// GET `/pinch`
pub async fn pinch(
    State(service): State<Service>,
    Query(raw): Query<RawQuery>,
) -> Result<Json<MintResponse>> {
    mint(service, Direction::Compress, raw).await
}

/// GET `/unpinch`
pub async fn unpinch(
    State(service): State<Service>,
    Query(raw): Query<RawQuery>,
) -> Result<Json<MintResponse>> {
    mint(service, Direction::Decompress, raw).await
}

async fn mint(service: Service, direction: Direction, raw: RawQuery) -> Result<Json<MintResponse>> {
    let params = parse_mint(direction, &raw, &service.config().keys_dir)?;
    let config = service.config();

    let mut handles = BTreeMap::new();
    for _ in 0..params.num_handles {
        let handle = mint_token(config.token_length);
        // The input stage must be attachable the moment the response lands.
        let pair = pinch_fifo::make_fifo_pair(
            &config.input_dir,
            &config.output_dir,
            &handle,
            config.pipe_buffer,
        )
        .map_err(|err| PinchError::Internal(format!("could not provision fifos: {err}")))?;

        let session = pinch_state::next_session();
        info!(%handle, session, %direction, "minted session");

        handles.insert(
            handle.clone(),
            HandleInfo {
                io_http: config.io_url(&handle),
                in_pipe: pair.in_path.display().to_string(),
                out_pipe: pair.out_path.display().to_string(),
            },
        );

        tokio::spawn(supervisor::run(Launch {
            handle,
            session,
            direction,
            levels: params.levels,
            cipher: params.cipher.clone(),
            timeout: params.timeout,
            pair,
            writers: service.writers().clone(),
            results: service.results().clone(),
        }));
    }

    Ok(Json(describe(&params, handles)))
}

fn describe(params: &MintParams, handles: BTreeMap<String, HandleInfo>) -> MintResponse {
    let encryption = match &params.cipher {
        Cipher::Plaintext => EncryptionInfo {
            algorithm: "plaintext",
            extension: None,
            public_key: None,
        },
        Cipher::AgeRecipient(key) => EncryptionInfo {
            algorithm: ENCRYPTION_ALGORITHM,
            extension: Some(ENCRYPTION_EXTENSION),
            public_key: Some(key.clone()),
        },
        Cipher::AgeIdentity(_) => EncryptionInfo {
            algorithm: ENCRYPTION_ALGORITHM,
            extension: Some(ENCRYPTION_EXTENSION),
            public_key: None,
        },
    };

    MintResponse {
        handles,
        compression: CompressionInfo {
            algorithm: COMPRESSION_ALGORITHM,
            extension: COMPRESSION_EXTENSION,
            max_level: params.levels.max,
            min_level: (params.levels.min != 0).then_some(params.levels.min),
        },
        encryption,
        time_to_live: humantime::format_duration(params.timeout).to_string(),
    }
}

fn mint_token(length: usize) -> String {
    let mut bytes = vec![0u8; length];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pinch_pipeline::AdaptLevels;
    use std::time::Duration;

    #[test]
    fn test_mint_token_length_and_charset() {
        let token = mint_token(8);
        assert_eq!(token.len(), 16);
        assert!(token.bytes().all(|b| b.is_ascii_hexdigit()));
        assert_ne!(mint_token(8), mint_token(8));
    }

    #[test]
    fn test_response_shape_plaintext_min_omitted() {
        let params = MintParams {
            levels: AdaptLevels { min: 0, max: 10 },
            timeout: Duration::from_secs(60),
            num_handles: 1,
            cipher: Cipher::Plaintext,
        };
        let mut handles = BTreeMap::new();
        handles.insert(
            "ab".to_string(),
            HandleInfo {
                io_http: "http://x/io/ab".into(),
                in_pipe: "/in/ab".into(),
                out_pipe: "/out/ab".into(),
            },
        );

        let json = serde_json::to_value(describe(&params, handles)).unwrap();
        assert_eq!(json["compression"]["algorithm"], "zstd:adapt");
        assert_eq!(json["compression"]["extension"], "zst");
        assert_eq!(json["compression"]["max-level"], 10);
        assert!(json["compression"].get("min-level").is_none());
        assert_eq!(json["encryption"]["algorithm"], "plaintext");
        assert!(json["encryption"].get("extension").is_none());
        assert_eq!(json["time-to-live"], "1m");
        assert_eq!(json["handles"]["ab"]["io-http"], "http://x/io/ab");
        assert_eq!(json["handles"]["ab"]["in-pipe"], "/in/ab");
        assert_eq!(json["handles"]["ab"]["out-pipe"], "/out/ab");
    }

    #[test]
    fn test_response_shape_encrypted() {
        let params = MintParams {
            levels: AdaptLevels { min: 2, max: 12 },
            timeout: Duration::from_secs(90),
            num_handles: 1,
            cipher: Cipher::AgeRecipient("age1qqqq".into()),
        };
        let json = serde_json::to_value(describe(&params, BTreeMap::new())).unwrap();
        assert_eq!(json["compression"]["min-level"], 2);
        assert_eq!(json["encryption"]["algorithm"], "age:chacha20poly1305");
        assert_eq!(json["encryption"]["extension"], "age");
        assert_eq!(json["encryption"]["public-key"], "age1qqqq");
        assert_eq!(json["time-to-live"], "1m 30s");
    }
}
