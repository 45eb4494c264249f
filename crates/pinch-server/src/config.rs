//! Service configuration.

use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

/// Configuration validation errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A field holds an unusable value
    #[error("invalid value for {field}: {message}")]
    InvalidValue {
        /// Field name
        field: &'static str,
        /// What is wrong with it
        message: String,
    },
}

/// Service configuration, normally assembled from CLI flags.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Address the HTTP listener binds
    pub listen: SocketAddr,
    /// Directory for input fifos
    pub input_dir: PathBuf,
    /// Directory for output fifos and digest sidecars
    pub output_dir: PathBuf,
    /// Directory holding age identity files
    pub keys_dir: PathBuf,
    /// Handle entropy in bytes (doubled on the wire as hex)
    pub token_length: usize,
    /// Kernel pipe buffer target and fifo copy buffer size
    pub pipe_buffer: usize,
    /// Base URL advertised in mint responses
    pub public_url: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        let listen: SocketAddr = ([0, 0, 0, 0], 8080).into();
        Self {
            listen,
            input_dir: PathBuf::from("/run/pinch/in"),
            output_dir: PathBuf::from("/run/pinch/out"),
            keys_dir: PathBuf::from("/run/pinch/keys"),
            token_length: 8,
            pipe_buffer: pinch_fifo::DEFAULT_PIPE_BUF,
            public_url: format!("http://{listen}"),
        }
    }
}

impl ServiceConfig {
    /// The I/O attachment URL advertised for a handle.
    pub fn io_url(&self, handle: &str) -> String {
        format!("{}/io/{handle}", self.public_url.trim_end_matches('/'))
    }

    /// Check field sanity before serving.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.token_length == 0 || self.token_length > 32 {
            return Err(ConfigError::InvalidValue {
                field: "token_length",
                message: format!("{} is not within 1..=32 bytes", self.token_length),
            });
        }
        if self.pipe_buffer < 4096 {
            return Err(ConfigError::InvalidValue {
                field: "pipe_buffer",
                message: format!("{} is below the 4 KiB page floor", self.pipe_buffer),
            });
        }
        if self.input_dir == self.output_dir {
            return Err(ConfigError::InvalidValue {
                field: "output_dir",
                message: "input and output fifo directories must differ".into(),
            });
        }
        Ok(())
    }
}
