//! pinch-server: HTTP surface for the streaming compression service
//!
//! Routes:
//! - `GET /pinch`, `GET /unpinch` — mint transform sessions
//! - `PUT /io/{handle}` — stream a body into the session (optionally reading
//!   the transformed stream back on the same response)
//! - `GET /io/{handle}` — stream the transformed output
//! - `GET /status/{handle}` — poll or wait for the terminal result
//! - `GET /health` — liveness
//!
//! Handlers share state through a cloneable [`Service`] value; nothing in the
//! crate is a process global.

pub mod config;
pub mod error;
pub mod io;
pub mod params;
pub mod service;
pub mod session;
pub mod status;

pub use config::{ConfigError, ServiceConfig};
pub use error::{PinchError, Result};
pub use service::Service;
