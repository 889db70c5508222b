//! Gateway config loader (strict parsing).

pub mod schema;

use std::fs;
use std::path::Path;

use gated_core::error::{GateError, Result};

pub use schema::{Config, Protocol};

pub fn load_from_file(path: impl AsRef<Path>) -> Result<Config> {
    let s = fs::read_to_string(path.as_ref())
        .map_err(|e| GateError::Internal(format!("read config failed: {e}")))?;
    load_from_str(&s)
}

pub fn load_from_str(s: &str) -> Result<Config> {
    let cfg: Config = serde_yaml::from_str(s)
        .map_err(|e| GateError::Protocol(format!("invalid yaml: {e}")))?;
    cfg.validate()?;
    Ok(cfg)
}
