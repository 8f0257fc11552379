//! Run-level error type.
//!
//! Only the variants here end a run. Per-condition problems (a config write
//! or server start that fails for one value, too few samples) are recorded
//! in the experiment result instead, and client failures are per-sample.

use crate::config::SettingsError;
use crate::config_store::ConfigStoreError;
use crate::process::{BuildError, StartError};
use crate::report::RenderError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("invalid settings: {0}")]
    Settings(#[from] SettingsError),
    #[error("build failed: {0}")]
    Build(#[from] BuildError),
    #[error(transparent)]
    ConfigStore(#[from] ConfigStoreError),
    #[error("server start failed: {0}")]
    ServerStart(#[from] StartError),
    #[error("report rendering failed: {0}")]
    Render(#[from] RenderError),
    #[error("failed to write results to '{}': {source}", .path.display())]
    Results {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to install signal handler: {0}")]
    Signal(#[from] ctrlc::Error),
    #[error("interrupted")]
    Interrupted,
}
