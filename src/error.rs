use thiserror::Error;

use crate::agent::store::StoreError;

/// Fatal, app-level failures. Recoverable conditions (rate limits, budget
/// pauses, stream errors, tool failures) never reach this type; they become
/// transcript entries instead.
#[derive(Error, Debug)]
pub enum HelmsmanError {
    #[error("terminal error: {0}")]
    Terminal(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("failed to build worker runtime: {0}")]
    Runtime(#[from] std::io::Error),

    #[error("agent worker thread failed: {0}")]
    WorkerJoin(String),
}

pub type Result<T> = std::result::Result<T, HelmsmanError>;
