//! Controller error types.

use std::time::Duration;

use thiserror::Error;

use cloudscale_provider::ProviderError;

/// Errors raised by individual controller steps. None of them stop the
/// control loop; they are logged and the next iteration proceeds.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("operation {name} failed: {message}")]
    OperationFailed { name: String, message: String },

    #[error("operation {name} did not complete within {waited:?}")]
    OperationTimeout { name: String, waited: Duration },

    #[error("remote script exited with {code:?}: {stderr}")]
    RemoteScriptFailed { code: Option<i32>, stderr: String },

    #[error("load sampling failed: {0}")]
    Sampling(String),

    #[error("backend file error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ControllerResult<T> = Result<T, ControllerError>;
