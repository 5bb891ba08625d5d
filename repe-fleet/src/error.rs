//! Fleet error types.

use repe_client::ClientError;
use thiserror::Error;

/// Fleet errors.
#[derive(Debug, Error)]
pub enum FleetError {
    #[error("duplicate node name: {0}")]
    DuplicateNode(String),

    #[error("unknown node: {0}")]
    UnknownNode(String),

    #[error(transparent)]
    Client(#[from] ClientError),
}
