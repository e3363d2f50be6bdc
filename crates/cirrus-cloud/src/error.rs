//! Core error types for the compute server orchestrator.

use crate::guard::Op;
use crate::server::{Cloud, ServerId};
use crate::state::{Action, State};
use std::time::Duration;
use thiserror::Error;

/// Cloud orchestration errors.
///
/// Configuration errors are fatal and surfaced immediately; transient
/// provider failures only reach callers as [`CloudError::DeadlineExceeded`]
/// after a driver retry loop gives up; everything else from a provider is
/// propagated verbatim as [`CloudError::Api`] so an unknown failure is never
/// silently mapped to a stable state.
#[derive(Error, Debug)]
pub enum CloudError {
    #[error("no provider registered for cloud: {0}")]
    ProviderNotFound(Cloud),

    #[error("compute server not found: {0}")]
    ServerNotFound(ServerId),

    #[error("compute server {0} is deleted")]
    ServerDeleted(ServerId),

    #[error("configuration for cloud {expected} required, got {got}")]
    WrongCloud { expected: Cloud, got: Cloud },

    #[error("record is configured for {configured} but its data belongs to {data} -- stale data?")]
    StaleData { configured: Cloud, data: Cloud },

    #[error("action {action} is not allowed from state {state}")]
    ActionNotAllowed { action: Action, state: State },

    #[error("action {action} is not supported on {cloud}")]
    ActionNotSupported { action: Action, cloud: Cloud },

    #[error("a {op} is already in flight for server {id}")]
    OperationInFlight { id: ServerId, op: Op },

    #[error("quota denied: {0}")]
    QuotaDenied(String),

    #[error("cost is not defined for state {0}")]
    CostUndefined(State),

    #[error("{op} deadline exceeded after {elapsed:?}: {message}")]
    DeadlineExceeded {
        op: String,
        elapsed: Duration,
        message: String,
    },

    #[error("provider API error: {0}")]
    Api(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CloudError>;
