//! Hyperstack provider error types.

use cirrus_cloud::CloudError;
use cirrus_cloud::hyperstack::Region;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HyperstackError {
    /// An error payload from the provider API, propagated verbatim.
    #[error("hyperstack API error: {message}")]
    Api {
        status: Option<u16>,
        message: String,
    },

    #[error("http transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("hyperstack returned an empty instance list")]
    EmptyInstanceList,

    #[error("{op} deadline exceeded after {elapsed:?}: {last}")]
    DeadlineExceeded {
        op: &'static str,
        deadline: Duration,
        elapsed: Duration,
        last: String,
    },

    #[error("no price for flavor {flavor} in {region}")]
    MissingPrice { flavor: String, region: Region },

    #[error("HYPERSTACK_API_KEY is not set")]
    MissingApiKey,

    #[error(transparent)]
    Cloud(#[from] CloudError),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
}

impl HyperstackError {
    /// The provider reported the resource does not exist at all. This is
    /// authoritative information, not a failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, HyperstackError::Api { message, .. } if message.contains("not_found"))
    }

    /// VM creation rejected because the boot volume is still provisioning.
    /// The one error class worth retrying during creation.
    pub fn is_volume_missing(&self, volume_name: &str) -> bool {
        matches!(
            self,
            HyperstackError::Api { message, .. }
                if message.contains(&format!("Volume {volume_name} does not exist"))
        )
    }
}

impl From<HyperstackError> for CloudError {
    fn from(err: HyperstackError) -> Self {
        match err {
            HyperstackError::Cloud(err) => err,
            HyperstackError::DeadlineExceeded {
                op, elapsed, last, ..
            } => CloudError::DeadlineExceeded {
                op: op.to_string(),
                elapsed,
                message: last,
            },
            other => CloudError::Api(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, HyperstackError>;
