use reqwest::StatusCode;
use shared::{domain::UserId, error::ApiError};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ClientError>;

/// Failure taxonomy surfaced to the embedding UI. Nothing here is fatal;
/// every variant degrades to a stale-but-consistent local view.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("network request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("server rejected request with status {status}: {message}")]
    Api { status: StatusCode, message: String },
    #[error("peer {0} is not in the friends list")]
    PeerNotFound(UserId),
    #[error("no conversation is selected")]
    NoSelection,
    #[error("activity store failure: {0}")]
    Store(#[source] anyhow::Error),
}

pub(crate) async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = match response.json::<ApiError>().await {
        Ok(body) => body.to_string(),
        Err(_) => status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string(),
    };
    Err(ClientError::Api { status, message })
}
