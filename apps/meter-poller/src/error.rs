use thiserror::Error;

/// Failure reported by the metering API client.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("meter API returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("invalid meter API response: {0}")]
    InvalidResponse(String),
    #[error("invalid request URL: {0}")]
    Url(#[from] url::ParseError),
}

/// A restored state value that is not a usable number.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("restored value {raw:?} is not a finite number")]
pub struct RestoreParseError {
    pub raw: String,
}

#[derive(Error, Debug)]
pub enum BackfillError {
    #[error("cannot compute backfill window: {0}")]
    Window(String),
    #[error("historical fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}
