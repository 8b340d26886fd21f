use reqwest::StatusCode;

/// Errors surfaced by profiler operations
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The request never produced a usable response
    #[error("request failed: {0}")]
    Network(#[from] reqwest::Error),

    /// The server answered with an unexpected status
    #[error("server returned status {status}: {body}")]
    Response { status: StatusCode, body: String },

    /// The server answered 2xx but the body was not the expected shape
    #[error("invalid profiler data: {0}")]
    MalformedData(String),
}

pub type Result<T> = std::result::Result<T, Error>;
