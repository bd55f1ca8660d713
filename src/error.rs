use thiserror::Error;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("The selector you are trying to scrape for is missing. Selector: {0}")]
    ParseMissingSelector(String),

    #[error("Page {page} responded with HTTP {status}.")]
    HttpStatus { page: u32, status: u16 },

    #[error("Io Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Tokio Join Error, couldn't await a task! {0}")]
    RuntimeJoin(#[from] tokio::task::JoinError),

    #[error("Reqwest Error: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("Invalid header value: {0}")]
    InvalidHeader(#[from] reqwest::header::InvalidHeaderValue),
    #[error("Url Error: {0}")]
    Url(#[from] url::ParseError),

    #[error("Json Error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Regex Error: {0}")]
    Regex(#[from] regex::Error),
}
