use thiserror::Error;

pub type Result<T> = std::result::Result<T, ThreadsError>;

#[derive(Error, Debug)]
pub enum ThreadsError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Scraper API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Scraper returned an unparseable payload: {0}")]
    BadPayload(#[from] serde_json::Error),
}

impl ThreadsError {
    pub fn is_rate_limit(&self) -> bool {
        match self {
            Self::Api { status, message } => {
                let low = message.to_ascii_lowercase();
                *status == 429 || low.contains("rate limit") || low.contains("too many requests")
            }
            _ => false,
        }
    }

    /// Soft blocks (login walls, 403 HTML) are recoverable for some callers.
    pub fn is_soft_block(&self) -> bool {
        matches!(self, Self::Api { status, .. } if *status == 403)
    }
}
