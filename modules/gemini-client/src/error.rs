use thiserror::Error;

pub type Result<T> = std::result::Result<T, GeminiError>;

#[derive(Error, Debug)]
pub enum GeminiError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Gemini API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Gemini response contained no embedding")]
    MissingEmbedding,

    #[error("Embedding dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Gemini response contained no candidates")]
    EmptyResponse,

    #[error("Failed to parse Gemini JSON output: {0}")]
    BadJson(#[from] serde_json::Error),
}

impl GeminiError {
    /// Rate-limit and overload responses get special backoff treatment upstream.
    pub fn is_rate_limit(&self) -> bool {
        match self {
            Self::Api { status, message } => {
                *status == 429 || message.to_ascii_lowercase().contains("overloaded")
            }
            _ => false,
        }
    }
}
