//! Network error types

/// Failures that prevented a response from arriving
#[derive(Debug, Clone, thiserror::Error)]
pub enum NetworkError {
    #[error("Network error: {0}")]
    Transport(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

impl From<reqwest::Error> for NetworkError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_builder() {
            NetworkError::InvalidUrl(e.to_string())
        } else {
            NetworkError::Transport(e.to_string())
        }
    }
}
