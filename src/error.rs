//! Error type for the signing proxy.

use hyper::StatusCode;

use crate::key_management::KeyError;
use crate::signer::SignerError;

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Signing key error: {0}")]
    Key(#[from] KeyError),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Upstream error: {0}")]
    Upstream(#[from] reqwest::Error),

    #[error("Signing error: {0}")]
    Signing(#[from] SignerError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] hyper::http::Error),
}

impl ProxyError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::Config(_)
            | Self::Key(_)
            | Self::Signing(_)
            | Self::Io(_)
            | Self::Http(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn into_status_code_and_body(self) -> (StatusCode, String) {
        let status = self.status_code();
        (status, self.to_string())
    }
}
