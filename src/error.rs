use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("connection setup failed: {0}")]
    ConnectionSetup(String),

    #[error("{operation} failed: {message}")]
    UpstreamQuery {
        operation: &'static str,
        message: String,
    },

    #[error("malformed amount {amount:?} for account {account}")]
    MalformedAmount { account: String, amount: String },

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl AppError {
    pub fn upstream(operation: &'static str, message: impl Into<String>) -> Self {
        AppError::UpstreamQuery {
            operation,
            message: message.into(),
        }
    }
}
