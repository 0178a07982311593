use thiserror::Error;

pub type Result<T> = std::result::Result<T, ConnectorError>;

#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("connector timed out after {0} seconds")]
    Timeout(u64),

    #[error("connector call cancelled")]
    Cancelled,

    #[error("connector io error: {0}")]
    Io(String),

    #[error("connector http error: {0}")]
    Http(String),

    #[error("connector protocol error: {0}")]
    Protocol(String),
}

impl From<std::io::Error> for ConnectorError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<reqwest::Error> for ConnectorError {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(e.to_string())
    }
}
