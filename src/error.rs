use std::time::Duration;

use thiserror::Error as ThisError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("invalid window {0:?}, must be greater than zero")]
    InvalidWindow(Duration),
    #[error("invalid timer thread name {0:?}, must not contain NUL bytes")]
    InvalidThreadName(String),
    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}
