use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    /// Fatal configuration problems: missing API key, unreadable config file.
    /// Raised immediately, never retried.
    #[error("configuration error: {0}")]
    Config(String),

    /// Missing required columns, unreadable input file.
    #[error("input error: {0}")]
    Input(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}
