#[derive(Debug, thiserror::Error)]
pub enum StubError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("a debug session is already active")]
    Busy,
}

pub type Result<T> = std::result::Result<T, StubError>;
