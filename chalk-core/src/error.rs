use thiserror::Error;

/// Errors at the update-blob boundary. Everything else in the document model
/// normalises bad input instead of failing.
#[derive(Debug, Clone, Error)]
pub enum DocError {
    #[error("failed to decode update payload: {0}")]
    Decode(String),
    #[error("failed to apply update: {0}")]
    Apply(String),
}

impl From<yrs::encoding::read::Error> for DocError {
    fn from(e: yrs::encoding::read::Error) -> Self {
        DocError::Decode(e.to_string())
    }
}
