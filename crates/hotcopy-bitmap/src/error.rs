use thiserror::Error;

pub type Result<T> = std::result::Result<T, BitmapError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BitmapError {
    #[error("invalid granularity {granularity} (expected a non-zero power of two)")]
    InvalidGranularity { granularity: u64 },

    #[error("bitmap size mismatch: {left} bytes vs {right} bytes")]
    SizeMismatch { left: u64, right: u64 },

    #[error("integer overflow while computing bitmap offsets")]
    OffsetOverflow,

    #[error("bitmap '{name}' is in use by another operation")]
    Busy { name: String },

    #[error("bitmap '{name}' is read-only")]
    ReadOnly { name: String },

    #[error("bitmap '{name}' has no successor")]
    NoSuccessor { name: String },

    #[error("corrupt bitmap: {0}")]
    Corrupt(&'static str),
}
