use thiserror::Error;

#[derive(Error, Debug)]
pub enum VecError {
    #[error("vecstore: dimension mismatch: got {got}, want {want}")]
    DimensionMismatch { got: usize, want: usize },

    #[error("vecstore: zero-length vector for {0:?}")]
    ZeroVector(String),

    #[error("vecstore: io: {0}")]
    Io(#[from] std::io::Error),

    #[error("vecstore: invalid format: {0}")]
    InvalidFormat(String),

    #[error("vecstore: checksum mismatch")]
    Checksum,
}
