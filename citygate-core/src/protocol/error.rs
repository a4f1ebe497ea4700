pub type ParseResult<T> = core::result::Result<T, ProtocolError>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("insufficient data: needed {needed} bytes, {available} available")]
    InsufficientData { needed: usize, available: usize },
    #[error("varint longer than {max} bytes")]
    VarintTooLong { max: usize },
    #[error("varint does not fit in 64 bits")]
    VarintOverflow,
    #[error("payload of {size} bytes exceeds limit of {max}")]
    PayloadTooLarge { size: u64, max: usize },
    #[error("malformed payload: {0}")]
    Malformed(String),
}

impl From<postcard::Error> for ProtocolError {
    fn from(err: postcard::Error) -> Self {
        ProtocolError::Malformed(err.to_string())
    }
}
