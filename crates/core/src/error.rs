#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid identifier: {0}")]
    InvalidId(#[from] anyhow::Error),
    #[error("chunk size must be a power of two no greater than the block size")]
    BadChunkSize,
}

pub type Result<T> = std::result::Result<T, Error>;
