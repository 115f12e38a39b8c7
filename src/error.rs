use thiserror::Error;

#[derive(Error, Debug)]
pub enum FtlError {
    #[error("device error: {0}")]
    Device(String),

    #[error("uncorrectable read at bank {bank}, block {blk}, page {page}")]
    Ecc { bank: u32, blk: u32, page: u32 },

    #[error("device did not become idle: bank {0}")]
    DeviceTimeout(u32),

    #[error("log area exhausted on bank {0}")]
    LogExhausted(u32),

    #[error("invariant violation: {0}")]
    Invariant(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("host misuse: {0}")]
    HostMisuse(String),

    #[error("recovery error: {0}")]
    Recovery(String),
}

impl FtlError {
    pub(crate) fn invariant(msg: impl Into<String>) -> FtlError {
        FtlError::Invariant(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, FtlError>;
