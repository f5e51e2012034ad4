use thiserror::Error;

#[derive(Error, Debug)]
pub enum FansError {
    #[error("output port {port} for '{owner}' is not available")]
    PortUnavailable { port: u8, owner: String },

    #[error("not enough digital outputs: {required} needed, {available} available")]
    NotEnoughOutputs { required: usize, available: u8 },

    #[error("no room in non-volatile storage for {0} bytes")]
    NvsAlloc(usize),

    #[error("non-volatile storage checksum mismatch at address {0}")]
    NvsChecksum(usize),

    #[error("non-volatile storage access out of range: {address}+{len}")]
    NvsRange { address: usize, len: usize },

    #[error("invalid settings blob: {0}")]
    InvalidBlob(String),

    #[error("invalid board profile: {0}")]
    InvalidProfile(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
