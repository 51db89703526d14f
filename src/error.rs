use thiserror::Error;

#[derive(Debug, Error)]
pub enum FlowtapError {
    #[error("capture error: {0}")]
    Capture(#[from] pcap::Error),

    #[error("no capture source configured (need an interface or a pcap file)")]
    NoSource,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, FlowtapError>;
