use thiserror::Error;

use weftwire::WireError;

/// All errors produced by the weftnet endpoint layer.
#[derive(Debug, Error)]
pub enum NetError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("no usable network interface: local address has no default route")]
    NoRoute,

    #[error("already connected")]
    AlreadyConnected,

    #[error("connection attempt in progress")]
    ConnectPending,

    #[error("connection attempt timed out")]
    ConnectTimeout,

    #[error("connection refused by server")]
    ConnectionRefused,

    #[error("not connected")]
    NotConnected,

    #[error("no server endpoint remembered")]
    NoKnownServer,

    #[error("session is shut down")]
    Shutdown,
}

pub type Result<T> = std::result::Result<T, NetError>;
