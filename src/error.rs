//! Error types shared across the server.

use thiserror::Error;

/// Errors raised while configuring or running an MLLP server.
///
/// Configuration problems surface synchronously from the constructors;
/// anything that happens after a listener is up is reported through
/// [`InboundEvent`](crate::events::InboundEvent) notifications instead.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] tokio_rustls::rustls::Error),

    #[error("server error: {0}")]
    Server(String),

    #[error("listener error: {0}")]
    Listener(String),

    #[error("HL7 error: {0}")]
    Hl7(String),
}

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
