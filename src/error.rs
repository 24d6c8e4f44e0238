use thiserror::Error;

/// Everything that can go wrong in the handshake, the dispatcher, or a
/// single socket. Fatal variants (see module docs on [`crate::dispatcher`])
/// tear down the whole connection; the rest are confined to one `open()` or
/// one socket.
#[derive(Debug, Error)]
pub enum AdbError {
    #[error("transport failed: {0}")]
    TransportFailed(String),

    #[error("bad magic: command 0x{command:08x} xor magic 0x{magic:08x} != 0xffffffff")]
    BadMagic { command: u32, magic: u32 },

    #[error("bad checksum: expected 0x{expected:08x}, got 0x{actual:08x}")]
    BadChecksum { expected: u32, actual: u32 },

    #[error("payload too large: {len} bytes exceeds negotiated max {max}")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("authentication rejected by peer")]
    AuthRejected,

    #[error("no private keys available to satisfy device authentication")]
    NoKeys,

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("socket closed")]
    SocketClosed,

    #[error("operation timed out")]
    Timeout,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AdbError>;
