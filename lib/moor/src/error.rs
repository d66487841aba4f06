use std::io;
use std::net;

pub type NetResult<T> = Result<T, NetError>;

/// Two-level error split for the wire layer: `Wait` means the operation
/// should be retried on a later readiness tick, `Fatal` means the session is
/// beyond saving and must be marked disconnected.
#[derive(Debug, Eq, PartialEq)]
pub enum NetError {
    Wait,
    Fatal(ErrorType),
}

#[derive(Debug, Eq, PartialEq)]
pub enum ErrorType {
    /// A decrypted length field was smaller than the header itself.
    BadFrame,
    /// The transport failed mid-read (closed socket included).
    ShortRead,
    /// Encrypted traffic was queued before the welcome handshake installed
    /// the session ciphers.
    CipherMisuse,
    /// No variant is associated with the accepting listener.
    UnknownVariant,
    AddrParse,
    Io(io::ErrorKind),
}

impl From<io::Error> for NetError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::WouldBlock => NetError::Wait,
            io::ErrorKind::UnexpectedEof => NetError::Fatal(ErrorType::ShortRead),
            kind => NetError::Fatal(ErrorType::Io(kind)),
        }
    }
}

impl From<net::AddrParseError> for NetError {
    #[inline]
    fn from(_: net::AddrParseError) -> Self {
        NetError::Fatal(ErrorType::AddrParse)
    }
}

pub trait ErrorUtils {
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for NetResult<T> {
    fn has_failed(&self) -> bool {
        match self {
            Ok(_) => false,
            Err(NetError::Wait) => false,
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_would_block_folds_to_wait() {
        let err: NetError = io::Error::from(io::ErrorKind::WouldBlock).into();
        assert_eq!(err, NetError::Wait);
    }

    #[test]
    fn test_eof_is_short_read() {
        let err: NetError = io::Error::from(io::ErrorKind::UnexpectedEof).into();
        assert_eq!(err, NetError::Fatal(ErrorType::ShortRead));
    }

    #[test]
    fn test_has_failed() {
        assert!(!Ok::<(), NetError>(()).has_failed());
        assert!(!Err::<(), NetError>(NetError::Wait).has_failed());
        assert!(Err::<(), NetError>(NetError::Fatal(ErrorType::BadFrame)).has_failed());
    }
}
