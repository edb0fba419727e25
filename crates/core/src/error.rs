use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("SOCKS5 protocol error: {0}")]
    Socks5(#[from] crate::socks5::Socks5Error),

    #[error("junk bytes after complete SOCKS5 message ({0} left over)")]
    TrailingJunk(usize),

    #[error("unsupported SOCKS5 command")]
    UnsupportedCommand,

    #[error("no acceptable authentication method")]
    NoAcceptableAuth,

    #[error("username/password authentication is not implemented")]
    AuthNotImplemented,

    #[error("invalid password or cipher state")]
    InvalidPassword,

    #[error("obfs decode failed")]
    ClientDecode,

    #[error("protocol post-decrypt failed")]
    ClientPostDecrypt,

    #[error("hostname lookup failed: {0}")]
    LookupFailed(String),

    #[error("upstream connect failed: {0}")]
    ConnectFailed(String),

    #[error("connection closed by peer")]
    Eof,

    #[error("idle timeout")]
    Timeout,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_trailing_junk() {
        let err = ProxyError::TrailingJunk(3);
        assert_eq!(
            err.to_string(),
            "junk bytes after complete SOCKS5 message (3 left over)"
        );
    }

    #[test]
    fn test_error_display_timeout() {
        assert_eq!(ProxyError::Timeout.to_string(), "idle timeout");
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err: ProxyError = io.into();
        assert!(matches!(err, ProxyError::Io(_)));
    }
}
