use thiserror::Error;

#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("Protocol version mismatch: expected {expected:#04x}, got {actual:#04x}")]
    ProtocolVersionMismatch { expected: u8, actual: u8 },

    #[error("Malformed address: {0}")]
    MalformedAddress(String),

    #[error("Command not supported: {0:#04x}")]
    CommandNotSupported(u8),

    #[error("Stream open failed: {0}")]
    StreamOpenFailed(String),

    #[error("Destination dial failed: {0}")]
    DestinationDialFailed(String),

    #[error("Relay I/O error: {0}")]
    RelayIo(String),

    #[error("Session terminated")]
    SessionTerminated,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TunnelError {
    pub fn malformed(msg: impl Into<String>) -> Self {
        TunnelError::MalformedAddress(msg.into())
    }

    /// Errors caused by what the local application sent, as opposed to
    /// failures of the tunnel or the destination.
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            TunnelError::ProtocolVersionMismatch { .. }
                | TunnelError::MalformedAddress(_)
                | TunnelError::CommandNotSupported(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, TunnelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_version_mismatch() {
        let err = TunnelError::ProtocolVersionMismatch {
            expected: 0x05,
            actual: 0x04,
        };
        assert_eq!(
            err.to_string(),
            "Protocol version mismatch: expected 0x05, got 0x04"
        );
    }

    #[test]
    fn test_error_display_command_not_supported() {
        let err = TunnelError::CommandNotSupported(0x02);
        assert_eq!(err.to_string(), "Command not supported: 0x02");
    }

    #[test]
    fn test_error_display_malformed_address() {
        let err = TunnelError::malformed("unknown address type 0x09");
        assert_eq!(err.to_string(), "Malformed address: unknown address type 0x09");
    }

    #[test]
    fn test_error_display_session_terminated() {
        assert_eq!(TunnelError::SessionTerminated.to_string(), "Session terminated");
    }

    #[test]
    fn test_input_errors() {
        assert!(TunnelError::CommandNotSupported(0x03).is_input_error());
        assert!(TunnelError::malformed("x").is_input_error());
        assert!(!TunnelError::SessionTerminated.is_input_error());
        assert!(!TunnelError::StreamOpenFailed("closed".into()).is_input_error());
    }

    #[test]
    fn test_from_io_error() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        let err: TunnelError = io.into();
        assert!(matches!(err, TunnelError::Io(_)));
    }
}
