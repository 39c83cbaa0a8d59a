use std::fmt;
use std::io;

use harness_shm::RegionError;

/// Errors from the control channel.
#[derive(Debug)]
pub enum ChannelError {
    /// The endpoint could not be reached.
    Connect(io::Error),
    /// The peer closed the stream before any byte of a frame arrived.
    Disconnected,
    /// The peer closed the stream in the middle of a fixed-width frame.
    Framing { expected: usize, got: usize },
    /// Any other I/O failure, including a broken pipe on write.
    Io(io::Error),
    /// A short string frame was not valid UTF-8.
    InvalidUtf8,
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect(e) => write!(f, "failed to connect to driver: {}", e),
            Self::Disconnected => write!(f, "driver disconnected"),
            Self::Framing { expected, got } => write!(
                f,
                "stream ended mid-frame: expected {} bytes, got {}",
                expected, got
            ),
            Self::Io(e) => write!(f, "control channel I/O error: {}", e),
            Self::InvalidUtf8 => write!(f, "string frame is not valid UTF-8"),
        }
    }
}

impl std::error::Error for ChannelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Connect(e) | Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

/// Errors from method resolution and execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MethodError {
    /// No transform is registered under this name.
    Unsupported(String),
    /// The transform itself failed.
    Transform { method: &'static str, reason: String },
}

impl fmt::Display for MethodError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unsupported(name) => write!(f, "unsupported method: {:?}", name),
            Self::Transform { method, reason } => {
                write!(f, "method {} failed: {}", method, reason)
            }
        }
    }
}

impl std::error::Error for MethodError {}

/// A violation of the request/response contract by either side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolFault {
    /// The driver declared more input than the input region can hold.
    InputTooLarge { len: usize, capacity: usize },
    /// The transform produced more output than the output region can hold.
    OutputTooLarge { len: usize, capacity: usize },
    /// A fixed-width frame was cut short.
    TruncatedFrame { expected: usize, got: usize },
    /// A string frame could not be decoded.
    MalformedString,
}

impl fmt::Display for ProtocolFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InputTooLarge { len, capacity } => write!(
                f,
                "declared input length {} exceeds input region capacity {}",
                len, capacity
            ),
            Self::OutputTooLarge { len, capacity } => write!(
                f,
                "output length {} exceeds output region capacity {}",
                len, capacity
            ),
            Self::TruncatedFrame { expected, got } => {
                write!(f, "truncated frame: expected {} bytes, got {}", expected, got)
            }
            Self::MalformedString => write!(f, "malformed string frame"),
        }
    }
}

/// Fatal session errors. Every one of these ends the session.
///
/// A clean driver disconnect is not an error; see [`crate::EndReason`].
#[derive(Debug)]
pub enum ProcessorError {
    /// The channel could not be established or broke.
    Connection(ChannelError),
    /// Shared-memory creation or attachment failed.
    Attach(RegionError),
    /// The driver broke the protocol.
    Protocol(ProtocolFault),
    /// The negotiated method has no transform.
    UnsupportedMethod(String),
    /// The transform failed.
    Transform(MethodError),
    /// The configuration is unusable.
    Config(ConfigError),
}

impl fmt::Display for ProcessorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection(e) => write!(f, "connection error: {}", e),
            Self::Attach(e) => write!(f, "attach error: {}", e),
            Self::Protocol(e) => write!(f, "protocol error: {}", e),
            Self::UnsupportedMethod(name) => write!(f, "unsupported method: {:?}", name),
            Self::Transform(e) => write!(f, "transform error: {}", e),
            Self::Config(e) => write!(f, "configuration error: {}", e),
        }
    }
}

impl std::error::Error for ProcessorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Connection(e) => Some(e),
            Self::Attach(e) => Some(e),
            Self::Transform(e) => Some(e),
            Self::Config(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ChannelError> for ProcessorError {
    fn from(e: ChannelError) -> Self {
        match e {
            ChannelError::Framing { expected, got } => {
                ProcessorError::Protocol(ProtocolFault::TruncatedFrame { expected, got })
            }
            ChannelError::InvalidUtf8 => ProcessorError::Protocol(ProtocolFault::MalformedString),
            other => ProcessorError::Connection(other),
        }
    }
}

impl From<RegionError> for ProcessorError {
    fn from(e: RegionError) -> Self {
        ProcessorError::Attach(e)
    }
}

impl From<MethodError> for ProcessorError {
    fn from(e: MethodError) -> Self {
        match e {
            MethodError::Unsupported(name) => ProcessorError::UnsupportedMethod(name),
            other => ProcessorError::Transform(other),
        }
    }
}

impl From<ConfigError> for ProcessorError {
    fn from(e: ConfigError) -> Self {
        ProcessorError::Config(e)
    }
}

/// Rejected configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    ZeroCapacity,
    EmptyIdentity,
    IdentityTooLong { len: usize, max: usize },
    /// `create` only makes sense for segments located by key.
    CreateById(harness_shm::Role),
    /// Key 0 is `IPC_PRIVATE`; a segment under it can never be found by the peer.
    PrivateKey(harness_shm::Role),
    ZeroMethodFrame,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ZeroCapacity => write!(f, "region capacity must be non-zero"),
            Self::EmptyIdentity => write!(f, "identity must not be empty"),
            Self::IdentityTooLong { len, max } => {
                write!(f, "identity is {} bytes, driver accepts at most {}", len, max)
            }
            Self::CreateById(role) => write!(
                f,
                "{} region is received by id and cannot be created by the processor",
                role
            ),
            Self::PrivateKey(role) => write!(
                f,
                "{} key 0 is IPC_PRIVATE and cannot be shared with the driver",
                role
            ),
            Self::ZeroMethodFrame => write!(f, "method frame length must be non-zero"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_errors_map_to_taxonomy() {
        assert!(matches!(
            ProcessorError::from(ChannelError::Framing {
                expected: 4,
                got: 2
            }),
            ProcessorError::Protocol(ProtocolFault::TruncatedFrame {
                expected: 4,
                got: 2
            })
        ));
        assert!(matches!(
            ProcessorError::from(ChannelError::Disconnected),
            ProcessorError::Connection(ChannelError::Disconnected)
        ));
        assert!(matches!(
            ProcessorError::from(ChannelError::InvalidUtf8),
            ProcessorError::Protocol(ProtocolFault::MalformedString)
        ));
    }

    #[test]
    fn unsupported_method_is_its_own_variant() {
        let err = ProcessorError::from(MethodError::Unsupported("md5".into()));
        assert!(matches!(err, ProcessorError::UnsupportedMethod(ref n) if n == "md5"));
        assert_eq!(err.to_string(), "unsupported method: \"md5\"");
    }
}
