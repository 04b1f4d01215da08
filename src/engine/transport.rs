//! Connect/send/close seam between the fanout sender and the wire.
//!
//! The sender only ever opens one outbound stream per connection and writes
//! the raw transaction bytes into it, so the traits mirror exactly that.

use {
    async_trait::async_trait,
    quinn::{ConnectError, ConnectionError, WriteError},
    std::{fmt, net::SocketAddr},
    thiserror::Error,
};

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("connect error: {0}")]
    Connect(#[from] ConnectError),
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),
    #[error("write error: {0}")]
    Write(#[from] WriteError),
    #[error("stream already closed")]
    StreamClosed,
    #[error("timed out")]
    Timeout,
    #[error("{0}")]
    Custom(String),
}

/// Coarse failure class, used only to make dispatch logs readable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchErrorKind {
    /// The peer refused or tore down the connection or stream.
    Refused,
    /// TLS, ALPN or QUIC version negotiation failed.
    AuthMismatch,
    /// Local endpoint or stream state problem.
    Internal,
    Other,
}

impl DispatchErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Refused => "refused",
            Self::AuthMismatch => "auth_mismatch",
            Self::Internal => "internal",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for DispatchErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl DispatchError {
    pub fn kind(&self) -> DispatchErrorKind {
        match self {
            Self::Connect(err) => connect_error_kind(err),
            Self::Connection(err) => connection_error_kind(err),
            Self::Write(err) => match err {
                WriteError::Stopped(_) => DispatchErrorKind::Refused,
                WriteError::ConnectionLost(err) => connection_error_kind(err),
                WriteError::ZeroRttRejected => DispatchErrorKind::AuthMismatch,
                WriteError::ClosedStream => DispatchErrorKind::Internal,
                #[allow(unreachable_patterns)]
                _ => DispatchErrorKind::Other,
            },
            Self::StreamClosed => DispatchErrorKind::Internal,
            Self::Timeout | Self::Custom(_) => DispatchErrorKind::Other,
        }
    }
}

fn connect_error_kind(err: &ConnectError) -> DispatchErrorKind {
    match err {
        ConnectError::InvalidServerName(_) | ConnectError::UnsupportedVersion => {
            DispatchErrorKind::AuthMismatch
        }
        ConnectError::EndpointStopping
        | ConnectError::CidsExhausted
        | ConnectError::NoDefaultClientConfig
        | ConnectError::InvalidRemoteAddress(_) => DispatchErrorKind::Internal,
        #[allow(unreachable_patterns)]
        _ => DispatchErrorKind::Other,
    }
}

fn connection_error_kind(err: &ConnectionError) -> DispatchErrorKind {
    match err {
        ConnectionError::ConnectionClosed(_)
        | ConnectionError::ApplicationClosed(_)
        | ConnectionError::Reset => DispatchErrorKind::Refused,
        // Handshake failures (bad certificate, ALPN) surface as local transport errors.
        ConnectionError::VersionMismatch | ConnectionError::TransportError(_) => {
            DispatchErrorKind::AuthMismatch
        }
        ConnectionError::LocallyClosed | ConnectionError::CidsExhausted => {
            DispatchErrorKind::Internal
        }
        ConnectionError::TimedOut => DispatchErrorKind::Other,
        #[allow(unreachable_patterns)]
        _ => DispatchErrorKind::Other,
    }
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Connection: TransportConnection;

    async fn connect(&self, addr: SocketAddr) -> Result<Self::Connection, DispatchError>;
}

#[async_trait]
pub trait TransportConnection: Send + Sync + 'static {
    type Stream: OutboundStream;

    async fn open_outbound_stream(&self) -> Result<Self::Stream, DispatchError>;

    /// Close immediately; unsent stream data is discarded.
    fn close(&self);
}

#[async_trait]
pub trait OutboundStream: Send + 'static {
    async fn write_all(&mut self, buf: &[u8]) -> Result<(), DispatchError>;

    /// Signal that no more data follows.
    fn finish(&mut self) -> Result<(), DispatchError>;
}
