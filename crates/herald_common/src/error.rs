use thiserror::Error;

/// Errors produced by the query parser. The display strings are part of the
/// client-visible surface: they travel inside `ErrorResponse("42601", …)`
/// frames, so their exact wording is load-bearing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid input syntax for encoding UTF-8")]
    InputNotUtf8,

    #[error("unexpected EOF")]
    UnexpectedEof,

    #[error("query length exceeds maximum allowed size")]
    QueryTooLong,

    #[error("parse error at or near \"{0}\"")]
    AtOrNear(String),

    #[error("parse error: unexpected token \"{0}\"")]
    UnexpectedToken(&'static str),

    #[error("unexpected data after query string")]
    TrailingData,

    #[error("garbage after semicolon")]
    GarbageAfterSemicolon,

    #[error("unexpected integer")]
    UnexpectedInteger,

    #[error("unexpected escape character '{0}'")]
    UnexpectedEscape(char),

    #[error("parse error")]
    Generic,
}

/// Wire-level errors from the frontend codec.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("connection closed")]
    ConnectionClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("unrecognized frontend message type 0x{0:02x}")]
    UnknownMessageType(u8),
}

/// Errors returned by the notification dispatcher. `AlreadySubscribed` and
/// `NotSubscribed` are sentinels the session treats as success; anything
/// else is session-fatal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("channel is already active")]
    AlreadySubscribed,

    #[error("channel is not active")]
    NotSubscribed,

    #[error("notification dispatcher has shut down")]
    Closed,
}

/// Terminal session conditions. A session records the first one of these
/// it encounters and then stops processing client requests.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("graceful termination")]
    GracefulTermination,

    #[error("terminating connection because the client could not keep up")]
    ClientCouldNotKeepUp,

    #[error("terminating connection because the server connection was lost")]
    LostServerConnection,

    #[error("{0}")]
    Protocol(String),

    #[error(transparent)]
    Wire(#[from] ProtocolError),

    #[error("dispatcher failure: {0}")]
    Dispatch(#[from] DispatchError),
}

impl SessionError {
    /// SQLSTATE for the FATAL `ErrorResponse` sent during teardown.
    pub fn sqlstate(&self) -> &'static str {
        match self {
            SessionError::GracefulTermination => "00000",
            SessionError::ClientCouldNotKeepUp => "57A03",
            SessionError::LostServerConnection => "57A02",
            SessionError::Protocol(_) => "08P01",
            SessionError::Wire(ProtocolError::Io(_)) => "08006",
            SessionError::Wire(ProtocolError::ConnectionClosed) => "08006",
            SessionError::Wire(_) => "08P01",
            SessionError::Dispatch(_) => "XX000",
        }
    }

    /// Whether teardown should attempt to deliver a FATAL frame before
    /// closing the socket. I/O-level failures get no frame (the socket is
    /// already unusable) and graceful termination needs none.
    pub fn wants_fatal_frame(&self) -> bool {
        match self {
            SessionError::GracefulTermination => false,
            SessionError::Wire(ProtocolError::Io(_)) => false,
            SessionError::Wire(ProtocolError::ConnectionClosed) => false,
            _ => true,
        }
    }
}

/// Configuration loading and validation errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Json(#[from] serde_json::Error),

    #[error("at least one database must be configured")]
    NoDatabases,

    #[error("database name \"{0}\" is not unique")]
    DuplicateDatabase(String),
}
