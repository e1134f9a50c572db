//! Error types for linkup.

use serde_json::{json, Value};

use crate::envelope::RpcError;

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Invalid JSON was received.
pub const PARSE_ERROR: i64 = -32700;
/// The JSON sent is not a valid request object.
pub const INVALID_REQUEST: i64 = -32600;
/// The requested method does not exist on the receiving side.
pub const METHOD_NOT_FOUND: i64 = -32601;
/// Invalid method parameters.
pub const INVALID_PARAMS: i64 = -32602;
/// Internal handler error.
pub const INTERNAL_ERROR: i64 = -32603;
/// Target peer is not registered anywhere in the cluster.
pub const PEER_NOT_FOUND: i64 = -32000;
/// Peer id is already registered.
pub const IDENTIFIER_TAKEN: i64 = -32001;
/// Declared sender does not match the connection's identity.
pub const INVALID_SENDER: i64 = -32002;

/// Main error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The peer id is already bound to another connection, locally or in the cluster.
    #[error("id \"{0}\" already taken")]
    IdentifierTaken(String),

    /// An inbound request named a method with no registered handler.
    #[error("Method not found (\"{0}\")")]
    MethodNotFound(String),

    /// A signal's `from` does not match the identity bound to the connection.
    #[error("Invalid id: params.from ({from:?}) does not match the id of the connection ({bound:?})")]
    InvalidSender {
        /// Sender declared in the signal.
        from: String,
        /// Identity bound to the connection, if any.
        bound: Option<String>,
    },

    /// The target peer is unknown locally and was not found via the cluster.
    #[error("Peer not found ({0})")]
    PeerNotFound(String),

    /// No response arrived before the request deadline.
    #[error("Timeout")]
    Timeout,

    /// The underlying channel is closed.
    #[error("Transport closed: {0}")]
    TransportClosed(String),

    /// The underlying channel failed.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Request parameters could not be interpreted.
    #[error("Invalid params: {0}")]
    InvalidParams(String),

    /// A peer tried to open a connection to itself.
    #[error("Cannot connect to yourself")]
    SelfConnect,

    /// Error response from the remote side without a well-known code.
    #[error("Remote error {}: {}", .0.code.unwrap_or(INTERNAL_ERROR), .0.message)]
    Remote(RpcError),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a transport-closed error.
    pub fn closed<S: Into<String>>(reason: S) -> Self {
        Self::TransportClosed(reason.into())
    }

    /// Create a transport error.
    pub fn transport<S: Into<String>>(reason: S) -> Self {
        Self::Transport(reason.into())
    }

    /// Wire error code for this error.
    pub fn code(&self) -> i64 {
        match self {
            Error::IdentifierTaken(_) => IDENTIFIER_TAKEN,
            Error::MethodNotFound(_) => METHOD_NOT_FOUND,
            Error::InvalidSender { .. } => INVALID_SENDER,
            Error::PeerNotFound(_) => PEER_NOT_FOUND,
            Error::InvalidParams(_) => INVALID_PARAMS,
            Error::Json(_) => INVALID_PARAMS,
            Error::Remote(e) => e.code.unwrap_or(INTERNAL_ERROR),
            _ => INTERNAL_ERROR,
        }
    }

    /// Convert into the error descriptor sent back in a response envelope.
    pub fn to_rpc_error(&self) -> RpcError {
        if let Error::Remote(e) = self {
            return e.clone();
        }
        let data = match self {
            Error::IdentifierTaken(id) | Error::PeerNotFound(id) => Some(json!({ "id": id })),
            Error::MethodNotFound(method) => Some(json!({ "method": method })),
            Error::InvalidSender { from, bound } => Some(json!({ "from": from, "bound": bound })),
            _ => None,
        };
        RpcError {
            message: self.to_string(),
            code: Some(self.code()),
            data,
        }
    }
}

fn data_str(data: &Option<Value>, key: &str) -> Option<String> {
    data.as_ref()?.get(key)?.as_str().map(str::to_owned)
}

impl From<RpcError> for Error {
    fn from(err: RpcError) -> Self {
        let mapped = match err.code {
            Some(METHOD_NOT_FOUND) => data_str(&err.data, "method").map(Error::MethodNotFound),
            Some(IDENTIFIER_TAKEN) => data_str(&err.data, "id").map(Error::IdentifierTaken),
            Some(PEER_NOT_FOUND) => data_str(&err.data, "id").map(Error::PeerNotFound),
            Some(INVALID_SENDER) => data_str(&err.data, "from").map(|from| Error::InvalidSender {
                from,
                bound: data_str(&err.data, "bound"),
            }),
            _ => None,
        };
        mapped.unwrap_or(Error::Remote(err))
    }
}
