/// Errors produced by the latica protocol layer.
///
/// Per-packet failures (decode, schema, crypto) are scoped to the call that
/// produced them; the engine logs and drops, it never aborts on them.
#[derive(Debug, thiserror::Error)]
pub enum LaticaError {
    #[error("field '{field}' is {size} bytes, max {max}")]
    SizeLimit {
        field: &'static str,
        size: usize,
        max: usize,
    },

    #[error("invalid packet type: {0}")]
    InvalidPacketType(u8),

    #[error("expected message to be an object")]
    NotAnObject,

    #[error("unexpected keys [{}]", .0.join(","))]
    UnexpectedKeys(Vec<String>),

    #[error("key '{0}' is required")]
    MissingKey(&'static str),

    #[error("expected '{key}' to be of type '{expected}', got '{got}'")]
    WrongType {
        key: &'static str,
        expected: &'static str,
        got: &'static str,
    },

    #[error("expected '{0}' to pass constraint assertion")]
    AssertionFailed(&'static str),

    #[error("no key registered for {0}")]
    NoKeys(String),

    #[error("sealed payload is too short to contain a signature")]
    Malformed,

    #[error("signature verification failed")]
    NotVerified,

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("invalid peer id: {0}")]
    InvalidPeerId(String),

    #[error("peer {0} is not known")]
    UnknownPeer(crate::types::PeerId),

    #[error("no return route for query {0}")]
    NoRoute(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to bind {socket} socket: {source}")]
    Bind {
        socket: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("engine is shut down")]
    Shutdown,
}

impl From<rmp_serde::encode::Error> for LaticaError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        LaticaError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for LaticaError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        LaticaError::Deserialization(e.to_string())
    }
}
