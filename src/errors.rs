//! Error types for the protocol sessions and the execution engine

use thiserror::Error;

/// Errors on the wire. Any of these is fatal for its connection.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// remote side has closed the connection
    #[error("remote side has closed the connection")]
    EndOfStream,

    /// frame could not be read from the stream
    #[error("malformed frame: {0}")]
    Io(#[from] std::io::Error),

    /// frame length prefix exceeds the configured limit
    #[error("malformed frame: {0} byte frame exceeds the {1} byte limit")]
    FrameTooLarge(usize, usize),

    /// frame payload is not a valid envelope
    #[error("malformed frame: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// reply could not be serialized
    #[error("unable to encode reply: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
}

/// Errors from a per-channel dispatcher transition. Fatal only to the
/// logical channel that produced them.
#[derive(Error, Debug)]
pub enum DispatchError {
    /// message kind has no transition from the current state
    #[error("no transition from state {state:?} for message kind {kind}")]
    UnknownTransition { state: &'static str, kind: u64 },

    /// request arguments did not decode
    #[error("bad request arguments: {0}")]
    BadArguments(String),

    /// a reply could not be emitted downstream
    #[error("downstream reply failed: {0}")]
    Reply(#[from] ProtocolError),

    /// the execution engine rejected the request
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Startup-only configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("option {0} is invalid or unspecified")]
    Invalid(&'static str),
}

/// Errors from the image registry collaborator
#[derive(Error, Debug)]
pub enum RegistryError {
    /// network request error
    #[error("network request error: {0}")]
    Network(#[from] reqwest::Error),

    /// registry did not report a content digest for the reference
    #[error("registry did not report a content digest for {0}")]
    MissingDigest(String),

    /// manifest did not match either supported schema
    #[error("unsupported or malformed manifest: {0}")]
    Manifest(#[from] serde_json::Error),

    /// blob digest uses an algorithm we cannot verify
    #[error("unsupported digest algorithm in {0:?}")]
    UnsupportedDigest(String),

    /// calculated digest of downloaded content is not what we asked for
    #[error("content digest mismatch, expected {expected}, found {found}")]
    ContentDigestMismatch { expected: String, found: String },

    /// blob storage io error
    #[error("blob storage io error: {0}")]
    Storage(#[from] std::io::Error),
}

/// Errors reported by the isolation backend collaborator
#[derive(Error, Debug)]
pub enum BackendError {
    /// layer does not exist in the backend
    #[error("layer not found")]
    LayerNotFound,

    /// container does not exist in the backend
    #[error("container not found")]
    ContainerNotFound,

    /// the backend connection dropped
    #[error("backend connection error: {0}")]
    Connection(String),

    /// any other backend failure
    #[error("backend failure: {0}")]
    Failure(String),
}

/// Errors surfaced by [crate::engine::Engine] operations
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// io error while preparing directories or persisting the journal
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// journal file contents did not parse
    #[error("journal format error: {0}")]
    JournalFormat(#[from] serde_json::Error),

    /// too many spawn requests are already waiting for a permit
    #[error("spawning queue is full")]
    QueueFull,

    /// the caller cancelled while waiting for a spawn permit
    #[error("spawning has been cancelled")]
    SpawnCancelled,

    /// the caller cancelled an in-flight operation
    #[error("operation has been cancelled")]
    Cancelled,

    /// the engine is shut down
    #[error("engine is shut down")]
    Closed,

    /// the request profile cannot address a registry
    #[error("invalid profile: {0}")]
    InvalidProfile(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Backend(#[from] BackendError),
}
