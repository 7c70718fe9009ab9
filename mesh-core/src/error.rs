//! Mesh-wide error kinds.
//!
//! One variant per error kind in the coordination core's error table —
//! recoverable errors are isolated to the offending connection or call and
//! never poison shared state (the Hub/Peer controllers match on these
//! variants to decide whether to close a connection, fail a single call,
//! or just log and continue).

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MeshError {
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("signature verification failed")]
    BadSignature,

    #[error("envelope timestamp outside replay window")]
    ExpiredTimestamp,

    #[error("unknown node: {0}")]
    UnknownNode(String),

    #[error("node revoked: {0}")]
    Revoked(String),

    #[error("client ip not allowed for node: {0}")]
    IpNotAllowed(String),

    #[error("message received before node/register")]
    NotRegistered,

    #[error("no provider advertises tool: {0}")]
    NoProvider(String),

    #[error("target node not connected: {0}")]
    NoSuchTarget(String),

    #[error("target became unreachable mid-call")]
    TargetUnreachable,

    #[error("call timed out")]
    Timeout,

    #[error("call cancelled")]
    Cancelled,

    #[error("no route to target: {0}")]
    NoRoute(String),

    #[error("method not found: {0}")]
    MethodNotFound(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl MeshError {
    /// JSON-RPC-ish numeric code, used when surfacing an error to a caller
    /// over the wire (spec §6: Response variant carries `{code, message}`).
    pub fn code(&self) -> i64 {
        match self {
            MeshError::MalformedEnvelope(_) => -32700,
            MeshError::MethodNotFound(_) => -32601,
            MeshError::BadSignature
            | MeshError::ExpiredTimestamp
            | MeshError::UnknownNode(_)
            | MeshError::Revoked(_)
            | MeshError::IpNotAllowed(_)
            | MeshError::NotRegistered => -32000,
            MeshError::NoProvider(_) => -32010,
            MeshError::NoSuchTarget(_) => -32011,
            MeshError::TargetUnreachable => -32012,
            MeshError::Timeout => -32013,
            MeshError::Cancelled => -32014,
            MeshError::NoRoute(_) => -32015,
            MeshError::Internal(_) => -32001,
        }
    }
}

pub type MeshResult<T> = Result<T, MeshError>;
