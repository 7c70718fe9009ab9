//! Vault-specific error kinds. Kept separate from `mesh_core::MeshError`
//! since the vault is usable standalone (e.g. from the admin CLI) without
//! pulling in the rest of the mesh stack.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("node already registered: {0}")]
    Conflict(String),

    #[error("node not found: {0}")]
    NotFound(String),

    #[error("missing shared secret")]
    MissingSharedSecret,

    #[error("failed to read vault file at {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write vault file at {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed vault file at {path}: {source}")]
    Corrupt {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}
