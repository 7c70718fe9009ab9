//! Federation Vault: persistent node identity and credential store used by
//! the Hub and Peer controllers to authenticate server-to-server traffic.

pub mod error;
pub mod vault;

pub use error::VaultError;
pub use vault::{NodeRecord, NodeSummary, Role, Vault, VerifyOutcome};
