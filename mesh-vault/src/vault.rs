//! Federation Vault: the persistent store of node identity and credentials.
//!
//! Grounded on `original_source/app/services/federation_vault.py`'s
//! `FederationVault` (register/verify/rotate/revoke, SHA-256 token digests,
//! single JSON file on disk, `0600`/`0700` permissions) but restructured the
//! way the teacher structures stateful stores it owns directly rather than
//! through SQLite (`freeq-server/src/policy/store.rs` uses `rusqlite`; the
//! vault's on-disk shape is spec-mandated as a single JSON file, so we keep
//! the teacher's locking discipline — one mutex, single-writer persistence
//! path — and swap SQLite for atomic write-temp-then-rename JSON).

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::VaultError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Hub,
    Node,
    Contributor,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    pub node_id: String,
    pub token_hash: String,
    pub role: Role,
    pub allowed_ips: Vec<String>,
    pub created_at: i64,
    pub last_seen: Option<i64>,
    pub active: bool,
}

/// Public-facing view of a node record; never carries `token_hash` (spec
/// §4.2 `list() → summaries (no secrets)`).
#[derive(Debug, Clone, Serialize)]
pub struct NodeSummary {
    pub node_id: String,
    pub role: Role,
    pub allowed_ips: Vec<String>,
    pub created_at: i64,
    pub last_seen: Option<i64>,
    pub active: bool,
}

impl From<&NodeRecord> for NodeSummary {
    fn from(n: &NodeRecord) -> Self {
        NodeSummary {
            node_id: n.node_id.clone(),
            role: n.role,
            allowed_ips: n.allowed_ips.clone(),
            created_at: n.created_at,
            last_seen: n.last_seen,
            active: n.active,
        }
    }
}

/// Outcome of a handshake-time credential check (spec §4.1: "the recipient
/// consults the Vault ... the vault answers Valid, UnknownNode, Revoked, or
/// IpNotAllowed").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
    Valid,
    UnknownNode,
    Revoked,
    IpNotAllowed,
    BadToken,
}

impl VerifyOutcome {
    pub fn is_valid(self) -> bool {
        matches!(self, VerifyOutcome::Valid)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct VaultFile {
    nodes: Vec<NodeRecord>,
    updated_at: i64,
}

/// The Federation Vault. One mutex guards the whole table; every mutating
/// operation persists before returning (spec §5: "single-writer persistence
/// path").
pub struct Vault {
    path: PathBuf,
    inner: Mutex<HashMap<String, NodeRecord>>,
}

fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

fn hash_token(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    hex::encode(digest)
}

/// Constant-time digest comparison — a verify() timing side-channel would
/// leak how many leading hex characters of a guessed token matched.
fn constant_time_eq(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

fn generate_token() -> String {
    use base64::Engine;
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

impl Vault {
    /// Open (loading existing state, if any) the vault at `path`, creating
    /// its parent directory with `0700` permissions if necessary.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, VaultError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|source| VaultError::Write {
                    path: parent.display().to_string(),
                    source,
                })?;
                set_dir_perms(parent)?;
            }
        }

        let nodes = if path.exists() {
            let raw = fs::read_to_string(&path).map_err(|source| VaultError::Read {
                path: path.display().to_string(),
                source,
            })?;
            let file: VaultFile = serde_json::from_str(&raw).map_err(|source| VaultError::Corrupt {
                path: path.display().to_string(),
                source,
            })?;
            file.nodes
                .into_iter()
                .map(|n| (n.node_id.clone(), n))
                .collect()
        } else {
            HashMap::new()
        };

        tracing::info!(path = %path.display(), count = nodes.len(), "loaded federation vault");

        Ok(Vault {
            path,
            inner: Mutex::new(nodes),
        })
    }

    fn save(&self, nodes: &HashMap<String, NodeRecord>) -> Result<(), VaultError> {
        let file = VaultFile {
            nodes: nodes.values().cloned().collect(),
            updated_at: now_unix(),
        };
        let json = serde_json::to_string_pretty(&file).expect("VaultFile always serializes");

        let tmp_path = self.path.with_extension("tmp");
        {
            let mut tmp = fs::File::create(&tmp_path).map_err(|source| VaultError::Write {
                path: tmp_path.display().to_string(),
                source,
            })?;
            tmp.write_all(json.as_bytes()).map_err(|source| VaultError::Write {
                path: tmp_path.display().to_string(),
                source,
            })?;
        }
        set_file_perms(&tmp_path)?;
        fs::rename(&tmp_path, &self.path).map_err(|source| VaultError::Write {
            path: self.path.display().to_string(),
            source,
        })?;
        Ok(())
    }

    /// `register(node_id, role, allowed_ips?) → plaintext_token` (spec
    /// §4.2). Fails `Conflict` if `node_id` already exists.
    pub fn register(
        &self,
        node_id: &str,
        role: Role,
        allowed_ips: Vec<String>,
    ) -> Result<String, VaultError> {
        let mut nodes = self.inner.lock();
        if nodes.contains_key(node_id) {
            return Err(VaultError::Conflict(node_id.to_string()));
        }
        let token = generate_token();
        let record = NodeRecord {
            node_id: node_id.to_string(),
            token_hash: hash_token(&token),
            role,
            allowed_ips,
            created_at: now_unix(),
            last_seen: None,
            active: true,
        };
        nodes.insert(node_id.to_string(), record);
        self.save(&nodes)?;
        tracing::info!(node_id, role = ?role, "registered federation node");
        Ok(token)
    }

    /// `verify(node_id, token, client_ip?) → bool` (spec §4.2, I5). On
    /// success, updates `last_seen` and persists.
    pub fn verify(&self, node_id: &str, token: &str, client_ip: Option<&str>) -> VerifyOutcome {
        let mut nodes = self.inner.lock();
        let Some(record) = nodes.get(node_id) else {
            tracing::warn!(node_id, "unknown node attempted auth");
            return VerifyOutcome::UnknownNode;
        };
        if !record.active {
            tracing::warn!(node_id, "revoked node attempted auth");
            return VerifyOutcome::Revoked;
        }
        if !record.allowed_ips.is_empty() {
            match client_ip {
                Some(ip) if record.allowed_ips.iter().any(|a| a == ip) => {}
                _ => {
                    tracing::warn!(node_id, ip = ?client_ip, "auth from unauthorized IP");
                    return VerifyOutcome::IpNotAllowed;
                }
            }
        }
        if !constant_time_eq(&hash_token(token), &record.token_hash) {
            tracing::warn!(node_id, "invalid token");
            return VerifyOutcome::BadToken;
        }

        let record = nodes.get_mut(node_id).expect("checked above");
        record.last_seen = Some(now_unix());
        if let Err(e) = self.save(&nodes) {
            tracing::error!(node_id, error = %e, "failed to persist last_seen update");
        }
        VerifyOutcome::Valid
    }

    /// `rotate(node_id) → plaintext_token` (spec §4.2, I3: atomically
    /// replaces `token_hash`).
    pub fn rotate(&self, node_id: &str) -> Result<String, VaultError> {
        let mut nodes = self.inner.lock();
        let record = nodes
            .get_mut(node_id)
            .ok_or_else(|| VaultError::NotFound(node_id.to_string()))?;
        let token = generate_token();
        record.token_hash = hash_token(&token);
        self.save(&nodes)?;
        tracing::info!(node_id, "rotated federation node token");
        Ok(token)
    }

    /// `revoke(node_id) → bool` (spec §4.2: soft delete, `active=false`).
    pub fn revoke(&self, node_id: &str) -> Result<bool, VaultError> {
        let mut nodes = self.inner.lock();
        match nodes.get_mut(node_id) {
            Some(record) => {
                record.active = false;
                self.save(&nodes)?;
                tracing::info!(node_id, "revoked federation node");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Hard delete (SUPPLEMENT — spec §4.2 describes only the soft-delete
    /// `revoke`; an admin surface still needs a way to actually forget a
    /// retired node rather than accumulate revoked records forever).
    pub fn remove(&self, node_id: &str) -> Result<bool, VaultError> {
        let mut nodes = self.inner.lock();
        let removed = nodes.remove(node_id).is_some();
        if removed {
            self.save(&nodes)?;
            tracing::info!(node_id, "removed federation node record");
        }
        Ok(removed)
    }

    /// `list() → summaries (no secrets)`.
    pub fn list(&self) -> Vec<NodeSummary> {
        let nodes = self.inner.lock();
        let mut summaries: Vec<NodeSummary> = nodes.values().map(NodeSummary::from).collect();
        summaries.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        summaries
    }

    pub fn get(&self, node_id: &str) -> Option<NodeSummary> {
        self.inner.lock().get(node_id).map(NodeSummary::from)
    }
}

#[cfg(unix)]
fn set_file_perms(path: &Path) -> Result<(), VaultError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|source| VaultError::Write {
        path: path.display().to_string(),
        source,
    })
}

#[cfg(not(unix))]
fn set_file_perms(_path: &Path) -> Result<(), VaultError> {
    Ok(())
}

#[cfg(unix)]
fn set_dir_perms(path: &Path) -> Result<(), VaultError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o700)).map_err(|source| VaultError::Write {
        path: path.display().to_string(),
        source,
    })
}

#[cfg(not(unix))]
fn set_dir_perms(_path: &Path) -> Result<(), VaultError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_tmp() -> (tempfile::TempDir, Vault) {
        let dir = tempfile::tempdir().unwrap();
        let vault = Vault::open(dir.path().join("federation_tokens.json")).unwrap();
        (dir, vault)
    }

    #[test]
    fn register_verify_revoke_round_trip() {
        let (_dir, vault) = open_tmp();
        let token = vault.register("nodeA", Role::Node, vec![]).unwrap();
        assert_eq!(vault.verify("nodeA", &token, Some("10.0.0.5")), VerifyOutcome::Valid);
        assert!(vault.get("nodeA").unwrap().last_seen.is_some());

        assert!(vault.revoke("nodeA").unwrap());
        assert_eq!(vault.verify("nodeA", &token, Some("10.0.0.5")), VerifyOutcome::Revoked);
    }

    #[test]
    fn rotate_invalidates_previous_token() {
        let (_dir, vault) = open_tmp();
        let t1 = vault.register("nodeB", Role::Node, vec![]).unwrap();
        let t2 = vault.rotate("nodeB").unwrap();

        assert_eq!(vault.verify("nodeB", &t1, None), VerifyOutcome::BadToken);
        assert_eq!(vault.verify("nodeB", &t2, None), VerifyOutcome::Valid);
    }

    #[test]
    fn register_conflict_on_duplicate_node_id() {
        let (_dir, vault) = open_tmp();
        vault.register("nodeC", Role::Node, vec![]).unwrap();
        let err = vault.register("nodeC", Role::Node, vec![]).unwrap_err();
        assert!(matches!(err, VaultError::Conflict(_)));
    }

    #[test]
    fn ip_allowlist_enforced_when_non_empty() {
        let (_dir, vault) = open_tmp();
        let token = vault
            .register("nodeD", Role::Node, vec!["10.0.0.5".to_string()])
            .unwrap();
        assert_eq!(vault.verify("nodeD", &token, Some("10.0.0.9")), VerifyOutcome::IpNotAllowed);
        assert_eq!(vault.verify("nodeD", &token, Some("10.0.0.5")), VerifyOutcome::Valid);
    }

    #[test]
    fn unknown_node_is_unknown() {
        let (_dir, vault) = open_tmp();
        assert_eq!(vault.verify("ghost", "whatever", None), VerifyOutcome::UnknownNode);
    }

    #[test]
    fn state_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("federation_tokens.json");
        let token = {
            let vault = Vault::open(&path).unwrap();
            vault.register("nodeE", Role::Hub, vec![]).unwrap()
        };
        let reopened = Vault::open(&path).unwrap();
        assert_eq!(reopened.verify("nodeE", &token, None), VerifyOutcome::Valid);
    }

    #[test]
    fn remove_is_a_hard_delete() {
        let (_dir, vault) = open_tmp();
        vault.register("nodeF", Role::Node, vec![]).unwrap();
        assert!(vault.remove("nodeF").unwrap());
        assert!(vault.get("nodeF").is_none());
        assert!(!vault.remove("nodeF").unwrap());
    }
}
