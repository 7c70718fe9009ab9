//! Command-line admin surface for the Federation Vault (spec §6 "Admin
//! surface"). Grounded on `freeq-server/src/bin/credential-issuer.rs`'s
//! `clap::Parser` CLI shape, adapted from a single long-running service to a
//! one-shot subcommand tool over the vault's JSON file.

use clap::{Parser, Subcommand};
use mesh_vault::{Role, Vault};

#[derive(Parser)]
#[command(name = "mesh-vault-admin", about = "Administer the federation vault")]
struct Args {
    /// Path to the vault's JSON file.
    #[arg(long, env = "MESH_VAULT_PATH", default_value = "vault/federation_tokens.json")]
    vault_path: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Register a new node and print its plaintext token (shown once).
    Register {
        node_id: String,
        #[arg(long, value_enum, default_value = "node")]
        role: RoleArg,
        #[arg(long = "allowed-ip")]
        allowed_ips: Vec<String>,
    },
    /// Replace a node's token; the previous token stops working immediately.
    Rotate { node_id: String },
    /// Soft-delete a node (keeps the record, marks it inactive).
    Revoke { node_id: String },
    /// Hard-delete a node's record entirely.
    Remove { node_id: String },
    /// Check whether a token is currently valid for a node.
    Verify {
        node_id: String,
        token: String,
        #[arg(long)]
        client_ip: Option<String>,
    },
    /// List all registered nodes (no secrets).
    List,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum RoleArg {
    Hub,
    Node,
    Contributor,
}

impl From<RoleArg> for Role {
    fn from(r: RoleArg) -> Self {
        match r {
            RoleArg::Hub => Role::Hub,
            RoleArg::Node => Role::Node,
            RoleArg::Contributor => Role::Contributor,
        }
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();
    let vault = Vault::open(&args.vault_path)?;

    match args.command {
        Command::Register { node_id, role, allowed_ips } => {
            let token = vault.register(&node_id, role.into(), allowed_ips)?;
            println!("node_id: {node_id}");
            println!("token:   {token}");
            println!("(this token is shown once; store it now)");
        }
        Command::Rotate { node_id } => {
            let token = vault.rotate(&node_id)?;
            println!("new token for {node_id}: {token}");
        }
        Command::Revoke { node_id } => {
            if vault.revoke(&node_id)? {
                println!("revoked {node_id}");
            } else {
                println!("no such node: {node_id}");
            }
        }
        Command::Remove { node_id } => {
            if vault.remove(&node_id)? {
                println!("removed {node_id}");
            } else {
                println!("no such node: {node_id}");
            }
        }
        Command::Verify { node_id, token, client_ip } => {
            let outcome = vault.verify(&node_id, &token, client_ip.as_deref());
            println!("{outcome:?}");
            if !outcome.is_valid() {
                std::process::exit(1);
            }
        }
        Command::List => {
            for summary in vault.list() {
                println!(
                    "{:<24} role={:?} active={} last_seen={:?}",
                    summary.node_id, summary.role, summary.active, summary.last_seen
                );
            }
        }
    }

    Ok(())
}
