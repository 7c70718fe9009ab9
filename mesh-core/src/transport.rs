//! Generic bidirectional framed-JSON transport over an iroh QUIC stream.
//!
//! Grounded on `freeq-server/src/s2s.rs`'s `handle_s2s_connection`: each
//! logical link is one `accept_bi`/`open_bi` QUIC stream carrying
//! newline-delimited JSON `Message`s. A dedicated write task owns the send
//! half (messages arrive over an `mpsc::Sender<Message>` so any number of
//! callers can enqueue writes without fighting over the stream), and a
//! read task owns the recv half, forwarding parsed messages to the caller
//! via another channel. The two tasks race in a `tokio::select!`; whichever
//! ends first tears down the link.
//!
//! When `sign_secret` is set, every line on the wire is a
//! `{data,timestamp,signature}` envelope (spec §4.1/§6 "every server-to-
//! server message is a signed envelope") wrapping the serialized `Message`,
//! rather than the bare JSON-RPC line — used for the Hub↔Peer and Peer↔Peer
//! links, not for plain tool-provider client connections.

use std::sync::Arc;
use std::time::Duration;

use iroh::endpoint::Connection;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, Notify};

use crate::envelope::{self, DEFAULT_REPLAY_WINDOW_S};
use crate::wire::Message;

/// A running link: send `Message`s via `outbound`, receive them via the
/// channel returned from `spawn`. Dropping `outbound` (or the connection
/// failing) ends the link. Calling `closer.notify_waiters()` (or
/// `peer::TransportHandle::force_close`, which wraps the same `Notify`)
/// tears the link down immediately (I6's "stale transport is force-closed").
pub struct Link {
    pub outbound: mpsc::Sender<Message>,
    pub generation: u64,
    pub closer: Arc<Notify>,
}

/// Shared secret + replay window for signed server-to-server links.
#[derive(Clone)]
pub struct SignConfig {
    pub secret: Arc<str>,
    pub window_s: i64,
}

impl SignConfig {
    pub fn new(secret: impl Into<Arc<str>>) -> Self {
        SignConfig {
            secret: secret.into(),
            window_s: DEFAULT_REPLAY_WINDOW_S,
        }
    }
}

fn encode_line(msg: &Message, sign: Option<&SignConfig>) -> Result<String, crate::error::MeshError> {
    match sign {
        None => msg.to_line(),
        Some(cfg) => {
            let data = serde_json::to_value(msg)
                .map_err(|e| crate::error::MeshError::MalformedEnvelope(e.to_string()))?;
            let env = envelope::sign(&cfg.secret, data, envelope::now_unix());
            let mut line =
                serde_json::to_string(&env).map_err(|e| crate::error::MeshError::MalformedEnvelope(e.to_string()))?;
            line.push('\n');
            Ok(line)
        }
    }
}

fn decode_line(line: &str, sign: Option<&SignConfig>) -> Result<Message, crate::error::MeshError> {
    match sign {
        None => Message::parse_line(line),
        Some(cfg) => {
            let env: envelope::SignedEnvelope = serde_json::from_str(line)
                .map_err(|e| crate::error::MeshError::MalformedEnvelope(e.to_string()))?;
            envelope::verify(&cfg.secret, &env, envelope::now_unix(), cfg.window_s)?;
            serde_json::from_value(env.data).map_err(|e| crate::error::MeshError::MalformedEnvelope(e.to_string()))
        }
    }
}

/// Spawn the read+write loops for one bidirectional QUIC stream. Returns a
/// `Link` handle plus the inbound message channel; the link tears itself
/// down (both tasks exit) when either direction fails, and signals that via
/// `closed` resolving.
pub async fn spawn(
    conn: Connection,
    incoming: bool,
    generation: u64,
    outbound_capacity: usize,
    sign: Option<SignConfig>,
) -> anyhow::Result<(Link, mpsc::Receiver<Message>, tokio::task::JoinHandle<()>)> {
    let (send, recv) = if incoming {
        conn.accept_bi().await?
    } else {
        conn.open_bi().await?
    };

    let (out_tx, mut out_rx) = mpsc::channel::<Message>(outbound_capacity);
    let (in_tx, in_rx) = mpsc::channel::<Message>(outbound_capacity);

    let write_sign = sign.clone();
    let write_handle = tokio::spawn(async move {
        let mut send = send;
        while let Some(msg) = out_rx.recv().await {
            let line = match encode_line(&msg, write_sign.as_ref()) {
                Ok(l) => l,
                Err(e) => {
                    tracing::warn!("failed to serialize outbound message: {e}");
                    continue;
                }
            };
            if let Err(e) = send.write_all(line.as_bytes()).await {
                tracing::debug!("transport write error: {e}");
                break;
            }
            if let Err(e) = send.flush().await {
                tracing::debug!("transport flush error: {e}");
                break;
            }
        }
        let _ = send.finish();
    });

    // iroh's RecvStream doesn't implement AsyncBufRead, so bridge raw reads
    // into a DuplexStream the way `s2s.rs`'s `handle_s2s_connection` does,
    // then line-split the duplex side.
    let (bridge_side, line_side) = tokio::io::duplex(16384);
    let (_bridge_read, mut bridge_write) = tokio::io::split(bridge_side);

    let bridge_handle = tokio::spawn(async move {
        let mut recv = recv;
        let mut buf = vec![0u8; 4096];
        loop {
            match recv.read(&mut buf).await {
                Ok(Some(n)) => {
                    if bridge_write.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
                Ok(None) | Err(_) => break,
            }
        }
        let _ = bridge_write.shutdown().await;
    });

    let read_sign = sign.clone();
    let read_handle = tokio::spawn(async move {
        let reader = BufReader::new(line_side);
        let mut lines = reader.lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => match decode_line(&line, read_sign.as_ref()) {
                    Ok(msg) => {
                        if in_tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => tracing::warn!("dropping invalid line: {e}"),
                },
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!("transport read error: {e}");
                    break;
                }
            }
        }
    });

    let closer = Arc::new(Notify::new());
    let joined_closer = Arc::clone(&closer);
    let joined = tokio::spawn(async move {
        tokio::select! {
            _ = &mut write_handle => {}
            _ = &mut read_handle => {}
            _ = joined_closer.notified() => {
                tracing::debug!("transport force-closed by re-registration (I6)");
                write_handle.abort();
                read_handle.abort();
            }
        }
        bridge_handle.abort();
    });

    Ok((
        Link {
            outbound: out_tx,
            generation,
            closer,
        },
        in_rx,
        joined,
    ))
}

/// Exponential backoff helper for reconnect loops (spec §4.7, grounded on
/// `freeq-server/src/s2s.rs`'s `connect_peer_with_retry`: 1s initial,
/// doubling, capped at 60s).
pub struct Backoff {
    current: Duration,
    max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff {
            current: Duration::from_secs(1),
            max: Duration::from_secs(60),
        }
    }
}

impl Backoff {
    pub fn next(&mut self) -> Duration {
        let wait = self.current;
        self.current = (self.current * 2).min(self.max);
        wait
    }

    pub fn reset(&mut self) {
        self.current = Duration::from_secs(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let mut b = Backoff::default();
        assert_eq!(b.next(), Duration::from_secs(1));
        assert_eq!(b.next(), Duration::from_secs(2));
        assert_eq!(b.next(), Duration::from_secs(4));
        b.reset();
        assert_eq!(b.next(), Duration::from_secs(1));
    }

    #[test]
    fn backoff_caps_at_max() {
        let mut b = Backoff::default();
        for _ in 0..10 {
            b.next();
        }
        assert_eq!(b.next(), Duration::from_secs(60));
    }

    #[test]
    fn unsigned_line_round_trips() {
        let msg = Message::notification(crate::wire::methods::PING, serde_json::json!({}));
        let line = encode_line(&msg, None).unwrap();
        let decoded = decode_line(line.trim_end(), None).unwrap();
        assert_eq!(decoded.method.as_deref(), Some(crate::wire::methods::PING));
    }

    #[test]
    fn signed_line_round_trips_and_rejects_tamper() {
        let cfg = SignConfig::new("topsecret");
        let msg = Message::notification(crate::wire::methods::PEER_GOSSIP, serde_json::json!({"peers": []}));
        let line = encode_line(&msg, Some(&cfg)).unwrap();
        let decoded = decode_line(line.trim_end(), Some(&cfg)).unwrap();
        assert_eq!(decoded.method.as_deref(), Some(crate::wire::methods::PEER_GOSSIP));

        let wrong = SignConfig::new("other-secret");
        assert!(decode_line(line.trim_end(), Some(&wrong)).is_err());
    }
}
