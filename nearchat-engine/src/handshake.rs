//! Role-asymmetric key exchange.
//!
//! The initiator writes its public key and then reads the peer's; the
//! responder reads first and then writes. The fixed ordering guarantees
//! one side makes progress first, so two correctly-paired peers cannot
//! deadlock even on a half-duplex-flavored stream. Each public key
//! travels as one length-prefixed blob and must arrive whole: a short
//! read or stream close during this phase is a failed handshake, never a
//! retry.

use bytes::BytesMut;
use tracing::debug;

use nearchat_core::crypto::{self, SessionSecret};
use nearchat_core::error::{Error, Result};
use nearchat_core::transport::Connection;
use nearchat_core::wire;

/// Which side of the exchange this peer plays.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// Client side: writes its key first, then reads.
    Initiator,
    /// Server side: reads the peer key first, then writes.
    Responder,
}

/// Runs the key exchange over `conn` and derives the session secret.
///
/// Also returns any bytes that arrived after the peer's key blob — the
/// peer may already have sent its first encrypted frame — so the caller
/// can seed its frame accumulator instead of losing them.
///
/// # Errors
///
/// Any I/O error, zero read, oversized blob, malformed key, or degenerate
/// shared secret yields [`Error::Handshake`] or [`Error::KeyAgreement`]
/// with the underlying cause preserved.
pub async fn perform<C: Connection>(
    conn: &mut C,
    role: Role,
) -> Result<(SessionSecret, BytesMut)> {
    let (secret, public) = crypto::generate_keypair();
    let our_blob = wire::encode_blob_to_bytes(public.as_bytes());
    debug!(
        role = ?role,
        key = %crypto::key_fingerprint(&public),
        "starting key exchange"
    );

    let mut leftover = BytesMut::with_capacity(256);
    let peer_key = match role {
        Role::Initiator => {
            write_key(conn, &our_blob).await?;
            debug!("initiator: public key sent");
            let key = read_key(conn, &mut leftover).await?;
            debug!("initiator: peer public key received");
            key
        }
        Role::Responder => {
            let key = read_key(conn, &mut leftover).await?;
            debug!("responder: peer public key received");
            write_key(conn, &our_blob).await?;
            debug!("responder: public key sent");
            key
        }
    };

    let shared = crypto::derive_shared_secret(secret, &peer_key)?;
    debug!("shared secret established");
    Ok((shared, leftover))
}

async fn write_key<C: Connection>(conn: &mut C, blob: &[u8]) -> Result<()> {
    conn.write_all(blob)
        .await
        .map_err(|e| Error::Handshake(format!("could not send public key: {e}")))
}

/// Reads until one complete length-prefixed key blob is available.
///
/// Bytes beyond the blob stay in `accum` for the caller.
async fn read_key<C: Connection>(conn: &mut C, accum: &mut BytesMut) -> Result<Vec<u8>> {
    let mut buf = [0u8; 256];
    loop {
        if let Some(blob) =
            wire::try_decode_blob(accum).map_err(|e| Error::Handshake(e.to_string()))?
        {
            return Ok(blob);
        }

        let n = conn
            .read(&mut buf)
            .await
            .map_err(|e| Error::Handshake(format!("could not read peer key: {e}")))?;
        if n == 0 {
            return Err(Error::Handshake("stream closed before peer key arrived".into()));
        }
        accum.extend_from_slice(&buf[..n]);
    }
}
