//! Wire model: length-prefixed blobs and the plaintext frame model.
//!
//! Stream transports do not preserve write boundaries, so every logical
//! unit on the wire — the handshake public key and every encrypted
//! application frame — is carried as `length (4 bytes, big-endian) ||
//! payload`. Raw file payload bytes are the one exception: they follow
//! their header frame unframed and are consumed by byte count.

use anyhow::{Result, ensure};
use bytes::{Buf, BufMut, BytesMut};
use serde::Deserialize;

/// Size of the big-endian length prefix.
pub const LEN_PREFIX: usize = 4;
/// Upper bound on a single blob to protect against malicious peers.
///
/// Encrypted frames carry chat text, file headers, and control messages —
/// all small. Bulk file bytes bypass blob framing entirely.
pub const MAX_BLOB_LEN: usize = 64 * 1024;

/// Encodes one blob (length prefix + payload) into `buf`.
pub fn encode_blob(payload: &[u8], buf: &mut BytesMut) {
    buf.reserve(LEN_PREFIX + payload.len());
    #[allow(clippy::cast_possible_truncation)] // payloads are bounded by MAX_BLOB_LEN
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
}

/// Convenience wrapper that allocates and returns a new `BytesMut`.
#[must_use]
pub fn encode_blob_to_bytes(payload: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(LEN_PREFIX + payload.len());
    encode_blob(payload, &mut buf);
    buf
}

/// Attempts to decode one complete blob from the front of `buf`.
///
/// * `Ok(Some(payload))` — a full blob was present; its bytes have been
///   consumed from `buf`.
/// * `Ok(None)` — not enough bytes yet; `buf` is left untouched. The caller
///   should read more data and try again.
/// * `Err(..)` — the announced length exceeds [`MAX_BLOB_LEN`]. The stream
///   is desynchronized or hostile; the caller should close the connection.
///
/// # Errors
///
/// Returns an error when the length prefix exceeds [`MAX_BLOB_LEN`].
pub fn try_decode_blob(buf: &mut BytesMut) -> Result<Option<Vec<u8>>> {
    if buf.len() < LEN_PREFIX {
        return Ok(None);
    }

    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    ensure!(
        len <= MAX_BLOB_LEN,
        "blob too large: {len} bytes (max {MAX_BLOB_LEN})"
    );

    if buf.len() < LEN_PREFIX + len {
        return Ok(None);
    }

    buf.advance(LEN_PREFIX);
    Ok(Some(buf.split_to(len).to_vec()))
}

// ── Plaintext frame model ───────────────────────────────────────────

/// One decoded application frame.
///
/// The closed set of things a decrypted blob can mean. Raw file chunk
/// bytes are not frames — they follow a [`Frame::FileHeader`] on the wire
/// and are demarcated by its `size`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Free-form chat text.
    Text { content: String },
    /// Announces a raw file payload of exactly `size` bytes to follow.
    FileHeader { name: String, size: u64 },
    /// Verification gate control message.
    Control { accepted: bool },
}

/// JSON shape of structured plaintext payloads.
///
/// Anything that fails to parse as this — including objects with an
/// unknown or absent `"type"` — is treated as chat text.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum TaggedMessage {
    File { name: String, size: u64 },
    Verification { status: VerificationStatus },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum VerificationStatus {
    Accepted,
    Rejected,
}

impl Frame {
    /// Serializes the frame to the plaintext form that gets encrypted.
    ///
    /// Chat text travels as raw UTF-8; file headers and control messages
    /// travel as tagged JSON objects.
    #[must_use]
    pub fn to_plaintext(&self) -> Vec<u8> {
        match self {
            Frame::Text { content } => content.clone().into_bytes(),
            Frame::FileHeader { name, size } => {
                serde_json::json!({ "type": "file", "name": name, "size": size })
                    .to_string()
                    .into_bytes()
            }
            Frame::Control { accepted } => {
                let status = if *accepted { "accepted" } else { "rejected" };
                serde_json::json!({ "type": "verification", "status": status })
                    .to_string()
                    .into_bytes()
            }
        }
    }

    /// Interprets decrypted plaintext, falling back to chat text whenever
    /// it is not a known tagged message.
    #[must_use]
    pub fn from_plaintext(plaintext: &[u8]) -> Self {
        if let Ok(msg) = serde_json::from_slice::<TaggedMessage>(plaintext) {
            return match msg {
                TaggedMessage::File { name, size } => Frame::FileHeader { name, size },
                TaggedMessage::Verification { status } => Frame::Control {
                    accepted: matches!(status, VerificationStatus::Accepted),
                },
            };
        }
        Frame::Text {
            content: String::from_utf8_lossy(plaintext).into_owned(),
        }
    }
}
