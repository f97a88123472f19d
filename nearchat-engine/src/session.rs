//! One established peer session.
//!
//! Covers everything between a successful key exchange and teardown: the
//! verification gate, the encrypted frame channel, and file transfer in
//! both directions. The session is an actor — it exclusively owns the
//! connection and the session secret, interleaving command handling and
//! stream reads in a single `select!` loop, so writes are serialized by
//! construction and every observable mutation happens on one task.

use std::path::Path;

use anyhow::Context;
use bytes::BytesMut;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use nearchat_core::crypto::{self, SessionSecret};
use nearchat_core::error::Error;
use nearchat_core::transport::Connection;
use nearchat_core::wire::{self, Frame};

use crate::service::{ServiceCmd, ServiceConfig};
use crate::state::{ConnectionState, MessageOrigin, StateCells, TransferDirection};

/// Largest announced file size the receiver will honor. Anything bigger
/// is a hostile or corrupt header, and the stream behind it cannot be
/// trusted to resynchronize.
const MAX_FILE_SIZE: u64 = 1 << 30;

/// Why an established session ended.
#[derive(Debug)]
pub(crate) enum SessionEnd {
    /// `stop()` was requested: full teardown, no recovery.
    Stopped,
    /// The session failed. The error kind drives the recovery decision:
    /// rejections are deliberate and never recovered, stream and transfer
    /// failures feed the mode-specific recovery policy.
    Failed { error: Error, was_connected: bool },
    /// An explicit start-server request superseded the session.
    RestartServer { addr: String },
}

/// A session from AWAITING_VERIFICATION onwards.
///
/// Owns the connection and secret for its whole lifetime; both are
/// released (and the secret zeroized) when [`run`](ActiveSession::run)
/// returns.
pub(crate) struct ActiveSession<'a, C: Connection> {
    conn: C,
    secret: SessionSecret,
    /// Frame accumulator. Also seeded with bytes that arrived during the
    /// handshake, and temporarily holds raw file payload bytes while a
    /// receive is in progress.
    accum: BytesMut,
    cells: &'a mut StateCells,
    config: &'a ServiceConfig,
    local_accepted: bool,
    peer_accepted: bool,
    connected: bool,
    /// Commands that arrived mid-transfer, replayed once the transfer is
    /// done (writes must not interleave with raw file chunks).
    deferred: Vec<ServiceCmd>,
}

impl<'a, C: Connection> ActiveSession<'a, C> {
    pub fn new(
        conn: C,
        secret: SessionSecret,
        leftover: BytesMut,
        cells: &'a mut StateCells,
        config: &'a ServiceConfig,
    ) -> Self {
        Self {
            conn,
            secret,
            accum: leftover,
            cells,
            config,
            local_accepted: false,
            peer_accepted: false,
            connected: false,
            deferred: Vec::new(),
        }
    }

    /// Drives the session until it ends.
    ///
    /// Publishes the verification code and enters AWAITING_VERIFICATION,
    /// then runs the read loop — which already dispatches control frames
    /// during the verification phase — until teardown.
    pub async fn run(mut self, cmd_rx: &mut mpsc::Receiver<ServiceCmd>) -> SessionEnd {
        self.cells
            .set_verification_code(Some(crypto::verification_code(&self.secret)));
        self.cells.set_state(ConnectionState::AwaitingVerification);
        debug!(peer = %self.conn.peer(), "session started, awaiting verification");

        // The peer's first frames may already sit in the handshake leftover.
        if let Some(end) = self.drain_frames(cmd_rx).await {
            return end;
        }

        let mut buf = vec![0u8; self.config.chunk_size];
        loop {
            while let Some(cmd) = self.take_deferred() {
                if let Some(end) = self.handle_cmd(cmd, cmd_rx).await {
                    return end;
                }
            }

            tokio::select! {
                biased;

                cmd = cmd_rx.recv() => {
                    let Some(cmd) = cmd else { return SessionEnd::Stopped };
                    if let Some(end) = self.handle_cmd(cmd, cmd_rx).await {
                        return end;
                    }
                }

                res = self.conn.read(&mut buf) => {
                    match res {
                        Ok(0) => return self.lost("connection closed by peer"),
                        Ok(n) => {
                            self.accum.extend_from_slice(&buf[..n]);
                            if let Some(end) = self.drain_frames(cmd_rx).await {
                                return end;
                            }
                        }
                        Err(e) => return self.lost(format!("read failed: {e}")),
                    }
                }
            }
        }
    }

    fn take_deferred(&mut self) -> Option<ServiceCmd> {
        if self.deferred.is_empty() {
            None
        } else {
            Some(self.deferred.remove(0))
        }
    }

    fn lost(&self, reason: impl Into<String>) -> SessionEnd {
        SessionEnd::Failed {
            error: Error::Stream(reason.into()),
            was_connected: self.connected,
        }
    }

    fn transfer_aborted(&self, reason: impl Into<String>) -> SessionEnd {
        SessionEnd::Failed {
            error: Error::Transfer(reason.into()),
            was_connected: self.connected,
        }
    }

    /// AWAITING_VERIFICATION → CONNECTED once both sides have accepted.
    fn promote_if_verified(&mut self) {
        if self.local_accepted && self.peer_accepted && !self.connected {
            self.connected = true;
            self.cells.set_verification_code(None);
            self.cells.set_state(ConnectionState::Connected);
            debug!("verification complete on both sides, session connected");
        }
    }

    async fn handle_cmd(
        &mut self,
        cmd: ServiceCmd,
        cmd_rx: &mut mpsc::Receiver<ServiceCmd>,
    ) -> Option<SessionEnd> {
        match cmd {
            ServiceCmd::SendMessage { text } => {
                match self.send_frame(&Frame::Text {
                    content: text.clone(),
                }).await {
                    Ok(()) => self.cells.push_message(text, MessageOrigin::Mine, false),
                    Err(end) => {
                        self.cells.set_error("Failed to send message.");
                        return Some(end);
                    }
                }
                None
            }
            ServiceCmd::SendFile { path } => self.send_file(cmd_rx, &path).await,
            ServiceCmd::AcceptVerification => {
                if self.connected || self.local_accepted {
                    return None;
                }
                match self.send_frame(&Frame::Control { accepted: true }).await {
                    Ok(()) => {
                        self.local_accepted = true;
                        self.promote_if_verified();
                        None
                    }
                    Err(end) => Some(end),
                }
            }
            ServiceCmd::RejectVerification => {
                if self.connected {
                    return None;
                }
                // Best effort: the peer may already be gone, and we are
                // tearing down either way.
                let _ = self.send_frame(&Frame::Control { accepted: false }).await;
                Some(SessionEnd::Failed {
                    error: Error::RejectedLocally,
                    was_connected: false,
                })
            }
            ServiceCmd::StartServer { addr } => {
                if self.connected {
                    Some(SessionEnd::RestartServer { addr })
                } else {
                    // A session attempt is already active; starting again
                    // is a no-op.
                    None
                }
            }
            ServiceCmd::Connect { .. } => None,
            ServiceCmd::ClearError => {
                self.cells.clear_error();
                None
            }
            ServiceCmd::Stop => Some(SessionEnd::Stopped),
        }
    }

    /// Encrypts one frame and writes it as a single length-prefixed blob.
    async fn send_frame(&mut self, frame: &Frame) -> Result<(), SessionEnd> {
        let blob = crypto::encrypt(&frame.to_plaintext(), &self.secret);
        let framed = wire::encode_blob_to_bytes(&blob);
        match self.conn.write_all(&framed).await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.lost(format!("write failed: {e}"))),
        }
    }

    /// Decodes and dispatches every complete blob in the accumulator.
    async fn drain_frames(
        &mut self,
        cmd_rx: &mut mpsc::Receiver<ServiceCmd>,
    ) -> Option<SessionEnd> {
        loop {
            let blob = match wire::try_decode_blob(&mut self.accum) {
                Ok(Some(blob)) => blob,
                Ok(None) => return None,
                Err(e) => return Some(self.lost(format!("protocol violation: {e}"))),
            };

            let plaintext = match crypto::decrypt(&blob, &self.secret) {
                Ok(p) => p,
                Err(_) => {
                    // Not an encrypted frame. Skip it; a single bad blob
                    // is not fatal to the session.
                    warn!(len = blob.len(), "could not decrypt inbound blob, skipping");
                    continue;
                }
            };

            match Frame::from_plaintext(&plaintext) {
                Frame::Text { content } => {
                    debug!("chat message received");
                    self.cells.push_message(content, MessageOrigin::Theirs, false);
                }
                Frame::Control { accepted: true } => {
                    debug!("peer accepted verification");
                    self.peer_accepted = true;
                    self.promote_if_verified();
                }
                Frame::Control { accepted: false } => {
                    self.cells.set_error("Connection rejected by peer.");
                    return Some(SessionEnd::Failed {
                        error: Error::RejectedByPeer,
                        was_connected: false,
                    });
                }
                Frame::FileHeader { name, size } => {
                    if let Some(end) = self.receive_file(cmd_rx, &name, size).await {
                        return Some(end);
                    }
                }
            }
        }
    }

    /// Streams a local file to the peer: one encrypted header frame, then
    /// raw chunks demarcated by the announced byte count.
    async fn send_file(
        &mut self,
        cmd_rx: &mut mpsc::Receiver<ServiceCmd>,
        path: &Path,
    ) -> Option<SessionEnd> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unnamed".into());

        let (mut file, size) = match open_source(path).await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "could not open file for sending");
                self.cells.set_error("Failed to send the file.");
                return None;
            }
        };

        self.cells.start_transfer(&name, TransferDirection::Sending);

        if let Err(end) = self
            .send_frame(&Frame::FileHeader {
                name: name.clone(),
                size,
            })
            .await
        {
            self.cells.clear_transfer();
            return Some(end);
        }
        debug!(name = %name, size, "file header sent, streaming payload");

        let mut chunk = vec![0u8; self.config.chunk_size];
        let mut sent: u64 = 0;
        while sent < size {
            // stop() must stay responsive during a long transfer; every
            // other command waits until the transfer is done.
            let read = tokio::select! {
                biased;

                cmd = cmd_rx.recv() => {
                    match cmd {
                        None | Some(ServiceCmd::Stop) => {
                            self.cells.clear_transfer();
                            return Some(SessionEnd::Stopped);
                        }
                        Some(other) => {
                            self.deferred.push(other);
                            continue;
                        }
                    }
                }

                res = file.read(&mut chunk) => res,
            };

            match read {
                Ok(0) => {
                    // The source ended before the announced byte count;
                    // the peer is still waiting for bytes that will never
                    // come, so the stream cannot be reused.
                    self.cells.set_error("Failed to send the file.");
                    self.cells.clear_transfer();
                    return Some(self.transfer_aborted("file source ended before announced size"));
                }
                Ok(n) => {
                    if let Err(e) = self.conn.write_all(&chunk[..n]).await {
                        self.cells.clear_transfer();
                        return Some(self.lost(format!("write failed: {e}")));
                    }
                    sent += n as u64;
                    self.cells.set_transfer_percent(percent(sent, size));
                }
                Err(e) => {
                    warn!(error = %e, "file read failed mid-transfer");
                    self.cells.set_error("Failed to send the file.");
                    self.cells.clear_transfer();
                    return Some(self.transfer_aborted("file source failed before announced size"));
                }
            }
        }

        self.cells.set_transfer_percent(100);
        self.cells
            .push_message(format!("You sent a file: {name}"), MessageOrigin::Mine, true);
        self.cells.clear_transfer();
        debug!(name = %name, "file sent");
        None
    }

    /// Receives the raw payload announced by a file header.
    ///
    /// Payload bytes already sitting in the frame accumulator are consumed
    /// first; the rest is read from the stream and demarcated purely by
    /// byte count — never routed through the decrypt path, so a failed
    /// decrypt is never the boundary signal.
    async fn receive_file(
        &mut self,
        cmd_rx: &mut mpsc::Receiver<ServiceCmd>,
        name: &str,
        size: u64,
    ) -> Option<SessionEnd> {
        if size > MAX_FILE_SIZE {
            self.cells.set_error("Failed to receive the file.");
            return Some(self.transfer_aborted(format!(
                "announced file size {size} exceeds limit"
            )));
        }

        // Only the final path component, so a hostile name cannot escape
        // the receive directory.
        let file_name = Path::new(name)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "received_file".into());

        self.cells.push_message(
            format!("Receiving file: {file_name}..."),
            MessageOrigin::Theirs,
            true,
        );
        self.cells
            .start_transfer(&file_name, TransferDirection::Receiving);

        let dest = self.config.receive_dir.join(&file_name);
        let mut file = match File::create(&dest).await {
            Ok(f) => Some(f),
            Err(e) => {
                // The announced bytes still have to be consumed to keep
                // the stream in sync; drain them without storing.
                warn!(error = %e, path = %dest.display(), "could not create destination file");
                None
            }
        };
        let mut write_failed = file.is_none();

        let mut received: u64 = 0;
        let mut chunk = vec![0u8; self.config.chunk_size];
        while received < size {
            if !self.accum.is_empty() {
                #[allow(clippy::cast_possible_truncation)] // min() against a usize
                let take = (size - received).min(self.accum.len() as u64) as usize;
                let bytes = self.accum.split_to(take);
                if let Some(f) = file.as_mut() {
                    if let Err(e) = f.write_all(&bytes).await {
                        warn!(error = %e, "could not write received file");
                        file = None;
                        write_failed = true;
                    }
                }
                received += take as u64;
                self.cells.set_transfer_percent(percent(received, size));
                continue;
            }

            let read = tokio::select! {
                biased;

                cmd = cmd_rx.recv() => {
                    match cmd {
                        None | Some(ServiceCmd::Stop) => {
                            self.cells.clear_transfer();
                            return Some(SessionEnd::Stopped);
                        }
                        Some(other) => {
                            self.deferred.push(other);
                            continue;
                        }
                    }
                }

                res = self.conn.read(&mut chunk) => res,
            };

            match read {
                Ok(0) => {
                    self.cells.set_error("Failed to receive the file.");
                    self.cells.clear_transfer();
                    return Some(self.transfer_aborted("stream closed mid-transfer"));
                }
                Ok(n) => {
                    // Bytes beyond the announced size belong to the next
                    // frames; the drain at the top of the loop slices off
                    // exactly what the transfer still needs.
                    self.accum.extend_from_slice(&chunk[..n]);
                }
                Err(e) => {
                    self.cells.set_error("Failed to receive the file.");
                    self.cells.clear_transfer();
                    return Some(self.transfer_aborted(format!("read failed mid-transfer: {e}")));
                }
            }
        }

        if write_failed {
            self.cells.set_error("Failed to receive the file.");
            self.cells.clear_transfer();
            return None;
        }
        if let Some(f) = file.as_mut() {
            if let Err(e) = f.flush().await {
                warn!(error = %e, "could not flush received file");
                self.cells.set_error("Failed to receive the file.");
                self.cells.clear_transfer();
                return None;
            }
        }

        self.cells.set_transfer_percent(100);
        self.cells.push_message(
            format!("File received: {file_name}"),
            MessageOrigin::Theirs,
            true,
        );
        self.cells.clear_transfer();
        debug!(name = %file_name, "file received");
        None
    }
}

async fn open_source(path: &Path) -> anyhow::Result<(File, u64)> {
    let file = File::open(path)
        .await
        .with_context(|| format!("failed to open {}", path.display()))?;
    let size = file
        .metadata()
        .await
        .context("failed to read file metadata")?
        .len();
    Ok((file, size))
}

#[allow(clippy::cast_possible_truncation)] // result is always 0..=100
fn percent(done: u64, total: u64) -> u8 {
    if total == 0 {
        100
    } else {
        (done.min(total) * 100 / total) as u8
    }
}
