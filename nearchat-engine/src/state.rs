//! Observable session state.
//!
//! Every field a front-end observes is a single-writer
//! [`tokio::sync::watch`] cell mutated only by the service actor, so
//! readers on any scheduling context see each update atomically and never
//! observe a torn value.

use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::watch;

/// Connection lifecycle of the single active session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// No session and no attempt in progress.
    Disconnected,
    /// Outbound connection attempt in progress (client role).
    Connecting,
    /// Waiting for an inbound connection (server role).
    Listening,
    /// Handshake done; waiting for both sides to accept the code.
    AwaitingVerification,
    /// Verified and active.
    Connected,
}

/// Role the service took when the current attempt began.
///
/// Cleared on full teardown; drives handshake direction and the recovery
/// policy (server relistens, client reconnects to the last known peer).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ConnectionMode {
    None,
    Server,
    Client,
}

/// Who produced a chat message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageOrigin {
    Mine,
    Theirs,
}

/// One entry in the chat history.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChatMessage {
    /// Unique within one run of the service.
    pub id: u64,
    pub content: String,
    pub origin: MessageOrigin,
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
    /// System notices ("file received", "disconnected") rather than chat.
    pub system: bool,
}

/// Direction of the transfer currently in flight.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferDirection {
    Sending,
    Receiving,
}

/// Progress of the single in-flight file transfer.
///
/// Absent (`None` in its cell) whenever no transfer is running; at most
/// one transfer is in flight per session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileTransferProgress {
    pub file_name: String,
    /// 0–100, monotonically non-decreasing within one transfer.
    pub percent: u8,
    pub direction: TransferDirection,
}

/// Read side of every observable cell, handed to front-ends.
#[derive(Clone)]
pub struct StateWatch {
    pub connection_state: watch::Receiver<ConnectionState>,
    pub messages: watch::Receiver<Vec<ChatMessage>>,
    pub verification_code: watch::Receiver<Option<String>>,
    pub file_transfer_progress: watch::Receiver<Option<FileTransferProgress>>,
    pub last_error: watch::Receiver<Option<String>>,
}

/// Write side of every observable cell. Owned by the service actor, which
/// is the only writer.
pub(crate) struct StateCells {
    connection_state: watch::Sender<ConnectionState>,
    messages: watch::Sender<Vec<ChatMessage>>,
    verification_code: watch::Sender<Option<String>>,
    file_transfer_progress: watch::Sender<Option<FileTransferProgress>>,
    last_error: watch::Sender<Option<String>>,
    next_message_id: u64,
    max_messages: usize,
}

impl StateCells {
    pub fn new(max_messages: usize) -> (Self, StateWatch) {
        let (connection_state, connection_state_rx) =
            watch::channel(ConnectionState::Disconnected);
        let (messages, messages_rx) = watch::channel(Vec::new());
        let (verification_code, verification_code_rx) = watch::channel(None);
        let (file_transfer_progress, file_transfer_progress_rx) = watch::channel(None);
        let (last_error, last_error_rx) = watch::channel(None);

        let cells = Self {
            connection_state,
            messages,
            verification_code,
            file_transfer_progress,
            last_error,
            next_message_id: 1,
            max_messages,
        };
        let observers = StateWatch {
            connection_state: connection_state_rx,
            messages: messages_rx,
            verification_code: verification_code_rx,
            file_transfer_progress: file_transfer_progress_rx,
            last_error: last_error_rx,
        };
        (cells, observers)
    }

    pub fn set_state(&self, state: ConnectionState) {
        self.connection_state.send_replace(state);
    }

    /// Appends a chat message, evicting the oldest entry past the
    /// retention cap (chat is strictly chronological, so eviction is FIFO).
    pub fn push_message(&mut self, content: impl Into<String>, origin: MessageOrigin, system: bool) {
        let message = ChatMessage {
            id: self.next_message_id,
            content: content.into(),
            origin,
            timestamp_ms: now_ms(),
            system,
        };
        self.next_message_id += 1;

        let cap = self.max_messages;
        self.messages.send_modify(|history| {
            history.push(message);
            while history.len() > cap {
                history.remove(0);
            }
        });
    }

    pub fn clear_messages(&self) {
        self.messages.send_replace(Vec::new());
    }

    pub fn set_verification_code(&self, code: Option<String>) {
        self.verification_code.send_replace(code);
    }

    /// Overwrites the single last-error slot. Errors are never queued;
    /// only the most recent is retained until explicitly cleared.
    pub fn set_error(&self, message: impl Into<String>) {
        self.last_error.send_replace(Some(message.into()));
    }

    pub fn clear_error(&self) {
        self.last_error.send_replace(None);
    }

    pub fn start_transfer(&self, file_name: impl Into<String>, direction: TransferDirection) {
        self.file_transfer_progress.send_replace(Some(FileTransferProgress {
            file_name: file_name.into(),
            percent: 0,
            direction,
        }));
    }

    pub fn set_transfer_percent(&self, percent: u8) {
        self.file_transfer_progress.send_modify(|progress| {
            if let Some(p) = progress {
                p.percent = percent;
            }
        });
    }

    pub fn clear_transfer(&self) {
        self.file_transfer_progress.send_replace(None);
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
