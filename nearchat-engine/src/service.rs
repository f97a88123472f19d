//! The session state machine.
//!
//! A single command-driven actor owns the whole connection lifecycle:
//! DISCONNECTED → LISTENING or CONNECTING → AWAITING_VERIFICATION →
//! CONNECTED → (loss) → DISCONNECTED. The actor exclusively owns the
//! stream and key material for the current session; teardown zeroes keys
//! and clears verification state atomically with the state transition.
//! Every blocking phase (connect, accept, handshake) runs under a hard
//! timeout and stays cancellable because the actor selects on the command
//! channel concurrently with the in-flight operation.

use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use nearchat_core::error::Error;
use nearchat_core::transport::{Connection, Connector, Listener, ListenerFactory};

use crate::handshake::{self, Role};
use crate::session::{ActiveSession, SessionEnd};
use crate::state::{ConnectionMode, ConnectionState, MessageOrigin, StateCells, StateWatch};

// ── Commands (front-end → service) ──────────────────────────────────

/// Commands sent by the front-end to control the service.
#[derive(Clone, Debug)]
pub enum ServiceCmd {
    /// Bind a listener on `addr` and wait for one peer (server role).
    ///
    /// A no-op while a session attempt is already active, except from
    /// CONNECTED, where it supersedes the existing session.
    StartServer { addr: String },
    /// Connect out to a peer (client role). A no-op while a session
    /// attempt is already active.
    Connect { addr: String },
    /// Encrypt and send a chat message to the peer.
    SendMessage { text: String },
    /// Stream a local file to the peer.
    SendFile { path: PathBuf },
    /// Accept the displayed verification code.
    AcceptVerification,
    /// Reject the displayed verification code and tear the session down.
    RejectVerification,
    /// Force a full teardown from any state, clearing chat history.
    Stop,
    /// Clear the retained last-error value.
    ClearError,
}

// ── Configuration ───────────────────────────────────────────────────

/// Configuration shared by every session the service runs.
#[derive(Clone, Debug)]
pub struct ServiceConfig {
    /// Directory where received files are stored.
    pub receive_dir: PathBuf,
    /// Chat history retention cap (oldest entries evicted first).
    pub max_messages: usize,
    /// Size of raw file chunks on the wire.
    pub chunk_size: usize,
    /// Hard timeout for an outbound connect.
    pub connect_timeout: Duration,
    /// Hard timeout for waiting on an inbound connection.
    pub accept_timeout: Duration,
    /// Hard timeout for the key exchange.
    pub handshake_timeout: Duration,
    /// Delay before the single client-side reconnect attempt.
    pub reconnect_delay: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            receive_dir: PathBuf::from("/tmp/nearchat"),
            max_messages: 200,
            chunk_size: 4096,
            connect_timeout: Duration::from_secs(15),
            accept_timeout: Duration::from_secs(120),
            handshake_timeout: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(3),
        }
    }
}

// ── Service handle ──────────────────────────────────────────────────

/// Handle returned by [`Service::start`]. Lets the caller send commands
/// and observe every state cell.
pub struct ServiceHandle {
    pub cmd_tx: mpsc::Sender<ServiceCmd>,
    pub state: StateWatch,
}

// ── Service ─────────────────────────────────────────────────────────

/// The nearchat service.
///
/// Runs at most one peer session at a time, in either server mode
/// (listen + accept) or client mode (connect out). Generic over:
/// - `F: ListenerFactory` — creates listeners for server mode
/// - `K: Connector`       — creates outbound connections for client mode
///
/// so the caller can plug in TCP or in-memory transports without changing
/// the state machine.
pub struct Service;

impl Service {
    /// Spawn the service actor and return a handle to control it.
    ///
    /// The service starts idle in DISCONNECTED — nothing listens and
    /// nothing connects until a command arrives.
    pub fn start<F, K>(self, factory: F, connector: K, config: ServiceConfig) -> ServiceHandle
    where
        F: ListenerFactory,
        K: Connector,
    {
        let (cmd_tx, cmd_rx) = mpsc::channel::<ServiceCmd>(32);
        let (cells, state) = StateCells::new(config.max_messages);

        info!("Spawning service actor");
        tokio::spawn(run_service_loop(factory, connector, config, cmd_rx, cells));

        ServiceHandle { cmd_tx, state }
    }
}

/// The outer state machine loop, extracted as a standalone async fn so
/// that the generic bounds don't infect `Service` itself.
async fn run_service_loop<F, K>(
    factory: F,
    connector: K,
    config: ServiceConfig,
    mut cmd_rx: mpsc::Receiver<ServiceCmd>,
    mut cells: StateCells,
) where
    F: ListenerFactory,
    K: Connector,
{
    debug!("Service actor running");

    loop {
        // DISCONNECTED: idle until a start command arrives.
        let Some(cmd) = cmd_rx.recv().await else { break };
        match cmd {
            ServiceCmd::StartServer { addr } => {
                info!(addr = %addr, mode = ?ConnectionMode::Server, "Starting server");
                let mut next = Some(addr);
                while let Some(listen_addr) = next {
                    next = serve(&factory, &config, &mut cmd_rx, &mut cells, listen_addr).await;
                }
                debug!(mode = ?ConnectionMode::None, "Server mode ended");
            }
            ServiceCmd::Connect { addr } => {
                info!(addr = %addr, mode = ?ConnectionMode::Client, "Starting client");
                let mut next =
                    run_client(&connector, &config, &mut cmd_rx, &mut cells, addr).await;
                while let Some(listen_addr) = next {
                    next = serve(&factory, &config, &mut cmd_rx, &mut cells, listen_addr).await;
                }
                debug!(mode = ?ConnectionMode::None, "Client mode ended");
            }
            ServiceCmd::Stop => {
                // Already disconnected; an explicit stop still clears the
                // chat history.
                full_stop(&mut cells);
            }
            ServiceCmd::ClearError => cells.clear_error(),
            ServiceCmd::SendMessage { .. } | ServiceCmd::SendFile { .. } => {
                cells.set_error("Cannot send: secure connection not established.");
            }
            ServiceCmd::AcceptVerification | ServiceCmd::RejectVerification => {
                // No verification in progress.
            }
        }
    }

    debug!("Service actor stopped");
}

/// One server cycle: bind, wait for a peer, run the session.
///
/// Returns `Some(addr)` when the service should immediately listen again
/// (loss of a connected session, or an explicit restart request) and
/// `None` when server mode is over.
async fn serve<F>(
    factory: &F,
    config: &ServiceConfig,
    cmd_rx: &mut mpsc::Receiver<ServiceCmd>,
    cells: &mut StateCells,
    addr: String,
) -> Option<String>
where
    F: ListenerFactory,
{
    cells.set_state(ConnectionState::Listening);

    let mut listener = match factory.bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            warn!(error = %e, "Failed to bind listener");
            cells.set_error(format!("Couldn't start server: {e}"));
            cells.set_state(ConnectionState::Disconnected);
            return None;
        }
    };
    info!(addr = %listener.local_addr(), "Listening for a peer");

    let deadline = tokio::time::Instant::now() + config.accept_timeout;
    let conn = loop {
        tokio::select! {
            biased;

            cmd = cmd_rx.recv() => {
                match cmd {
                    None | Some(ServiceCmd::Stop) => {
                        full_stop(cells);
                        return None;
                    }
                    Some(ServiceCmd::ClearError) => cells.clear_error(),
                    Some(ServiceCmd::SendMessage { .. } | ServiceCmd::SendFile { .. }) => {
                        cells.set_error("Cannot send: secure connection not established.");
                    }
                    // StartServer / Connect / accept / reject while
                    // already listening: idempotent no-ops.
                    Some(_) => {}
                }
            }

            () = tokio::time::sleep_until(deadline) => {
                warn!("No peer connected before the accept timeout");
                cells.set_error("No peer connected in time.");
                cells.set_state(ConnectionState::Disconnected);
                return None;
            }

            res = listener.accept() => {
                match res {
                    Ok(conn) => break conn,
                    Err(e) => {
                        warn!(error = %e, "Failed to accept connection");
                        cells.set_error(format!("Couldn't accept connection: {e}"));
                        cells.set_state(ConnectionState::Disconnected);
                        return None;
                    }
                }
            }
        }
    };

    // Strictly one active peer: stop accepting while the session runs.
    drop(listener);
    info!(peer = %conn.peer(), "Inbound connection");

    match run_established(conn, Role::Responder, config, cmd_rx, cells).await {
        Disposition::LostWhileConnected => Some(addr),
        Disposition::RestartServer(new_addr) => Some(new_addr),
        Disposition::Stopped
        | Disposition::HandshakeFailed
        | Disposition::Rejected
        | Disposition::LostBeforeConnected => None,
    }
}

/// Client mode: connect out and run the session.
///
/// On loss of a connected session, sleeps the configured delay and makes
/// exactly one reconnect attempt to the same peer; a failed attempt ends
/// client mode, leaving further retries to the caller. Returns
/// `Some(addr)` when an explicit start-server request superseded the
/// session.
async fn run_client<K>(
    connector: &K,
    config: &ServiceConfig,
    cmd_rx: &mut mpsc::Receiver<ServiceCmd>,
    cells: &mut StateCells,
    addr: String,
) -> Option<String>
where
    K: Connector,
{
    loop {
        cells.set_state(ConnectionState::Connecting);
        info!(addr = %addr, "Connecting to peer");

        let outcome = {
            let attempt = timeout(config.connect_timeout, connector.connect(&addr));
            tokio::pin!(attempt);
            loop {
                tokio::select! {
                    biased;

                    cmd = cmd_rx.recv() => {
                        match cmd {
                            None | Some(ServiceCmd::Stop) => {
                                full_stop(cells);
                                return None;
                            }
                            Some(ServiceCmd::ClearError) => cells.clear_error(),
                            Some(ServiceCmd::SendMessage { .. } | ServiceCmd::SendFile { .. }) => {
                                cells.set_error("Cannot send: secure connection not established.");
                            }
                            Some(_) => {}
                        }
                    }

                    res = &mut attempt => break res,
                }
            }
        };

        let conn = match outcome {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => {
                warn!(error = %e, "Failed to connect");
                cells.set_error(format!("Connection failed: {e}"));
                cells.set_state(ConnectionState::Disconnected);
                return None;
            }
            Err(_) => {
                warn!("Connect attempt timed out");
                cells.set_error("Connection timed out.");
                cells.set_state(ConnectionState::Disconnected);
                return None;
            }
        };
        info!(peer = %conn.peer(), "Outbound connection established");

        match run_established(conn, Role::Initiator, config, cmd_rx, cells).await {
            Disposition::LostWhileConnected => {
                info!(
                    addr = %addr,
                    delay = ?config.reconnect_delay,
                    "Reconnecting once after loss"
                );
                let sleep = tokio::time::sleep(config.reconnect_delay);
                tokio::pin!(sleep);
                loop {
                    tokio::select! {
                        biased;

                        cmd = cmd_rx.recv() => {
                            match cmd {
                                None | Some(ServiceCmd::Stop) => {
                                    full_stop(cells);
                                    return None;
                                }
                                Some(ServiceCmd::ClearError) => cells.clear_error(),
                                Some(_) => {}
                            }
                        }

                        () = &mut sleep => break,
                    }
                }
                // Loop back around for the single reconnect attempt; if
                // the connect itself fails, client mode ends above.
            }
            Disposition::RestartServer(new_addr) => return Some(new_addr),
            Disposition::Stopped
            | Disposition::HandshakeFailed
            | Disposition::Rejected
            | Disposition::LostBeforeConnected => return None,
        }
    }
}

/// How an established connection attempt resolved, from the service's
/// point of view.
enum Disposition {
    Stopped,
    HandshakeFailed,
    Rejected,
    LostBeforeConnected,
    LostWhileConnected,
    RestartServer(String),
}

/// Handshake + verification + session on one freshly opened connection.
async fn run_established<C: Connection>(
    mut conn: C,
    role: Role,
    config: &ServiceConfig,
    cmd_rx: &mut mpsc::Receiver<ServiceCmd>,
    cells: &mut StateCells,
) -> Disposition {
    // The exchange runs under its hard timeout and stays cancellable:
    // stop() drops the in-flight future, releasing the stream promptly.
    let outcome = {
        let exchange = timeout(config.handshake_timeout, handshake::perform(&mut conn, role));
        tokio::pin!(exchange);
        loop {
            tokio::select! {
                biased;

                cmd = cmd_rx.recv() => {
                    match cmd {
                        None | Some(ServiceCmd::Stop) => {
                            full_stop(cells);
                            return Disposition::Stopped;
                        }
                        Some(ServiceCmd::ClearError) => cells.clear_error(),
                        Some(ServiceCmd::SendMessage { .. } | ServiceCmd::SendFile { .. }) => {
                            cells.set_error("Cannot send: secure connection not established.");
                        }
                        Some(_) => {}
                    }
                }

                res = &mut exchange => break res,
            }
        }
    };

    let (secret, leftover) = match outcome {
        Ok(Ok(pair)) => pair,
        Ok(Err(e)) => {
            warn!(error = %e, "Key exchange failed");
            cells.set_error("Could not create a secure connection.");
            cells.set_state(ConnectionState::Disconnected);
            return Disposition::HandshakeFailed;
        }
        Err(_) => {
            warn!("Key exchange timed out");
            cells.set_error("Could not create a secure connection.");
            cells.set_state(ConnectionState::Disconnected);
            return Disposition::HandshakeFailed;
        }
    };

    let session = ActiveSession::new(conn, secret, leftover, cells, config);
    // The session owns the stream and secret; both are released (and the
    // secret zeroized) the moment `run` returns.
    match session.run(cmd_rx).await {
        SessionEnd::Stopped => {
            full_stop(cells);
            Disposition::Stopped
        }
        SessionEnd::Failed {
            error,
            was_connected,
        } => {
            warn!(error = %error, was_connected, "Session ended");
            match error {
                // A rejection is a deliberate signal, not a transient
                // failure: no recovery.
                Error::RejectedLocally | Error::RejectedByPeer => {
                    teardown(cells, false);
                    Disposition::Rejected
                }
                // A transfer abort already surfaced its own error; the
                // stream behind it is dead either way.
                Error::Transfer(_) => {
                    teardown(cells, was_connected);
                    if was_connected {
                        Disposition::LostWhileConnected
                    } else {
                        Disposition::LostBeforeConnected
                    }
                }
                _ => {
                    cells.set_error("Connection was lost.");
                    teardown(cells, was_connected);
                    if was_connected {
                        Disposition::LostWhileConnected
                    } else {
                        Disposition::LostBeforeConnected
                    }
                }
            }
        }
        SessionEnd::RestartServer { addr } => {
            info!(addr = %addr, "Session superseded by restart-server request");
            teardown(cells, true);
            Disposition::RestartServer(addr)
        }
    }
}

/// Clears per-session observable state. The stream and secret were
/// already dropped with the session. Emits the disconnect notice only for
/// sessions that had reached CONNECTED.
fn teardown(cells: &mut StateCells, was_connected: bool) {
    if was_connected {
        cells.push_message("-- Disconnected --", MessageOrigin::Theirs, true);
    }
    cells.set_verification_code(None);
    cells.clear_transfer();
    cells.set_state(ConnectionState::Disconnected);
}

/// An explicit stop: teardown plus chat history clear.
fn full_stop(cells: &mut StateCells) {
    cells.set_verification_code(None);
    cells.clear_transfer();
    cells.set_state(ConnectionState::Disconnected);
    cells.clear_messages();
}
