use tokio::sync::watch;

use nearchat_engine::state::{
    ChatMessage, ConnectionState, FileTransferProgress, MessageOrigin, StateWatch,
};

use crate::ui::print_prompt;

/// Spawns one watcher task per observable cell, printing changes as they
/// happen.
pub fn spawn_state_printer(state: StateWatch) {
    tokio::spawn(watch_connection_state(state.connection_state));
    tokio::spawn(watch_messages(state.messages));
    tokio::spawn(watch_verification(state.verification_code));
    tokio::spawn(watch_progress(state.file_transfer_progress));
    tokio::spawn(watch_errors(state.last_error));
}

async fn watch_connection_state(mut rx: watch::Receiver<ConnectionState>) {
    while rx.changed().await.is_ok() {
        let state = *rx.borrow_and_update();
        match state {
            ConnectionState::Disconnected => println!("\n  ⏹ Disconnected"),
            ConnectionState::Connecting => println!("\n  📡 Connecting..."),
            ConnectionState::Listening => println!("\n  ⏳ Listening for a peer..."),
            ConnectionState::AwaitingVerification => {
                println!("\n  🤝 Handshake complete — waiting for verification");
            }
            ConnectionState::Connected => println!("\n  ✔ Secure session active"),
        }
        print_prompt();
    }
}

async fn watch_messages(mut rx: watch::Receiver<Vec<ChatMessage>>) {
    let mut last_seen_id: u64 = 0;
    while rx.changed().await.is_ok() {
        let fresh: Vec<ChatMessage> = rx
            .borrow_and_update()
            .iter()
            .filter(|m| m.id > last_seen_id)
            .cloned()
            .collect();
        if fresh.is_empty() {
            continue;
        }
        println!();
        for message in &fresh {
            last_seen_id = message.id;
            if message.system {
                println!("  • {}", message.content);
            } else {
                match message.origin {
                    MessageOrigin::Mine => println!("  You: {}", message.content),
                    MessageOrigin::Theirs => println!("  Peer: {}", message.content),
                }
            }
        }
        print_prompt();
    }
}

async fn watch_verification(mut rx: watch::Receiver<Option<String>>) {
    while rx.changed().await.is_ok() {
        let code = rx.borrow_and_update().clone();
        if let Some(code) = code {
            println!();
            println!("  🔐 Verification code: {code}");
            println!("     Compare it with the code on the peer's screen,");
            println!("     then type 'accept' or 'reject'.");
            print_prompt();
        }
    }
}

async fn watch_progress(mut rx: watch::Receiver<Option<FileTransferProgress>>) {
    let mut in_flight = false;
    while rx.changed().await.is_ok() {
        let progress = rx.borrow_and_update().clone();
        match progress {
            Some(p) => {
                in_flight = true;
                // Overwrite the same line with \r for a compact progress bar.
                let bar_width: usize = 30;
                let filled = (usize::from(p.percent) * bar_width) / 100;
                let empty = bar_width - filled;
                let arrow = match p.direction {
                    nearchat_engine::state::TransferDirection::Sending => "📤",
                    nearchat_engine::state::TransferDirection::Receiving => "📥",
                };
                print!(
                    "\r  {arrow} {name} [{}{}] {pct:>3}%",
                    "█".repeat(filled),
                    "░".repeat(empty),
                    name = p.file_name,
                    pct = p.percent,
                );
                let _ = std::io::Write::flush(&mut std::io::stdout());
            }
            None => {
                if in_flight {
                    in_flight = false;
                    println!();
                    print_prompt();
                }
            }
        }
    }
}

async fn watch_errors(mut rx: watch::Receiver<Option<String>>) {
    while rx.changed().await.is_ok() {
        let error = rx.borrow_and_update().clone();
        if let Some(error) = error {
            println!("\n  ❌ {error}");
            print_prompt();
        }
    }
}
