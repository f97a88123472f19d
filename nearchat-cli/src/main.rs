mod command;
mod event;
mod ui;

use std::path::PathBuf;

use clap::Parser;
use tokio::io::BufReader;
use tracing_subscriber::{EnvFilter, fmt};

use nearchat_engine::service::{Service, ServiceCmd, ServiceConfig};
use nearchat_engine::tcp::{TcpConnector, TcpListenerFactory};

use crate::command::Action;
use crate::ui::{print_banner, print_help, print_prompt, read_line};

/// nearchat — secure peer-to-peer chat and file drop.
///
/// Runs the pairing service and an interactive prompt. Start listening
/// with `listen`, or dial out with `connect <addr>`; once the handshake
/// completes, both sides compare the displayed 5-digit code and type
/// `accept` to open the session.
#[derive(Parser, Debug)]
#[command(name = "nearchat", version, about)]
struct Args {
    /// Default address for the `listen` command.
    #[arg(short, long, default_value = "0.0.0.0:4760")]
    listen: String,

    /// Directory where received files are stored.
    #[arg(short, long, default_value = "/tmp/nearchat")]
    receive_dir: PathBuf,

    /// Peer address to connect to immediately (client role).
    #[arg(short, long)]
    connect: Option<String>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Tracing goes to stderr so it doesn't mix with the interactive
    // prompt on stdout.  Default to "warn" for library crates so
    // only the CLI's own output is visible.
    fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("nearchat_cli=info,warn")),
        )
        .init();

    if let Err(e) = std::fs::create_dir_all(&args.receive_dir) {
        eprintln!(
            "Failed to create receive directory {}: {e}",
            args.receive_dir.display()
        );
        std::process::exit(1);
    }

    let config = ServiceConfig {
        receive_dir: args.receive_dir.clone(),
        ..ServiceConfig::default()
    };
    let handle = Service.start(TcpListenerFactory, TcpConnector, config);

    // Print state changes, incoming messages, verification prompts,
    // transfer progress, and errors as they happen.
    event::spawn_state_printer(handle.state.clone());

    let cmd_tx = handle.cmd_tx.clone();
    if let Some(addr) = &args.connect {
        if cmd_tx
            .send(ServiceCmd::Connect { addr: addr.clone() })
            .await
            .is_err()
        {
            eprintln!("Service stopped unexpectedly");
            std::process::exit(1);
        }
    }

    print_banner(&args.listen, &args.receive_dir);
    print_help();
    print_prompt();

    // ── Interactive prompt loop ─────────────────────────────────
    let mut stdin = BufReader::new(tokio::io::stdin());

    loop {
        let Some(line) = read_line(&mut stdin).await else {
            // EOF — shut down.
            break;
        };

        if line.is_empty() {
            print_prompt();
            continue;
        }

        match command::parse_line(&line, &args.listen) {
            Action::Send(cmd) => {
                if cmd_tx.send(cmd).await.is_err() {
                    break;
                }
            }
            Action::Help => print_help(),
            Action::Quit => break,
            Action::Invalid(message) => println!("  {message}"),
        }

        print_prompt();
    }

    println!("\n  Shutting down...");
    let _ = cmd_tx.send(ServiceCmd::Stop).await;
    // Give the session a moment to clean up.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
}
